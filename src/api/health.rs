use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;
use tracing::error;

use crate::db::JobStore;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// General health check including job store connectivity.
#[get("/health")]
async fn health_check(store: web::Data<JobStore>) -> impl Responder {
    match store.ping().await {
        Ok(_) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy".to_string(),
            store: store.backend().to_string(),
            error: None,
        }),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "unhealthy".to_string(),
                store: "disconnected".to_string(),
                error: Some(format!("Store error: {}", e)),
            })
        }
    }
}

/// Readiness check endpoint
///
/// Returns 503 while the job store is unreachable so the bridge stops routing
/// submissions here; recovers on its own once the store returns.
#[get("/ready")]
async fn readiness_check(store: web::Data<JobStore>) -> impl Responder {
    match store.ping().await {
        Ok(_) => HttpResponse::Ok().json(HealthResponse {
            status: "ready".to_string(),
            store: store.backend().to_string(),
            error: None,
        }),
        Err(e) => {
            error!("Readiness check failed: job store unavailable: {:?}", e);
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "not_ready".to_string(),
                store: "disconnected".to_string(),
                error: Some(format!("Store unavailable: {}", e)),
            })
        }
    }
}

/// Liveness check endpoint
///
/// Simple check that the process is alive. Does not check dependencies.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive".to_string(),
        store: "not_checked".to_string(),
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
