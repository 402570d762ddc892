use std::time::Duration;

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, ResponseError,
    dev::Server,
    http::{Method, StatusCode},
    web,
};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::forward::{ProxyError, Upstream, healthz, relay_response};
use super::keys::{AuthError, KeyRegistry, credential_from_query};
use crate::api::validation::ErrorResponse;
use crate::config::GatewayConfig;

/// Immutable configuration of the authenticating gateway
pub struct GatewayState {
    pub upstream: Upstream,
    pub keys: KeyRegistry,
    /// External route prefix mapped onto the bridge's root, e.g. `/api`
    pub route_prefix: String,
    /// Extra attempts for idempotent reads after a transport failure
    pub read_retries: u32,
    pub retry_base_delay: Duration,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route for {0}")]
    NotRouted(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(#[from] ProxyError),
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotRouted(_) => StatusCode::NOT_FOUND,
            GatewayError::Auth(AuthError::OutOfScope { .. }) => StatusCode::FORBIDDEN,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream(e) => e.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::NotRouted(path) => HttpResponse::NotFound()
                .json(ErrorResponse::message("Not found", format!("No route for {}", path))),
            GatewayError::Auth(e) => {
                warn!("Rejected request: {}", e);
                let summary = match e {
                    AuthError::OutOfScope { .. } => "Forbidden",
                    _ => "Unauthorized",
                };
                HttpResponse::build(self.status_code())
                    .json(ErrorResponse::message(summary, e.to_string()))
            }
            GatewayError::Upstream(e) => e.error_response(),
        }
    }
}

/// Path below the configured prefix, or None when the request is outside it
pub fn strip_route_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(prefix) {
        Some("") => Some("/"),
        Some(rest) if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

/// Request path with dot segments resolved the way the upstream URL will resolve them
///
/// Covers `..`, `.`, their percent-encoded spellings and backslash separators.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut url = Url::parse("http://gateway.invalid/").ok()?;
    url.set_path(path);
    Some(url.path().to_string())
}

/// First path segment, which is what key scopes are granted on
pub fn route_family(path: &str) -> &str {
    path.trim_start_matches('/').split('/').next().unwrap_or_default()
}

/// Only reads can be replayed without risking a duplicate job
fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
    exponential + Duration::from_millis(jitter_ms)
}

/// Admission control followed by forwarding to the bridge
///
/// Rejected requests never leave this hop.
pub async fn admit(
    state: web::Data<GatewayState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, GatewayError> {
    let normalized =
        normalize_path(req.path()).ok_or_else(|| GatewayError::NotRouted(req.path().to_string()))?;
    let path = strip_route_prefix(&state.route_prefix, &normalized)
        .ok_or_else(|| GatewayError::NotRouted(req.path().to_string()))?;

    let family = route_family(path);
    let credential = credential_from_query(req.query_string());
    let api_key = state.keys.authorize(credential.as_deref(), family)?;
    debug!("Admitted {} {} for {}", req.method(), path, api_key.name);

    let attempts = if is_idempotent(req.method()) {
        state.read_retries + 1
    } else {
        1
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = state.upstream.send(&req, path, body.clone()).await;

        let retryable = match &result {
            Ok(response) => is_retryable_status(response.status().as_u16()),
            Err(e) => e.is_transport(),
        };
        if !retryable || attempt >= attempts {
            if attempt > 1 {
                info!("{} {} finished after {} attempts", req.method(), path, attempt);
            }
            return Ok(relay_response(result?));
        }

        let delay = backoff(state.retry_base_delay, attempt);
        warn!(
            "Attempt {}/{} for {} {} failed, retrying in {:?}",
            attempt, attempts, req.method(), path, delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// Routes of the gateway: local `/healthz`, everything else admitted or rejected
pub fn gateway_config(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .default_service(web::to(admit));
}

/// Bind the authenticating gateway in front of the bridge
pub fn run(config: &GatewayConfig, keys: KeyRegistry) -> std::io::Result<Server> {
    let hop = &config.hop;
    let upstream = Upstream::new("bridge", hop.upstream_url.clone(), hop.upstream_timeout)
        .map_err(std::io::Error::other)?;
    let max_payload_size = hop.server.max_payload_size;

    let state = web::Data::new(GatewayState {
        upstream: upstream.clone(),
        keys,
        route_prefix: config.route_prefix.clone(),
        read_retries: config.read_retries,
        retry_base_delay: config.retry_base_delay,
    });

    info!(
        "Gateway serving {} and forwarding to {} (timeout {:?}, {} read retries)",
        config.route_prefix, hop.upstream_url, hop.upstream_timeout, config.read_retries
    );

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::Data::new(upstream.clone()))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .configure(gateway_config)
    })
    .bind(&hop.server.bind_addr)?
    .run();

    info!("Gateway listening on http://{}", hop.server.bind_addr);
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::forward::tests::{spawn_upstream, upstream_for};
    use actix_web::test;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEYS: &str = r#"{"keys": [
        {"name": "client", "key": "good", "scope": ["processes", "jobs"]},
        {"name": "reader", "key": "read-only", "scope": ["jobs"]}
    ]}"#;

    fn state(upstream: Upstream, prefix: &str) -> web::Data<GatewayState> {
        web::Data::new(GatewayState {
            upstream,
            keys: KeyRegistry::from_json(KEYS).unwrap(),
            route_prefix: prefix.to_string(),
            read_retries: 2,
            retry_base_delay: Duration::from_millis(5),
        })
    }

    /// Upstream that counts calls and answers the first `failures` with 503
    fn counting_upstream(failures: usize) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let addr = spawn_upstream(move |cfg| {
            let counter = counter.clone();
            cfg.default_service(web::to(move |req: HttpRequest| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        HttpResponse::ServiceUnavailable().finish()
                    } else if req.method() == Method::POST {
                        HttpResponse::Created()
                            .insert_header(("Location", "https://host/api/jobs/J1"))
                            .finish()
                    } else {
                        HttpResponse::Ok()
                            .insert_header(("X-Upstream-Path", req.path().to_string()))
                            .json(serde_json::json!({"status": "running"}))
                    }
                }
            }));
        });
        (addr, calls)
    }

    /// Raw upstream that closes the first `drops` connections without answering
    async fn flaky_upstream(drops: usize) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        actix_web::rt::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                if counter.fetch_add(1, Ordering::SeqCst) < drops {
                    drop(socket);
                    continue;
                }
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            }
        });
        (addr, accepted)
    }

    #[std::prelude::v1::test]
    fn maps_the_route_prefix() {
        assert_eq!(strip_route_prefix("/api", "/api/jobs/1"), Some("/jobs/1"));
        assert_eq!(strip_route_prefix("/api/", "/api"), Some("/"));
        assert_eq!(strip_route_prefix("/api", "/apix/jobs"), None);
        assert_eq!(strip_route_prefix("/api", "/jobs"), None);
        assert_eq!(strip_route_prefix("/", "/jobs"), Some("/jobs"));
        assert_eq!(route_family("/jobs/1/results"), "jobs");
        assert_eq!(route_family("/processes"), "processes");
        assert_eq!(route_family("/"), "");
    }

    #[std::prelude::v1::test]
    fn dot_segments_are_resolved_before_routing() {
        assert_eq!(normalize_path("/jobs/../processes/x").unwrap(), "/processes/x");
        assert_eq!(normalize_path("/jobs/%2e%2e/processes").unwrap(), "/processes");
        assert_eq!(normalize_path("/jobs/.%2E/processes").unwrap(), "/processes");
        assert_eq!(normalize_path("/api/jobs/./J1").unwrap(), "/api/jobs/J1");
        assert_eq!(normalize_path("/jobs/J1").unwrap(), "/jobs/J1");
    }

    #[std::prelude::v1::test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        assert!(backoff(base, 1) >= base && backoff(base, 1) <= Duration::from_millis(150));
        assert!(backoff(base, 3) >= Duration::from_millis(400));
    }

    #[actix_web::test]
    async fn requests_without_valid_keys_never_reach_upstream() {
        let (addr, calls) = counting_upstream(0);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/api"))
                .default_service(web::to(admit)),
        )
        .await;

        let cases = [
            ("/api/processes/execute/execution", StatusCode::UNAUTHORIZED),
            ("/api/processes/execute/execution?key=wrong", StatusCode::UNAUTHORIZED),
            ("/api/processes/execute/execution?key=read-only", StatusCode::FORBIDDEN),
            ("/elsewhere/processes?key=good", StatusCode::NOT_FOUND),
        ];
        for (uri, expected) in cases {
            let req = test::TestRequest::post()
                .uri(uri)
                .insert_header(("Prefer", "respond-async"))
                .set_json(serde_json::json!({"model": "carbon", "args": {}}))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), expected, "{}", uri);
            assert!(resp.headers().get("Location").is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn dot_segments_cannot_escape_the_key_scope() {
        let (addr, calls) = counting_upstream(0);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/api"))
                .default_service(web::to(admit)),
        )
        .await;

        for uri in [
            "/api/jobs/../processes/execute/execution?key=read-only",
            "/api/jobs/%2e%2e/processes/execute/execution?key=read-only",
            "/api/jobs/%2E%2e/%2e%2E/api/processes/execute/execution?key=read-only",
        ] {
            let req = test::TestRequest::post()
                .uri(uri)
                .set_json(serde_json::json!({"model": "carbon", "args": {}}))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{}", uri);
        }

        // Escaping the prefix altogether is simply not routed
        let req = test::TestRequest::get()
            .uri("/api/../processes?key=good")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn forwards_the_normalized_path() {
        let (addr, calls) = counting_upstream(0);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/api"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/jobs/./J1?key=read-only")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Upstream-Path").unwrap(), "/jobs/J1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn healthz_needs_no_key_and_is_not_forwarded() {
        let (addr, calls) = counting_upstream(0);
        let upstream = upstream_for(addr, "bridge");
        let app = test::init_service(
            App::new()
                .app_data(state(upstream.clone(), "/api"))
                .app_data(web::Data::new(upstream))
                .configure(gateway_config),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn admitted_requests_are_forwarded_without_the_prefix() {
        let (addr, calls) = counting_upstream(0);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/api"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/processes/execute/execution?key=good")
            .set_json(serde_json::json!({"model": "carbon", "args": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("Location").unwrap(), "https://host/api/jobs/J1");

        let req = test::TestRequest::get().uri("/api/jobs/J1?key=read-only").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Upstream-Path").unwrap(), "/jobs/J1");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn reads_are_retried_on_upstream_unavailability() {
        let (addr, calls) = counting_upstream(2);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::get().uri("/jobs/J1?key=good").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn reads_are_retried_on_transport_errors() {
        let (addr, accepted) = flaky_upstream(1).await;
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::get().uri("/jobs/J1?key=good").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, web::Bytes::from_static(b"ok"));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn submissions_are_not_retried_on_transport_errors() {
        let (addr, accepted) = flaky_upstream(1).await;
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/processes/execute/execution?key=good")
            .set_json(serde_json::json!({"model": "carbon", "args": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn submissions_are_never_retried() {
        let (addr, calls) = counting_upstream(1);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/processes/execute/execution?key=good")
            .set_json(serde_json::json!({"model": "carbon", "args": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn reads_give_up_after_bounded_retries() {
        let (addr, calls) = counting_upstream(usize::MAX);
        let app = test::init_service(
            App::new()
                .app_data(state(upstream_for(addr, "bridge"), "/"))
                .default_service(web::to(admit)),
        )
        .await;

        let req = test::TestRequest::get().uri("/jobs/J1/results?key=good").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
