use actix_web::{
    HttpRequest, HttpResponse, get, http::header, post,
    web::{Data, Path, Query, ServiceConfig},
};
use actix_web_validator::Json;

use super::dto::{JobList, ListJobsQuery, ResultDocument, StatusDocument};
use super::models::JobSpec;
use super::service::{JobService, ServiceError};

pub const PREFER: &str = "Prefer";
pub const RESPOND_ASYNC: &str = "respond-async";

/// True when the `Prefer` header carries the `respond-async` preference
fn prefers_async(req: &HttpRequest) -> bool {
    req.headers()
        .get_all(PREFER)
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|pref| pref.trim().eq_ignore_ascii_case(RESPOND_ASYNC))
}

/// Submit a job; the `Location` header is the authoritative handle to it
#[post("/processes/{process_id}/execution")]
async fn execute(
    service: Data<JobService>,
    process_id: Path<String>,
    req: HttpRequest,
    spec: Json<JobSpec>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.submit(&process_id, &spec).await?;

    let mut response = HttpResponse::Created();
    response.insert_header((header::LOCATION, service.job_url(job.id)));
    if prefers_async(&req) {
        response.insert_header(("Preference-Applied", RESPOND_ASYNC));
    }
    Ok(response.json(StatusDocument::from(&job)))
}

#[get("/jobs")]
async fn list_jobs(
    service: Data<JobService>,
    query: Query<ListJobsQuery>,
) -> Result<HttpResponse, ServiceError> {
    let query = query.into_inner();
    let jobs: Vec<StatusDocument> = service
        .list(query.status, query.limit)
        .await?
        .iter()
        .map(StatusDocument::from)
        .collect();

    Ok(HttpResponse::Ok().json(JobList {
        count: jobs.len(),
        jobs,
    }))
}

/// Status document; a failed job is still a successful read
#[get("/jobs/{job_id}")]
async fn get_job(
    service: Data<JobService>,
    job_id: Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.status(&job_id).await?;
    Ok(HttpResponse::Ok().json(StatusDocument::from(&job)))
}

#[get("/jobs/{job_id}/results")]
async fn get_job_results(
    service: Data<JobService>,
    job_id: Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.result(&job_id).await?;
    Ok(HttpResponse::Ok().json(ResultDocument::from(&job)))
}

pub fn job_config(config: &mut ServiceConfig) {
    config
        .service(execute)
        .service(list_jobs)
        .service(get_job)
        .service(get_job_results);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::job::models::JobStatus;
    use crate::api::validation::{ErrorResponse, json_config};
    use crate::db::JobStore;
    use crate::db::models::JobOutcome;
    use crate::processes::ProcessRegistry;
    use actix_web::{App, http::StatusCode, test, web};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use url::Url;
    use uuid::Uuid;

    fn job_service(store: JobStore) -> web::Data<JobService> {
        web::Data::new(JobService::new(
            store,
            Arc::new(ProcessRegistry::new(vec!["run".into()], vec!["check".into()])),
            Url::parse("https://host").unwrap(),
            Duration::from_secs(5),
            Arc::new(Notify::new()),
        ))
    }

    macro_rules! app {
        ($store:expr) => {
            test::init_service(
                App::new()
                    .app_data(job_service($store))
                    .app_data(json_config(1024 * 1024))
                    .configure(job_config),
            )
            .await
        };
    }

    fn location_job_id<B>(resp: &actix_web::dev::ServiceResponse<B>) -> String {
        let location = resp
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        location.rsplit('/').next().unwrap().to_string()
    }

    #[actix_web::test]
    async fn submission_returns_created_with_location() {
        let store = JobStore::memory();
        let app = app!(store.clone());

        let req = test::TestRequest::post()
            .uri("/processes/execute/execution?key=abc")
            .insert_header((PREFER, "respond-async"))
            .set_json(json!({"model": "carbon", "args": {"lulc": "lulc.tif"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("Preference-Applied").unwrap(), "respond-async");
        let job_id = location_job_id(&resp);
        let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, format!("https://host/jobs/{}", job_id));

        let job = store.get(Uuid::parse_str(&job_id).unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.spec["model"], "carbon");

        let req = test::TestRequest::get()
            .uri(&format!("/jobs/{}", job_id))
            .to_request();
        let doc: StatusDocument = test::call_and_read_body_json(&app, req).await;
        assert!(matches!(doc.status, JobStatus::Accepted | JobStatus::Running));
        assert_eq!(doc.kind, "process");
    }

    #[actix_web::test]
    async fn malformed_specifications_are_rejected_synchronously() {
        let store = JobStore::memory();
        let app = app!(store.clone());

        for body in [
            json!({"model": "carbon"}),
            json!({"model": "carbon", "args": "not an object"}),
            json!({"args": {}}),
        ] {
            let req = test::TestRequest::post()
                .uri("/processes/execute/execution")
                .set_json(body)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert!(resp.headers().get(header::LOCATION).is_none());
        }

        let req = test::TestRequest::post()
            .uri("/processes/execute/execution")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(store.list(None, 10).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn unknown_process_is_not_found() {
        let app = app!(JobStore::memory());
        let req = test::TestRequest::post()
            .uri("/processes/reproject/execution")
            .set_json(json!({"model": "carbon", "args": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn unknown_jobs_are_not_found() {
        let app = app!(JobStore::memory());

        for uri in [
            format!("/jobs/{}", Uuid::new_v4()),
            format!("/jobs/{}/results", Uuid::new_v4()),
            "/jobs/UNKNOWN".to_string(),
        ] {
            let req = test::TestRequest::get().uri(&uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn results_follow_the_job_lifecycle() {
        let store = JobStore::memory();
        let app = app!(store.clone());
        let job = store.create("execute", json!({"model": "carbon"})).await.unwrap();
        let uri = format!("/jobs/{}/results", job.id);

        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        store.acquire_next().await.unwrap();
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "Result not ready");
        assert_eq!(body.fields["status"], "running");

        store
            .complete(
                job.id,
                JobOutcome::Successful {
                    result: json!({"workspace": "https://results/1"}),
                    result_location: "https://results/1".to_string(),
                },
            )
            .await
            .unwrap();
        let doc: ResultDocument =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request())
                .await;
        assert_eq!(doc.status, JobStatus::Successful);
        assert_eq!(doc.result.unwrap()["workspace"], "https://results/1");
        assert!(doc.error.is_none());
    }

    #[actix_web::test]
    async fn failed_jobs_are_reported_as_successful_reads() {
        let store = JobStore::memory();
        let app = app!(store.clone());
        let job = store.create("execute", json!({"model": "carbon"})).await.unwrap();
        store.acquire_next().await.unwrap();
        store
            .complete(job.id, JobOutcome::failure("ExecutionFailed", "exit 2", "file:///w".into()))
            .await
            .unwrap();

        let req = test::TestRequest::get().uri(&format!("/jobs/{}", job.id)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let doc: StatusDocument = test::read_body_json(resp).await;
        assert_eq!(doc.status, JobStatus::Failed);
        assert_eq!(doc.result_location.as_deref(), Some("file:///w"));

        let req = test::TestRequest::get()
            .uri(&format!("/jobs/{}/results", job.id))
            .to_request();
        let doc: ResultDocument = test::call_and_read_body_json(&app, req).await;
        assert_eq!(doc.status, JobStatus::Failed);
        assert_eq!(doc.error.unwrap()["description"], "exit 2");
    }

    #[actix_web::test]
    async fn jobs_can_be_listed_by_status() {
        let store = JobStore::memory();
        let app = app!(store.clone());
        store.create("execute", json!({})).await.unwrap();
        store.create("validate", json!({})).await.unwrap();
        store.acquire_next().await.unwrap();

        let req = test::TestRequest::get().uri("/jobs?status=running&key=k").to_request();
        let list: JobList = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.count, 1);
        assert_eq!(list.jobs[0].status, JobStatus::Running);

        let req = test::TestRequest::get().uri("/jobs").to_request();
        let list: JobList = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.count, 2);
    }
}
