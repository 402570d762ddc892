use actix_web::{
    HttpResponse, get,
    web::{Data, Path, ServiceConfig},
};
use serde::Serialize;

use crate::api::job::service::{JobService, ServiceError};
use crate::processes::ProcessDescription;

#[derive(Serialize)]
struct ProcessList<'a> {
    processes: Vec<&'a ProcessDescription>,
}

#[get("/processes")]
async fn list_processes(service: Data<JobService>) -> HttpResponse {
    HttpResponse::Ok().json(ProcessList {
        processes: service.processes().descriptions(),
    })
}

#[get("/processes/{process_id}")]
async fn describe_process(
    service: Data<JobService>,
    process_id: Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let process = service
        .processes()
        .get(&process_id)
        .ok_or_else(|| ServiceError::ProcessNotFound(process_id.to_string()))?;
    Ok(HttpResponse::Ok().json(&process.description))
}

pub fn process_config(config: &mut ServiceConfig) {
    config.service(list_processes).service(describe_process);
}
