pub mod health;
pub mod job;
pub mod process;
pub mod validation;

use actix_web::web::ServiceConfig;

/// Routes served by the execution service
pub fn execution_config(config: &mut ServiceConfig) {
    config
        .configure(health::health_config)
        .configure(process::process_config)
        .configure(job::handlers::job_config);
}
