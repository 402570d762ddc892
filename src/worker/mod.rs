pub mod job_worker;
pub mod retention;
pub mod runner;

pub use job_worker::JobWorker;
pub use runner::ProcessRunner;
