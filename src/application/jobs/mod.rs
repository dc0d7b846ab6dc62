mod context;
mod requery;

pub use context::{RequeryWorkerContext, job_failed};
pub use requery::process_requery_job;
