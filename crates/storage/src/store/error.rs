#![forbid(unsafe_code)]

use triage_core::model::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown job id {job_id}")]
    UnknownJob { job_id: i64 },
    #[error("job {job_id} is already terminal (status={status})")]
    JobAlreadyTerminal { job_id: i64, status: JobStatus },
    #[error("job {job_id} is not processing (status={status})")]
    JobNotProcessing { job_id: i64, status: JobStatus },
}
