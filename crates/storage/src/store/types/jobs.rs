#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value;
use triage_core::model::JobStatus;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobRow {
    pub id: i64,
    pub payload_json: String,
    pub fingerprint: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub analysis_json: Option<String>,
    pub ticket_ref: Option<String>,
    pub duplicate_of: Option<i64>,
    pub created_at_ms: i64,
    pub claimed_at_ms: Option<i64>,
    pub processed_at_ms: Option<i64>,
}

impl JobRow {
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.payload_json)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerRow {
    pub hash: String,
    pub ticket_ref: String,
    pub job_id: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub payload_json: String,
    pub fingerprint: String,
    pub window_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    /// A ticket already exists for this fingerprint inside the window.
    DuplicateResolved {
        ticket_ref: String,
        resolved_job_id: Option<i64>,
    },
    /// Another job with this fingerprint is still pending or processing.
    DuplicateInFlight { duplicate_of: i64 },
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, EnqueueOutcome::Queued)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnqueueResult {
    pub job: JobRow,
    pub outcome: EnqueueOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompleteResult {
    pub job: JobRow,
    /// In-flight duplicates that received the ticket reference in the same
    /// transaction.
    pub backfilled_duplicates: usize,
}
