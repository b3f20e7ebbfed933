#![forbid(unsafe_code)]

use serde::Serialize;
use triage_core::model::JobStatus;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub duplicate: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.duplicate
    }

    pub(crate) fn slot_mut(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Duplicate => &mut self.duplicate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecentJob {
    pub id: i64,
    pub fingerprint: String,
    pub status: JobStatus,
    pub ticket_ref: Option<String>,
    pub duplicate_of: Option<i64>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub processed_at_ms: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    pub hour_start_ms: i64,
    pub label: String,
    pub counts: StatusCounts,
}
