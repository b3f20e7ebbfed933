#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value;
use triage_core::fingerprint;
use triage_storage::{EnqueueOutcome, EnqueueRequest, SqliteStore, StoreError};

pub(crate) const FINGERPRINT_FIELD: &str = "fingerprint";

#[derive(Debug, thiserror::Error)]
pub(crate) enum IngestError {
    #[error("validation: {0}")]
    Validation(&'static str),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum IngestStatus {
    Queued,
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct IngestAck {
    pub(crate) status: IngestStatus,
    pub(crate) job_id: i64,
    pub(crate) fingerprint: String,
    pub(crate) duplicate_of: Option<i64>,
    pub(crate) ticket_ref: Option<String>,
}

pub(crate) fn ingest_text(
    store: &mut SqliteStore,
    body: &str,
    window_ms: i64,
) -> Result<IngestAck, IngestError> {
    let body: Value = serde_json::from_str(body)?;
    ingest(store, body, window_ms)
}

/// Validates, fingerprints and enqueues one incident. Returns as soon as the
/// row is stored; analysis happens later on the worker.
pub(crate) fn ingest(
    store: &mut SqliteStore,
    body: Value,
    window_ms: i64,
) -> Result<IngestAck, IngestError> {
    let Value::Object(mut payload) = body else {
        return Err(IngestError::Validation("payload must be a JSON object"));
    };
    let supplied = payload.remove(FINGERPRINT_FIELD);
    if payload.is_empty() {
        return Err(IngestError::Validation("payload must not be empty"));
    }

    let payload = Value::Object(payload);
    let fingerprint = fingerprint::resolve(&payload, supplied.as_ref());
    let result = store.enqueue(EnqueueRequest {
        payload_json: payload.to_string(),
        fingerprint: fingerprint.clone(),
        window_ms,
    })?;

    let status = if result.outcome.is_duplicate() {
        IngestStatus::Duplicate
    } else {
        IngestStatus::Queued
    };
    let duplicate_of = match &result.outcome {
        EnqueueOutcome::DuplicateInFlight { duplicate_of } => Some(*duplicate_of),
        _ => result.job.duplicate_of,
    };

    tracing::info!(
        job_id = result.job.id,
        fingerprint = %fingerprint,
        status = ?status,
        duplicate_of = ?duplicate_of,
        "incident ingested"
    );

    Ok(IngestAck {
        status,
        job_id: result.job.id,
        fingerprint,
        duplicate_of,
        ticket_ref: result.job.ticket_ref,
    })
}
