#![forbid(unsafe_code)]

use crate::issues::{IssueError, IssueService, TicketRequest};
use crate::orchestrator::{AnalysisError, Analyzer};
use std::thread::sleep;
use std::time::Duration;
use triage_core::model::AnalysisResult;
use triage_storage::{JobRow, SqliteStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum JobError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("stored payload is not valid JSON: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("analysis result is malformed: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("ticket creation failed: {0}")]
    Issue(#[from] IssueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed {
        ticket_ref: String,
        backfilled_duplicates: usize,
    },
    /// A ticket for the fingerprint appeared between enqueue and claim.
    Duplicate { ticket_ref: String },
    Failed { error: String },
}

/// Drains the queue one job at a time. Never holds more than one job in
/// `processing`.
pub(crate) struct Worker<'a, A, I> {
    store: &'a mut SqliteStore,
    analyzer: A,
    issues: I,
    dedup_window_ms: i64,
}

impl<'a, A: Analyzer, I: IssueService> Worker<'a, A, I> {
    pub(crate) fn new(
        store: &'a mut SqliteStore,
        analyzer: A,
        issues: I,
        dedup_window_ms: i64,
    ) -> Self {
        Self {
            store,
            analyzer,
            issues,
            dedup_window_ms,
        }
    }

    /// Processes jobs until `claim_next` finds nothing. Returns how many ran.
    pub(crate) fn run_until_idle(&mut self) -> Result<usize, StoreError> {
        let mut processed = 0usize;
        while let Some(job) = self.store.claim_next()? {
            self.process(job);
            processed += 1;
        }
        Ok(processed)
    }

    pub(crate) fn run_forever(&mut self, poll: Duration) {
        tracing::info!(poll_ms = poll.as_millis() as u64, "worker started");
        loop {
            match self.run_until_idle() {
                Ok(0) => {}
                Ok(processed) => tracing::debug!(processed, "queue drained"),
                Err(err) => tracing::error!(error = %err, "claim failed"),
            }
            sleep(poll);
        }
    }

    /// Runs one claimed job to a terminal state. Errors never escape.
    pub(crate) fn process(&mut self, job: JobRow) -> JobOutcome {
        let span = tracing::info_span!("job", job_id = job.id, fingerprint = %job.fingerprint);
        let _entered = span.enter();
        tracing::info!(status = %job.status, "job claimed");

        match self.handle(&job) {
            Ok(outcome) => {
                tracing::info!(outcome = ?outcome, "job finished");
                outcome
            }
            Err(err) => {
                let error = err.to_string();
                tracing::warn!(error = %error, "job failed");
                if let Err(store_err) = self.store.mark_failed(job.id, &error) {
                    tracing::error!(error = %store_err, "recording job failure failed");
                }
                JobOutcome::Failed { error }
            }
        }
    }

    fn handle(&mut self, job: &JobRow) -> Result<JobOutcome, JobError> {
        if let Some(resolved) = self
            .store
            .find_resolved(&job.fingerprint, self.dedup_window_ms)?
        {
            self.store
                .mark_duplicate(job.id, Some(&resolved.ticket_ref))?;
            return Ok(JobOutcome::Duplicate {
                ticket_ref: resolved.ticket_ref,
            });
        }

        let payload = job.payload().map_err(JobError::Payload)?;
        let raw = self.analyzer.analyze(job.id, &payload)?;
        let analysis = AnalysisResult::from_value(&raw).map_err(JobError::Malformed)?;

        let destination = self.issues.resolve_destination(analysis.routing_key());
        if analysis.routing_key().is_some() && destination.is_none() {
            tracing::debug!(
                suggested = ?analysis.routing_key(),
                "suggested routing key is not allow-listed"
            );
        }

        let ticket_ref = self.issues.create_ticket(TicketRequest {
            job_id: job.id,
            fingerprint: &job.fingerprint,
            destination: destination.as_ref(),
            payload: &payload,
            analysis: &analysis,
        })?;

        let done = self.store.complete_with_fingerprint(
            job.id,
            &job.fingerprint,
            &ticket_ref,
            &raw.to_string(),
        )?;
        Ok(JobOutcome::Completed {
            ticket_ref,
            backfilled_duplicates: done.backfilled_duplicates,
        })
    }
}
