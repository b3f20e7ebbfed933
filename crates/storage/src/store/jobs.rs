#![forbid(unsafe_code)]

use super::*;
use rusqlite::types::Type;
use rusqlite::params;
use triage_core::model::JobStatus;

const MAX_FINGERPRINT_LEN: usize = 256;
const MAX_TICKET_REF_LEN: usize = 256;
const MAX_PAYLOAD_LEN: usize = 1_048_576;
const MAX_ERROR_LEN: usize = 16_000;

const JOB_COLUMNS: &str = "id, payload_json, fingerprint, status, error, analysis_json, ticket_ref, \
                           duplicate_of, created_at_ms, claimed_at_ms, processed_at_ms";

fn normalize_fingerprint(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("fingerprint must not be empty"));
    }
    if raw.len() > MAX_FINGERPRINT_LEN {
        return Err(StoreError::InvalidInput("fingerprint is too long"));
    }
    Ok(raw.to_string())
}

fn normalize_ticket_ref(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("ticket_ref must not be empty"));
    }
    if raw.len() > MAX_TICKET_REF_LEN {
        return Err(StoreError::InvalidInput("ticket_ref is too long"));
    }
    Ok(raw.to_string())
}

fn normalize_payload(raw: &str) -> Result<&str, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("payload must not be empty"));
    }
    if raw.len() > MAX_PAYLOAD_LEN {
        return Err(StoreError::InvalidInput("payload is too large"));
    }
    Ok(raw)
}

fn normalize_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    trimmed.chars().take(MAX_ERROR_LEN).collect()
}

pub(super) fn status_from_sql(idx: usize, raw: String) -> Result<JobStatus, rusqlite::Error> {
    raw.parse::<JobStatus>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: row.get(0)?,
        payload_json: row.get(1)?,
        fingerprint: row.get(2)?,
        status: status_from_sql(3, row.get(3)?)?,
        error: row.get(4)?,
        analysis_json: row.get(5)?,
        ticket_ref: row.get(6)?,
        duplicate_of: row.get(7)?,
        created_at_ms: row.get(8)?,
        claimed_at_ms: row.get(9)?,
        processed_at_ms: row.get(10)?,
    })
}

fn job_get_tx(tx: &Transaction<'_>, job_id: i64) -> Result<JobRow, StoreError> {
    tx.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
        params![job_id],
        read_job_row,
    )
    .optional()?
    .ok_or(StoreError::UnknownJob { job_id })
}

/// Resolution of `fingerprint` inside the window.
///
/// The ledger keeps the first ticket per hash and is never refreshed, so once
/// that row ages out a job completed inside the window still counts; it is
/// reported as a ledger row stamped with its completion time.
fn find_resolved_tx(
    tx: &Transaction<'_>,
    fingerprint: &str,
    since_ms: i64,
) -> Result<Option<LedgerRow>, StoreError> {
    let ledger = tx
        .query_row(
            r#"
            SELECT hash, ticket_ref, job_id, created_at_ms
            FROM resolved_fingerprints
            WHERE hash=?1 AND created_at_ms >= ?2
            "#,
            params![fingerprint, since_ms],
            |row| {
                Ok(LedgerRow {
                    hash: row.get(0)?,
                    ticket_ref: row.get(1)?,
                    job_id: row.get(2)?,
                    created_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?;
    if ledger.is_some() {
        return Ok(ledger);
    }

    Ok(tx
        .query_row(
            r#"
            SELECT fingerprint, ticket_ref, id, processed_at_ms
            FROM jobs
            WHERE fingerprint=?1
              AND status='completed'
              AND ticket_ref IS NOT NULL
              AND processed_at_ms >= ?2
            ORDER BY processed_at_ms ASC, id ASC
            LIMIT 1
            "#,
            params![fingerprint, since_ms],
            |row| {
                Ok(LedgerRow {
                    hash: row.get(0)?,
                    ticket_ref: row.get(1)?,
                    job_id: Some(row.get(2)?),
                    created_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// Fails unless the job exists and is not terminal. Returns its status.
fn ensure_open_tx(tx: &Transaction<'_>, job_id: i64) -> Result<JobStatus, StoreError> {
    let status = tx
        .query_row(
            "SELECT status FROM jobs WHERE id=?1",
            params![job_id],
            |row| status_from_sql(0, row.get(0)?),
        )
        .optional()?
        .ok_or(StoreError::UnknownJob { job_id })?;
    if status.is_terminal() {
        return Err(StoreError::JobAlreadyTerminal { job_id, status });
    }
    Ok(status)
}

impl SqliteStore {
    /// Inserts a job unless its fingerprint is already handled inside the window.
    ///
    /// Ledger hit: the job is stored as `duplicate` pointing at the existing
    /// ticket. Pending/processing sibling: stored as `duplicate` pointing at
    /// that job, ticket filled in when it completes. Otherwise `pending`.
    /// The lookup and the insert share one immediate transaction, so concurrent
    /// identical deliveries produce exactly one `pending` row.
    pub fn enqueue(&mut self, request: EnqueueRequest) -> Result<EnqueueResult, StoreError> {
        let fingerprint = normalize_fingerprint(&request.fingerprint)?;
        let payload_json = normalize_payload(&request.payload_json)?.to_string();
        if request.window_ms < 0 {
            return Err(StoreError::InvalidInput("window_ms must be >= 0"));
        }

        let now_ms = now_ms();
        let since_ms = now_ms.saturating_sub(request.window_ms);
        let tx = self.write_tx()?;

        let outcome = if let Some(ledger) = find_resolved_tx(&tx, &fingerprint, since_ms)? {
            EnqueueOutcome::DuplicateResolved {
                ticket_ref: ledger.ticket_ref,
                resolved_job_id: ledger.job_id,
            }
        } else if let Some(open_id) = tx
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE fingerprint=?1
                  AND status IN ('pending', 'processing')
                  AND created_at_ms >= ?2
                ORDER BY created_at_ms ASC, id ASC
                LIMIT 1
                "#,
                params![fingerprint, since_ms],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            EnqueueOutcome::DuplicateInFlight {
                duplicate_of: open_id,
            }
        } else {
            EnqueueOutcome::Queued
        };

        let (status, ticket_ref, duplicate_of, processed_at_ms) = match &outcome {
            EnqueueOutcome::Queued => (JobStatus::Pending, None, None, None),
            EnqueueOutcome::DuplicateResolved {
                ticket_ref,
                resolved_job_id,
            } => (
                JobStatus::Duplicate,
                Some(ticket_ref.clone()),
                *resolved_job_id,
                Some(now_ms),
            ),
            EnqueueOutcome::DuplicateInFlight { duplicate_of } => {
                (JobStatus::Duplicate, None, Some(*duplicate_of), Some(now_ms))
            }
        };

        tx.execute(
            r#"
            INSERT INTO jobs(payload_json, fingerprint, status, ticket_ref, duplicate_of, created_at_ms, processed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                payload_json,
                fingerprint,
                status.as_str(),
                ticket_ref,
                duplicate_of,
                now_ms,
                processed_at_ms,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let job = job_get_tx(&tx, id)?;

        tx.commit()?;
        Ok(EnqueueResult { job, outcome })
    }

    /// Flips the oldest pending job to `processing` and returns it.
    pub fn claim_next(&mut self) -> Result<Option<JobRow>, StoreError> {
        let now_ms = now_ms();
        let tx = self.write_tx()?;

        let candidate = tx
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE status='pending'
                ORDER BY created_at_ms ASC, id ASC
                LIMIT 1
                "#,
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE jobs SET status='processing', claimed_at_ms=?2 WHERE id=?1 AND status='pending'",
            params![job_id, now_ms],
        )?;
        if changed != 1 {
            return Ok(None);
        }

        let job = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Records the ticket in the ledger and completes the job in one transaction.
    pub fn complete_with_fingerprint(
        &mut self,
        job_id: i64,
        fingerprint: &str,
        ticket_ref: &str,
        analysis_json: &str,
    ) -> Result<CompleteResult, StoreError> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        let ticket_ref = normalize_ticket_ref(ticket_ref)?;
        let now_ms = now_ms();
        let tx = self.write_tx()?;

        let status = ensure_open_tx(&tx, job_id)?;
        if status != JobStatus::Processing {
            return Err(StoreError::JobNotProcessing { job_id, status });
        }

        tx.execute(
            r#"
            INSERT INTO resolved_fingerprints(hash, ticket_ref, job_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(hash) DO NOTHING
            "#,
            params![fingerprint, ticket_ref, job_id, now_ms],
        )?;

        tx.execute(
            r#"
            UPDATE jobs
            SET status='completed', ticket_ref=?2, analysis_json=?3, error=NULL, processed_at_ms=?4
            WHERE id=?1 AND status='processing'
            "#,
            params![job_id, ticket_ref, analysis_json, now_ms],
        )?;

        let backfilled_duplicates = tx.execute(
            r#"
            UPDATE jobs
            SET ticket_ref=?2
            WHERE duplicate_of=?1 AND status='duplicate' AND ticket_ref IS NULL
            "#,
            params![job_id, ticket_ref],
        )?;

        let job = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(CompleteResult {
            job,
            backfilled_duplicates,
        })
    }

    /// Terminal failure. The ledger is left alone so a later occurrence of the
    /// same fingerprint is analysed again.
    pub fn mark_failed(&mut self, job_id: i64, error: &str) -> Result<JobRow, StoreError> {
        let error = normalize_error(error);
        let now_ms = now_ms();
        let tx = self.write_tx()?;

        ensure_open_tx(&tx, job_id)?;
        tx.execute(
            r#"
            UPDATE jobs
            SET status='failed', error=?2, processed_at_ms=?3
            WHERE id=?1 AND status IN ('pending', 'processing')
            "#,
            params![job_id, error, now_ms],
        )?;

        let job = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn mark_duplicate(
        &mut self,
        job_id: i64,
        ticket_ref: Option<&str>,
    ) -> Result<JobRow, StoreError> {
        let ticket_ref = ticket_ref.map(normalize_ticket_ref).transpose()?;
        let now_ms = now_ms();
        let tx = self.write_tx()?;

        ensure_open_tx(&tx, job_id)?;
        tx.execute(
            r#"
            UPDATE jobs
            SET status='duplicate', ticket_ref=COALESCE(?2, ticket_ref), processed_at_ms=?3
            WHERE id=?1 AND status IN ('pending', 'processing')
            "#,
            params![job_id, ticket_ref, now_ms],
        )?;

        let job = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn job_get(&mut self, job_id: i64) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        let job = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(job)
    }

    /// Ticket that resolved `fingerprint` within the last `window_ms`: the
    /// ledger entry, else a job completed inside the window.
    pub fn find_resolved(
        &mut self,
        fingerprint: &str,
        window_ms: i64,
    ) -> Result<Option<LedgerRow>, StoreError> {
        let fingerprint = normalize_fingerprint(fingerprint)?;
        let since_ms = now_ms().saturating_sub(window_ms.max(0));
        let tx = self.conn.transaction()?;
        let row = find_resolved_tx(&tx, &fingerprint, since_ms)?;
        tx.commit()?;
        Ok(row)
    }

    /// Deletes terminal jobs created before `cutoff_ms`. The ledger is kept.
    pub fn purge_older_than(&mut self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let tx = self.write_tx()?;
        let removed = tx.execute(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'duplicate') AND created_at_ms < ?1
            "#,
            params![cutoff_ms],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
