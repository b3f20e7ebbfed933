#![forbid(unsafe_code)]

use super::jobs::status_from_sql;
use super::*;
use rusqlite::params;
use std::collections::BTreeMap;

const MAX_RECENT_LIMIT: usize = 1000;
const MAX_HISTOGRAM_HOURS: i64 = 24 * 90;

impl SqliteStore {
    pub fn status_counts(&mut self) -> Result<StatusCounts, StoreError> {
        let tx = self.conn.transaction()?;
        let mut counts = StatusCounts::default();
        {
            let mut stmt = tx.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status = status_from_sql(0, row.get(0)?)?;
                let count: i64 = row.get(1)?;
                *counts.slot_mut(status) = u64::try_from(count).unwrap_or(0);
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    /// Newest jobs first. `duration_ms` is set once a job reached a terminal state.
    pub fn recent_jobs(&mut self, limit: usize) -> Result<Vec<RecentJob>, StoreError> {
        let limit = limit.clamp(1, MAX_RECENT_LIMIT);
        let tx = self.conn.transaction()?;
        let mut out = Vec::new();
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, fingerprint, status, ticket_ref, duplicate_of, error, created_at_ms, processed_at_ms
                FROM jobs
                ORDER BY created_at_ms DESC, id DESC
                LIMIT ?1
                "#,
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            while let Some(row) = rows.next()? {
                let created_at_ms: i64 = row.get(6)?;
                let processed_at_ms: Option<i64> = row.get(7)?;
                out.push(RecentJob {
                    id: row.get(0)?,
                    fingerprint: row.get(1)?,
                    status: status_from_sql(2, row.get(2)?)?,
                    ticket_ref: row.get(3)?,
                    duplicate_of: row.get(4)?,
                    error: row.get(5)?,
                    created_at_ms,
                    processed_at_ms,
                    duration_ms: processed_at_ms.map(|done| done.saturating_sub(created_at_ms)),
                });
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Per-hour status counts over the last `hours` hours, oldest bucket first.
    /// Hours without any job are present with zero counts.
    pub fn hourly_histogram(&mut self, hours: i64) -> Result<Vec<HourBucket>, StoreError> {
        if hours <= 0 {
            return Err(StoreError::InvalidInput("hours must be > 0"));
        }
        let hours = hours.min(MAX_HISTOGRAM_HOURS);
        let current_hour = now_ms().div_euclid(HOUR_MS) * HOUR_MS;
        let first_hour = current_hour - (hours - 1) * HOUR_MS;

        let mut buckets = (0..hours)
            .map(|i| (first_hour + i * HOUR_MS, StatusCounts::default()))
            .collect::<BTreeMap<_, _>>();

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                SELECT (created_at_ms / ?2) * ?2 AS hour_start, status, COUNT(*)
                FROM jobs
                WHERE created_at_ms >= ?1
                GROUP BY hour_start, status
                "#,
            )?;
            let mut rows = stmt.query(params![first_hour, HOUR_MS])?;
            while let Some(row) = rows.next()? {
                let hour_start: i64 = row.get(0)?;
                let status = status_from_sql(1, row.get(1)?)?;
                let count: i64 = row.get(2)?;
                if let Some(counts) = buckets.get_mut(&hour_start) {
                    *counts.slot_mut(status) += u64::try_from(count).unwrap_or(0);
                }
            }
        }
        tx.commit()?;

        Ok(buckets
            .into_iter()
            .map(|(hour_start_ms, counts)| HourBucket {
                hour_start_ms,
                label: hour_label(hour_start_ms),
                counts,
            })
            .collect())
    }
}
