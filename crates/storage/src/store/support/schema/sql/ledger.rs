#![forbid(unsafe_code)]

// Append-only. A row exists only after a ticket was filed for the hash.
pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS resolved_fingerprints (
          hash TEXT PRIMARY KEY,
          ticket_ref TEXT NOT NULL,
          job_id INTEGER,
          created_at_ms INTEGER NOT NULL
        );
"#;
