#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, created_at_ms, id);
        CREATE INDEX IF NOT EXISTS idx_jobs_fingerprint ON jobs(fingerprint, status, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_jobs_duplicate_of ON jobs(duplicate_of) WHERE duplicate_of IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at_ms);
"#;
