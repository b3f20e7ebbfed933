#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS jobs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          payload_json TEXT NOT NULL,
          fingerprint TEXT NOT NULL,
          status TEXT NOT NULL
            CHECK(status IN ('pending', 'processing', 'completed', 'failed', 'duplicate')),
          error TEXT,
          analysis_json TEXT,
          ticket_ref TEXT,
          duplicate_of INTEGER,
          created_at_ms INTEGER NOT NULL,
          claimed_at_ms INTEGER,
          processed_at_ms INTEGER
        );
"#;
