#![forbid(unsafe_code)]

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(in crate::store) const HOUR_MS: i64 = 3_600_000;

pub(in crate::store) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

/// RFC 3339 label for the hour bucket starting at `hour_start_ms`.
pub(in crate::store) fn hour_label(hour_start_ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp(hour_start_ms.div_euclid(1000))
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_else(|| hour_start_ms.to_string())
}
