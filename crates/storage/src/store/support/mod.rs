#![forbid(unsafe_code)]

mod schema;
mod time;

pub(super) use schema::{SCHEMA_VERSION, install_sqlite_schema};
pub(super) use self::time::{HOUR_MS, hour_label, now_ms};
