#![forbid(unsafe_code)]

mod sql;

use super::super::StoreError;
use rusqlite::{Connection, params};

pub(in crate::store) const SCHEMA_VERSION: &str = "1";

pub(in crate::store) fn install_sqlite_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(&sql::tables_sql())?;
    conn.execute_batch(sql::indexes_sql())?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;

    Ok(())
}
