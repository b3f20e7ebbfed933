#![forbid(unsafe_code)]

mod indexes;
mod jobs;
mod ledger;
mod pragmas;

pub(super) fn tables_sql() -> String {
    let mut sql = String::new();
    sql.push_str(pragmas::SQL);
    sql.push_str(jobs::SQL);
    sql.push_str(ledger::SQL);
    sql
}

pub(super) fn indexes_sql() -> &'static str {
    indexes::SQL
}
