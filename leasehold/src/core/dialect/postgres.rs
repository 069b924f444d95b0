use std::time::Duration;

use super::{initial_row_values, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn current_utc_ms(&self) -> &'static str {
        "CAST(EXTRACT(EPOCH FROM CURRENT_TIMESTAMP(3))*1000 AS bigint)"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "INSERT INTO {} {} VALUES {} ON CONFLICT DO NOTHING",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn lock_timeout_sql(&self, lock_timeout: Duration) -> Option<String> {
        // Scoped to the current transaction only.
        Some(format!(
            "SET LOCAL lock_timeout = '{}ms'",
            lock_timeout.as_millis().max(1)
        ))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_is("42P07")
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            // lock_not_available, query_canceled, admin/crash shutdown, cannot_connect_now
            || error.sqlstate_is("55P03")
            || error.sqlstate_is("57014")
            || error.sqlstate_is("57P01")
            || error.sqlstate_is("57P02")
            || error.sqlstate_is("57P03")
    }
}
