use std::time::Duration;

use super::{initial_row_values, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

/// SQLite has no row locks. A no-op update on the lease row takes the
/// database write lock up front, which then serializes cycles the same way a
/// row lock would. Lock waits are bounded by the connection's busy timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

impl Dialect for SqliteDialect {
    fn current_utc_ms(&self) -> &'static str {
        "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "INSERT OR IGNORE INTO {} {} VALUES {}",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn select_for_update_sql(&self, table: &TableName, _lock_timeout: Duration) -> String {
        format!(
            "SELECT candidate_id, last_seen_timestamp, {} AS now_utc_ms, lease_counter \
             FROM {} WHERE role_id = {}",
            self.current_utc_ms(),
            table.qualified(),
            self.placeholder(1),
        )
    }

    fn lock_row_sql(&self, table: &TableName) -> Option<String> {
        Some(format!(
            "UPDATE {} SET role_id = role_id WHERE role_id = {}",
            table.qualified(),
            self.placeholder(1)
        ))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.message.contains("already exists")
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        // Extended result codes keep the primary code in the low byte.
        error
            .vendor_code
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    }
}
