use std::time::Duration;

use super::{initial_row_values, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

#[derive(Debug, Clone, Copy, Default)]
pub struct MsSqlDialect;

const DUPLICATE_KEY_ROW: i64 = 2601;
const PRIMARY_KEY_VIOLATION: i64 = 2627;
const OBJECT_ALREADY_EXISTS: i64 = 2714;
const DEADLOCK_VICTIM: i64 = 1205;
const LOCK_REQUEST_TIMEOUT: i64 = 1222;

impl Dialect for MsSqlDialect {
    fn current_utc_ms(&self) -> &'static str {
        "DATEDIFF_BIG(millisecond, '1970-01-01 00:00:00', GETUTCDATE())"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "BEGIN TRY INSERT INTO {} {} VALUES {}; END TRY \
             BEGIN CATCH IF ERROR_NUMBER() NOT IN ({}, {}) THROW; END CATCH;",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self),
            DUPLICATE_KEY_ROW,
            PRIMARY_KEY_VIOLATION,
        )
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn select_for_update_sql(&self, table: &TableName, _lock_timeout: Duration) -> String {
        format!(
            "SELECT candidate_id, last_seen_timestamp, {} AS now_utc_ms, lease_counter \
             FROM {} WITH (UPDLOCK, HOLDLOCK, ROWLOCK) WHERE role_id = {}",
            self.current_utc_ms(),
            table.qualified(),
            self.placeholder(1),
        )
    }

    fn lock_timeout_sql(&self, lock_timeout: Duration) -> Option<String> {
        Some(format!("SET LOCK_TIMEOUT {}", lock_timeout.as_millis().max(1)))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.vendor_code_in(&[OBJECT_ALREADY_EXISTS])
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            || error.vendor_code_in(&[DEADLOCK_VICTIM, LOCK_REQUEST_TIMEOUT])
    }
}
