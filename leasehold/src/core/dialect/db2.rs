use std::time::Duration;

use super::{initial_row_values, whole_seconds, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

/// Db2 for Linux, Unix and Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Db2Dialect;

const SQL_DEADLOCK_OR_TIMEOUT: i64 = -911;
const SQL_DEADLOCK_OR_TIMEOUT_NO_ROLLBACK: i64 = -913;

impl Dialect for Db2Dialect {
    fn current_utc_ms(&self) -> &'static str {
        "(DATE_PART('EPOCH', TRUNC_TIMESTAMP(CURRENT_TIMESTAMP(3), 'SS'))*1000) \
         + (DATE_PART('MILLISECOND', CURRENT_TIMESTAMP(3)) \
         - TRUNC(DATE_PART('MILLISECOND', CURRENT_TIMESTAMP(3)),-3))"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "BEGIN DECLARE CONTINUE HANDLER FOR SQLSTATE '23505' BEGIN END; \
             INSERT INTO {} {} VALUES {}; END;",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn from_nothing(&self) -> &'static str {
        "FROM SYSIBM.SYSDUMMY1"
    }

    fn select_for_update_sql(&self, table: &TableName, _lock_timeout: Duration) -> String {
        format!(
            "SELECT candidate_id, last_seen_timestamp, {} AS now_utc_ms, lease_counter \
             FROM {} WHERE role_id = {} \
             FOR READ ONLY WITH RS USE AND KEEP EXCLUSIVE LOCKS WAIT FOR OUTCOME",
            self.current_utc_ms(),
            table.qualified(),
            self.placeholder(1),
        )
    }

    fn lock_timeout_sql(&self, lock_timeout: Duration) -> Option<String> {
        Some(format!(
            "SET CURRENT LOCK TIMEOUT {}",
            whole_seconds(lock_timeout)
        ))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_is("42710")
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            || error.sqlstate_is("57033")
            || error.vendor_code_in(&[SQL_DEADLOCK_OR_TIMEOUT, SQL_DEADLOCK_OR_TIMEOUT_NO_ROLLBACK])
    }
}
