use std::time::Duration;

use super::{initial_row_values, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

#[derive(Debug, Clone, Copy, Default)]
pub struct H2Dialect;

const LOCK_TIMEOUT_1: i64 = 50200;

impl Dialect for H2Dialect {
    fn current_utc_ms(&self) -> &'static str {
        "CAST(EXTRACT(EPOCH FROM CURRENT_TIMESTAMP)*1000 AS bigint)"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "MERGE INTO {} {} KEY(role_id) VALUES {}",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn lock_timeout_sql(&self, lock_timeout: Duration) -> Option<String> {
        Some(format!("SET LOCK_TIMEOUT {}", lock_timeout.as_millis().max(1)))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_is("42S01")
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            || error.sqlstate_is("HYT00")
            || error.vendor_code_in(&[LOCK_TIMEOUT_1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_a_keyed_merge() {
        assert_eq!(
            H2Dialect.insert_role_sql(&TableName::new(None, "t")),
            "MERGE INTO t (role_id, candidate_id, last_seen_timestamp, lease_counter) \
             KEY(role_id) VALUES (?, '//noleader//', 0, 0)"
        );
    }
}
