use std::time::Duration;

use super::{initial_row_values, whole_seconds, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

/// MySQL and MariaDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

const ER_LOCK_WAIT_TIMEOUT: i64 = 1205;
const ER_LOCK_DEADLOCK: i64 = 1213;
const CR_SERVER_GONE_ERROR: i64 = 2006;
const CR_SERVER_LOST: i64 = 2013;

impl Dialect for MySqlDialect {
    fn current_utc_ms(&self) -> &'static str {
        "CAST(1000*UNIX_TIMESTAMP(current_timestamp(3)) AS SIGNED)"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        format!(
            "INSERT IGNORE INTO {} {} VALUES {}",
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn lock_timeout_sql(&self, lock_timeout: Duration) -> Option<String> {
        Some(format!(
            "SET SESSION innodb_lock_wait_timeout = {}",
            whole_seconds(lock_timeout)
        ))
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_is("42S01")
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            || error.vendor_code_in(&[
                ER_LOCK_WAIT_TIMEOUT,
                ER_LOCK_DEADLOCK,
                CR_SERVER_GONE_ERROR,
                CR_SERVER_LOST,
            ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_uses_insert_ignore() {
        let sql = MySqlDialect.insert_role_sql(&TableName::new(None, "t"));
        assert!(sql.starts_with("INSERT IGNORE INTO t "));
        assert!(sql.ends_with("VALUES (?, '//noleader//', 0, 0)"));
    }

    #[test]
    fn lock_wait_timeout_is_whole_seconds() {
        assert_eq!(
            MySqlDialect
                .lock_timeout_sql(Duration::from_millis(2500))
                .unwrap(),
            "SET SESSION innodb_lock_wait_timeout = 3"
        );
    }

    #[test]
    fn lock_wait_timeout_error_is_transient() {
        let err = DbErrorInfo {
            sqlstate: Some("HY000".to_string()),
            vendor_code: Some(1205),
            message: "Lock wait timeout exceeded; try restarting transaction".to_string(),
        };
        assert!(MySqlDialect.is_transient(&err));
        assert!(!MySqlDialect.is_already_exists(&err));
    }
}
