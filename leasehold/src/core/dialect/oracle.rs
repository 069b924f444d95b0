use std::time::Duration;

use super::{initial_row_values, whole_seconds, DbErrorInfo, Dialect, TableName, INSERT_COLUMNS};

#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

// ORA-00955: name is already used by an existing object
const ORA_NAME_IN_USE: i64 = 955;
const ORA_RESOURCE_BUSY: i64 = 54;
const ORA_DEADLOCK: i64 = 60;
const ORA_EOF_ON_CHANNEL: i64 = 3113;
const ORA_NOT_CONNECTED: i64 = 3114;
const ORA_WAIT_TIMEOUT: i64 = 30006;

impl Dialect for OracleDialect {
    fn current_utc_ms(&self) -> &'static str {
        "(EXTRACT(DAY FROM (SYSTIMESTAMP - TIMESTAMP '1970-01-01 00:00:00 UTC') * 24 * 60) * 60 \
         + EXTRACT(SECOND FROM SYSTIMESTAMP)) * 1000"
    }

    fn insert_role_sql(&self, table: &TableName) -> String {
        // The hint takes the bare table name, never the schema-qualified one.
        format!(
            "INSERT /*+ ignore_row_on_dupkey_index({}, (role_id)) */ INTO {} {} VALUES {}",
            table.table,
            table.qualified(),
            INSERT_COLUMNS,
            initial_row_values(self)
        )
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn varchar_type(&self) -> &'static str {
        "varchar2"
    }

    fn bigint_type(&self) -> &'static str {
        "number(38)"
    }

    fn from_nothing(&self) -> &'static str {
        "FROM DUAL"
    }

    fn select_for_update_sql(&self, table: &TableName, lock_timeout: Duration) -> String {
        format!(
            "SELECT candidate_id, last_seen_timestamp, {} AS now_utc_ms, lease_counter \
             FROM {} WHERE role_id = {} FOR UPDATE WAIT {}",
            self.current_utc_ms(),
            table.qualified(),
            self.placeholder(1),
            whole_seconds(lock_timeout),
        )
    }

    fn is_already_exists(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_is("42000") && error.vendor_code_in(&[ORA_NAME_IN_USE])
    }

    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08")
            || error.sqlstate_class_is("40")
            || error.vendor_code_in(&[
                ORA_RESOURCE_BUSY,
                ORA_DEADLOCK,
                ORA_EOF_ON_CHANNEL,
                ORA_NOT_CONNECTED,
                ORA_WAIT_TIMEOUT,
            ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::new(Some("APP".to_string()), "DB_LEADER_ELECT")
    }

    #[test]
    fn hint_uses_unqualified_table_name() {
        let sql = OracleDialect.insert_role_sql(&table());
        assert!(sql.starts_with(
            "INSERT /*+ ignore_row_on_dupkey_index(DB_LEADER_ELECT, (role_id)) */ INTO APP.DB_LEADER_ELECT"
        ));
        assert!(sql.ends_with("VALUES (:1, '//noleader//', 0, 0)"));
    }

    #[test]
    fn select_waits_a_bounded_time_for_the_lock() {
        let sql = OracleDialect.select_for_update_sql(&table(), Duration::from_secs(120));
        assert!(sql.ends_with("WHERE role_id = :1 FOR UPDATE WAIT 120"));
    }

    #[test]
    fn current_time_selects_from_dual() {
        assert!(OracleDialect.current_time_sql().ends_with("FROM DUAL"));
    }

    #[test]
    fn already_exists_needs_both_codes() {
        let both = DbErrorInfo {
            sqlstate: Some("42000".to_string()),
            vendor_code: Some(955),
            ..Default::default()
        };
        let state_only = DbErrorInfo {
            sqlstate: Some("42000".to_string()),
            vendor_code: Some(942),
            ..Default::default()
        };
        assert!(OracleDialect.is_already_exists(&both));
        assert!(!OracleDialect.is_already_exists(&state_only));
    }
}
