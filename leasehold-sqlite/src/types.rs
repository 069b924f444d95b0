use leasehold::core::lease_row::LeaseRow;
use leasehold::core::store::{ColumnInfo, ColumnType};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct LeaseRowRecord {
    pub(crate) candidate_id: String,
    pub(crate) last_seen_timestamp: i64,
    pub(crate) now_utc_ms: i64,
    pub(crate) lease_counter: i64,
}

impl From<LeaseRowRecord> for LeaseRow {
    fn from(record: LeaseRowRecord) -> Self {
        LeaseRow {
            candidate_id: record.candidate_id,
            last_seen_timestamp: record.last_seen_timestamp,
            now_utc_ms: record.now_utc_ms,
            lease_counter: record.lease_counter,
        }
    }
}

/// One row of `pragma_table_info`.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ColumnRecord {
    pub(crate) name: String,
    pub(crate) declared_type: String,
    pub(crate) not_null: i64,
}

impl From<ColumnRecord> for ColumnInfo {
    fn from(record: ColumnRecord) -> Self {
        // Every integer column is stored with 64 bits, whatever its declared width.
        let column_type = match ColumnType::from_sql_name(&record.declared_type, None) {
            ColumnType::Integer { .. } => ColumnType::Integer { bits: 64 },
            other => other,
        };
        ColumnInfo::new(
            record.name.to_ascii_lowercase(),
            column_type,
            record.not_null == 0,
        )
    }
}
