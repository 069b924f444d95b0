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

/// One row of `information_schema.COLUMNS`, with lower-case column aliases.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ColumnRecord {
    pub(crate) column_name: String,
    pub(crate) data_type: String,
    pub(crate) character_maximum_length: Option<i64>,
    pub(crate) is_nullable: String,
}

impl From<ColumnRecord> for ColumnInfo {
    fn from(record: ColumnRecord) -> Self {
        ColumnInfo::new(
            record.column_name.to_ascii_lowercase(),
            ColumnType::from_sql_name(&record.data_type, record.character_maximum_length),
            record.is_nullable.eq_ignore_ascii_case("YES"),
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ServerRecord {
    pub(crate) version: String,
    pub(crate) current_schema: Option<String>,
}
