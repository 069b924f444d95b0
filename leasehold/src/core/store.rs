use async_trait::async_trait;
use thiserror::Error;

use crate::core::dialect::{Statement, TableName};
use crate::core::lease_row::LeaseRow;

/// An interface to the database holding the lease table. Responsible for
/// running already rendered statements, nothing else: all decisions are made
/// by the election engine.
///
/// Implementations must classify their driver errors into [`StoreError`]
/// variants, usually with the help of
/// [`Dialect::is_transient`](crate::core::dialect::Dialect::is_transient) and
/// [`Dialect::is_already_exists`](crate::core::dialect::Dialect::is_already_exists).
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    type Transaction: LeaseTransaction + 'static;

    /// Open a transaction with the default isolation level.
    ///
    /// Failing to get hold of a connection must be reported as
    /// [`StoreError::Connect`].
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Run a statement outside of any explicit transaction (auto-commit).
    /// Returns the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError>;

    /// What the server says about itself. Doubles as a connectivity check.
    async fn server_info(&self) -> Result<ServerInfo, StoreError>;

    /// Columns of the given table. Empty if the table does not exist.
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError>;
}

/// A transaction opened by [`LeaseStore::begin`]. Dropping it without
/// committing must roll it back.
#[async_trait]
pub trait LeaseTransaction: Send {
    /// Run the lock-and-read select. Returns every row that matched.
    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError>;

    /// Returns the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Product name, version and current schema of a connected server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub product_name: String,
    pub version: String,
    pub current_schema: Option<String>,
}

/// One column of an existing table, as far as the lease table cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Character data. `None` length means unbounded.
    Text { max_length: Option<u32> },
    /// Exact integer with this many bits of range.
    Integer { bits: u8 },
    Other(String),
}

impl ColumnType {
    /// Maps a SQL type name such as `character varying`, `varchar(20)`,
    /// `bigint` or `number(38)` to a column type.
    ///
    /// `max_length` is used for character types when the name itself carries
    /// no length.
    pub fn from_sql_name(type_name: &str, max_length: Option<i64>) -> Self {
        let lowered = type_name.trim().to_ascii_lowercase();
        let (base, arg) = match lowered.split_once('(') {
            Some((base, rest)) => (
                base.trim().to_string(),
                rest.trim_end_matches(')')
                    .split(',')
                    .next()
                    .and_then(|n| n.trim().parse::<i64>().ok()),
            ),
            None => (lowered.clone(), None),
        };
        let length = arg
            .or(max_length)
            .and_then(|len| u32::try_from(len).ok());
        match base.as_str() {
            "character varying" | "varchar" | "varchar2" | "nvarchar" | "nvarchar2"
            | "character" | "char" | "nchar" => ColumnType::Text { max_length: length },
            "text" | "clob" | "longtext" | "mediumtext" => ColumnType::Text { max_length: None },
            "bigint" | "int8" => ColumnType::Integer { bits: 64 },
            "integer" | "int" | "int4" | "mediumint" => ColumnType::Integer { bits: 32 },
            "smallint" | "int2" => ColumnType::Integer { bits: 16 },
            "tinyint" => ColumnType::Integer { bits: 8 },
            "number" | "numeric" | "decimal" => match arg {
                Some(precision) if precision >= 19 => ColumnType::Integer { bits: 64 },
                Some(_) => ColumnType::Integer { bits: 32 },
                None => ColumnType::Other(lowered),
            },
            _ => ColumnType::Other(lowered),
        }
    }
}

/// Errors related to store operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Could not get hold of a connection at all.
    #[error("Could not connect to database: {0}")]
    Connect(#[source] anyhow::Error),
    /// Lock wait timeout, deadlock, serialization failure or a broken
    /// connection. Worth retrying on the next cycle.
    #[error("Transient database error: {0}")]
    Transient(#[source] anyhow::Error),
    /// The object we tried to create is already there.
    #[error("Database object already exists: {0}")]
    AlreadyExists(#[source] anyhow::Error),
    /// A statement was given parameters it cannot use.
    #[error("Invalid statement '{kind}': {reason}")]
    InvalidStatement { kind: String, reason: String },
    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
