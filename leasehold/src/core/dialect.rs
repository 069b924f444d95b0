//! SQL dialects for the lease table.
//!
//! Each supported database engine gets one [`Dialect`] implementation. The
//! dialect only knows how to *word* things: how to take an exclusive lock on
//! the lease row, how to ask the server for the current time, how to insert
//! a row only if it is absent and how to recognize a handful of error
//! conditions. [`LeaseStatements`] renders all of it once per elector and
//! hands out ready-to-bind [`Statement`]s.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::lease_row::{NO_LEADER_CANDIDATE_ID, NO_LEADER_LAST_SEEN_MS};
use crate::core::store::ServerInfo;

mod db2;
mod h2;
mod mssql;
mod mysql;
mod oracle;
mod postgres;
mod sqlite;

pub use db2::Db2Dialect;
pub use h2::H2Dialect;
pub use mssql::MsSqlDialect;
pub use mysql::MySqlDialect;
pub use oracle::OracleDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Column list used by every conditional insert.
pub const INSERT_COLUMNS: &str = "(role_id, candidate_id, last_seen_timestamp, lease_counter)";

/// Database engines with a known dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum DatabaseEngine {
    Postgresql,
    Mysql,
    Mariadb,
    Oracle,
    Mssql,
    H2,
    /// Db2 for Linux, Unix and Windows.
    Db2Luw,
    Sqlite,
}

impl DatabaseEngine {
    /// Dialect used to talk to this engine.
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DatabaseEngine::Postgresql => &PostgresDialect,
            DatabaseEngine::Mysql | DatabaseEngine::Mariadb => &MySqlDialect,
            DatabaseEngine::Oracle => &OracleDialect,
            DatabaseEngine::Mssql => &MsSqlDialect,
            DatabaseEngine::H2 => &H2Dialect,
            DatabaseEngine::Db2Luw => &Db2Dialect,
            DatabaseEngine::Sqlite => &SqliteDialect,
        }
    }

    /// Product name the engine reports about itself.
    pub fn product_name(self) -> &'static str {
        match self {
            DatabaseEngine::Postgresql => "PostgreSQL",
            DatabaseEngine::Mysql => "MySQL",
            DatabaseEngine::Mariadb => "MariaDB",
            DatabaseEngine::Oracle => "Oracle",
            DatabaseEngine::Mssql => "Microsoft SQL Server",
            DatabaseEngine::H2 => "H2",
            DatabaseEngine::Db2Luw => "DB2/LINUXX8664",
            DatabaseEngine::Sqlite => "SQLite",
        }
    }

    /// Determines the engine from what a live server reports about itself.
    ///
    /// Order matters: the most specific product names are checked first.
    /// MariaDB servers sometimes identify as MySQL, in which case the version
    /// string gives them away.
    pub fn detect(info: &ServerInfo) -> Result<Self, UnknownEngine> {
        let product = info.product_name.trim();
        let engine = if product.starts_with("Microsoft SQL Server") {
            DatabaseEngine::Mssql
        } else if product.starts_with("PostgreSQL") {
            DatabaseEngine::Postgresql
        } else if product.starts_with("MySQL") {
            if info.version.contains("MariaDB") {
                DatabaseEngine::Mariadb
            } else {
                DatabaseEngine::Mysql
            }
        } else if product.starts_with("MariaDB") {
            DatabaseEngine::Mariadb
        } else if product.starts_with("Oracle") {
            DatabaseEngine::Oracle
        } else if product.starts_with("H2") {
            DatabaseEngine::H2
        } else if product.starts_with("DB2") {
            DatabaseEngine::Db2Luw
        } else if product.starts_with("SQLite") {
            DatabaseEngine::Sqlite
        } else {
            return Err(UnknownEngine {
                product_name: info.product_name.clone(),
                version: info.version.clone(),
            });
        };
        Ok(engine)
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseEngine::Postgresql => "POSTGRESQL",
            DatabaseEngine::Mysql => "MYSQL",
            DatabaseEngine::Mariadb => "MARIADB",
            DatabaseEngine::Oracle => "ORACLE",
            DatabaseEngine::Mssql => "MSSQL",
            DatabaseEngine::H2 => "H2",
            DatabaseEngine::Db2Luw => "DB2_LUW",
            DatabaseEngine::Sqlite => "SQLITE",
        };
        f.write_str(name)
    }
}

/// The server reported a product this crate has no dialect for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown database engine: {product_name} (version: {version})")]
pub struct UnknownEngine {
    pub product_name: String,
    pub version: String,
}

/// Location of the lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }

    /// Name as used in SQL text, schema-qualified when a schema is set.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }

    /// Name for log and error messages. Falls back to the connection's current
    /// schema when none is configured.
    pub fn display_name(&self, current_schema: Option<&str>) -> String {
        match (self.schema.as_deref(), current_schema) {
            (Some(schema), _) | (None, Some(schema)) if !schema.is_empty() => {
                format!("{}.{}", schema, self.table)
            }
            _ => self.table.clone(),
        }
    }
}

/// What a database error looks like once stripped of its driver type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbErrorInfo {
    pub sqlstate: Option<String>,
    pub vendor_code: Option<i64>,
    pub message: String,
}

impl DbErrorInfo {
    pub fn sqlstate_is(&self, state: &str) -> bool {
        self.sqlstate.as_deref() == Some(state)
    }

    pub fn sqlstate_class_is(&self, class: &str) -> bool {
        self.sqlstate
            .as_deref()
            .is_some_and(|state| state.starts_with(class))
    }

    pub fn vendor_code_in(&self, codes: &[i64]) -> bool {
        self.vendor_code.is_some_and(|code| codes.contains(&code))
    }
}

/// Engine-specific wording of the lease statements.
///
/// Bind order is fixed for every statement and is the same across dialects:
///
/// | statement | parameters |
/// |---|---|
/// | select / lock row / insert | `role_id` |
/// | affirm, relinquish | `role_id`, `candidate_id` |
/// | assume | `candidate_id`, `lease_counter`, `role_id` |
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Expression evaluated by the server yielding milliseconds since the
    /// epoch, UTC, without leap seconds.
    fn current_utc_ms(&self) -> &'static str;

    /// Insert-if-absent of the initial row. Must not fail when several
    /// candidates race to insert the same role.
    fn insert_role_sql(&self, table: &TableName) -> String;

    /// Bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn varchar_type(&self) -> &'static str {
        "varchar"
    }

    fn bigint_type(&self) -> &'static str {
        "bigint"
    }

    /// Suffix needed to select an expression without a table.
    fn from_nothing(&self) -> &'static str {
        ""
    }

    /// Select returning `(candidate_id, last_seen_timestamp, now_utc_ms,
    /// lease_counter)` while holding an exclusive lock on the row until the
    /// transaction ends.
    fn select_for_update_sql(&self, table: &TableName, _lock_timeout: Duration) -> String {
        format!(
            "SELECT candidate_id, last_seen_timestamp, {} AS now_utc_ms, lease_counter \
             FROM {} WHERE role_id = {} FOR UPDATE",
            self.current_utc_ms(),
            table.qualified(),
            self.placeholder(1),
        )
    }

    /// Statement issued before the select when the engine cannot lock the row
    /// as part of the select itself.
    fn lock_row_sql(&self, _table: &TableName) -> Option<String> {
        None
    }

    /// Statement bounding how long the transaction waits for a row lock.
    fn lock_timeout_sql(&self, _lock_timeout: Duration) -> Option<String> {
        None
    }

    fn affirm_sql(&self, table: &TableName) -> String {
        format!(
            "UPDATE {} SET last_seen_timestamp = {} WHERE role_id = {} AND candidate_id = {}",
            table.qualified(),
            self.current_utc_ms(),
            self.placeholder(1),
            self.placeholder(2),
        )
    }

    fn assume_sql(&self, table: &TableName) -> String {
        format!(
            "UPDATE {} SET candidate_id = {}, last_seen_timestamp = {}, lease_counter = {} \
             WHERE role_id = {}",
            table.qualified(),
            self.placeholder(1),
            self.current_utc_ms(),
            self.placeholder(2),
            self.placeholder(3),
        )
    }

    fn relinquish_sql(&self, table: &TableName) -> String {
        format!(
            "UPDATE {} SET candidate_id = '{}', last_seen_timestamp = {} \
             WHERE role_id = {} AND candidate_id = {}",
            table.qualified(),
            NO_LEADER_CANDIDATE_ID,
            NO_LEADER_LAST_SEEN_MS,
            self.placeholder(1),
            self.placeholder(2),
        )
    }

    fn create_table_sql(&self, table: &TableName) -> String {
        format!(
            "CREATE TABLE {} (\
             role_id {varchar}(20) NOT NULL, \
             candidate_id {varchar}(256) NOT NULL, \
             last_seen_timestamp {bigint} NOT NULL, \
             lease_counter {bigint} NOT NULL, \
             PRIMARY KEY (role_id))",
            table.qualified(),
            varchar = self.varchar_type(),
            bigint = self.bigint_type(),
        )
    }

    /// `SELECT <now>` on its own, useful to compare clocks.
    fn current_time_sql(&self) -> String {
        format!("SELECT {} {}", self.current_utc_ms(), self.from_nothing())
            .trim_end()
            .to_string()
    }

    /// Does the error mean the object we tried to create is already there?
    fn is_already_exists(&self, _error: &DbErrorInfo) -> bool {
        false
    }

    /// Is the error worth retrying on the next cycle: lock wait timeouts,
    /// deadlocks, serialization failures and lost connections.
    fn is_transient(&self, error: &DbErrorInfo) -> bool {
        error.sqlstate_class_is("08") || error.sqlstate_class_is("40")
    }
}

/// `VALUES` list of the initial row, with the role id as first parameter.
pub(crate) fn initial_row_values(dialect: &dyn Dialect) -> String {
    format!(
        "({}, '{}', {}, 0)",
        dialect.placeholder(1),
        NO_LEADER_CANDIDATE_ID,
        NO_LEADER_LAST_SEEN_MS
    )
}

/// Whole seconds for engines whose lock timeouts cannot go below one second.
pub(crate) fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

/// Kind of statement, so stores that do not speak SQL can still act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    LockTimeout,
    LockRow,
    SelectForUpdate,
    Affirm,
    Assume,
    Relinquish,
    InsertRole,
    CreateTable,
    CurrentTime,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::LockTimeout => "lock timeout",
            StatementKind::LockRow => "lock row",
            StatementKind::SelectForUpdate => "select for update",
            StatementKind::Affirm => "affirm leadership",
            StatementKind::Assume => "assume leadership",
            StatementKind::Relinquish => "relinquish leadership",
            StatementKind::InsertRole => "insert role row",
            StatementKind::CreateTable => "create table",
            StatementKind::CurrentTime => "current time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    BigInt(i64),
}

/// One rendered statement plus its bind parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    kind: StatementKind,
    sql: String,
    params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            params,
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    /// Text parameter at the 0-based `index`.
    pub fn text_param(&self, index: usize) -> Option<&str> {
        match self.params.get(index) {
            Some(SqlParam::Text(value)) => Some(value),
            _ => None,
        }
    }

    /// Integer parameter at the 0-based `index`.
    pub fn bigint_param(&self, index: usize) -> Option<i64> {
        match self.params.get(index) {
            Some(SqlParam::BigInt(value)) => Some(*value),
            _ => None,
        }
    }
}

/// All statements one elector needs, rendered once for its engine and table.
#[derive(Debug, Clone)]
pub struct LeaseStatements {
    engine: DatabaseEngine,
    table: TableName,
    lock_timeout: Option<String>,
    lock_row: Option<String>,
    select: String,
    affirm: String,
    assume: String,
    relinquish: String,
    insert_role: String,
    create_table: String,
    current_time: String,
}

impl LeaseStatements {
    pub fn new(engine: DatabaseEngine, table: TableName, lock_timeout: Duration) -> Self {
        let dialect = engine.dialect();
        Self {
            engine,
            lock_timeout: dialect.lock_timeout_sql(lock_timeout),
            lock_row: dialect.lock_row_sql(&table),
            select: dialect.select_for_update_sql(&table, lock_timeout),
            affirm: dialect.affirm_sql(&table),
            assume: dialect.assume_sql(&table),
            relinquish: dialect.relinquish_sql(&table),
            insert_role: dialect.insert_role_sql(&table),
            create_table: dialect.create_table_sql(&table),
            current_time: dialect.current_time_sql(),
            table,
        }
    }

    pub fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.engine.dialect()
    }

    pub fn lock_timeout(&self) -> Option<Statement> {
        self.lock_timeout
            .as_ref()
            .map(|sql| Statement::new(StatementKind::LockTimeout, sql.clone(), Vec::new()))
    }

    pub fn lock_row(&self, role_id: &str) -> Option<Statement> {
        self.lock_row.as_ref().map(|sql| {
            Statement::new(
                StatementKind::LockRow,
                sql.clone(),
                vec![SqlParam::Text(role_id.to_string())],
            )
        })
    }

    pub fn select_for_update(&self, role_id: &str) -> Statement {
        Statement::new(
            StatementKind::SelectForUpdate,
            self.select.clone(),
            vec![SqlParam::Text(role_id.to_string())],
        )
    }

    pub fn affirm(&self, role_id: &str, candidate_id: &str) -> Statement {
        Statement::new(
            StatementKind::Affirm,
            self.affirm.clone(),
            vec![
                SqlParam::Text(role_id.to_string()),
                SqlParam::Text(candidate_id.to_string()),
            ],
        )
    }

    pub fn assume(&self, role_id: &str, candidate_id: &str, new_lease_counter: i64) -> Statement {
        Statement::new(
            StatementKind::Assume,
            self.assume.clone(),
            vec![
                SqlParam::Text(candidate_id.to_string()),
                SqlParam::BigInt(new_lease_counter),
                SqlParam::Text(role_id.to_string()),
            ],
        )
    }

    pub fn relinquish(&self, role_id: &str, candidate_id: &str) -> Statement {
        Statement::new(
            StatementKind::Relinquish,
            self.relinquish.clone(),
            vec![
                SqlParam::Text(role_id.to_string()),
                SqlParam::Text(candidate_id.to_string()),
            ],
        )
    }

    pub fn insert_role(&self, role_id: &str) -> Statement {
        Statement::new(
            StatementKind::InsertRole,
            self.insert_role.clone(),
            vec![SqlParam::Text(role_id.to_string())],
        )
    }

    pub fn create_table(&self) -> Statement {
        Statement::new(StatementKind::CreateTable, self.create_table.clone(), Vec::new())
    }

    pub fn current_time(&self) -> Statement {
        Statement::new(StatementKind::CurrentTime, self.current_time.clone(), Vec::new())
    }
}
