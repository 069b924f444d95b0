use crate::types::{ColumnRecord, LeaseRowRecord};
use anyhow::Context;
use async_trait::async_trait;
use leasehold::core::dialect::{DatabaseEngine, DbErrorInfo, SqlParam, Statement, TableName};
use leasehold::core::lease_row::LeaseRow;
use leasehold::core::store::{ColumnInfo, LeaseStore, LeaseTransaction, ServerInfo, StoreError};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

const MAIN_SCHEMA: &str = "main";

/// A lease store backed by a SQLite database file.
///
/// Only processes on the same host can share a SQLite file, so this is mostly
/// useful for tests and single-host deployments. Row locks do not exist: the
/// first statement of every cycle is a no-op update that takes the database
/// write lock instead.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    type Transaction = SqliteLeaseTransaction;

    #[instrument(skip_all, err)]
    async fn begin(&self) -> Result<SqliteLeaseTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to start a transaction")
            .map_err(StoreError::Connect)?;
        Ok(SqliteLeaseTransaction { tx })
    }

    #[instrument(skip_all, err, fields(statement = %statement.kind()))]
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let result = bind(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error(e, statement))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, err)]
    async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await
            .context("Failed to query SQLite version")
            .map_err(StoreError::Connect)?;
        Ok(ServerInfo {
            product_name: DatabaseEngine::Sqlite.product_name().to_string(),
            version,
            current_schema: Some(MAIN_SCHEMA.to_string()),
        })
    }

    #[instrument(skip_all, err, fields(table = %table.qualified()))]
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
        let columns = sqlx::query_as::<_, ColumnRecord>(
            r#"SELECT name, type AS declared_type, "notnull" AS not_null
               FROM pragma_table_info(?1, ?2)
               ORDER BY cid"#,
        )
        .bind(table.table.as_str())
        .bind(table.schema.as_deref().unwrap_or(MAIN_SCHEMA))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to inspect lease table"))?;
        Ok(columns.into_iter().map(ColumnInfo::from).collect())
    }
}

/// A deferred SQLite transaction. Rolled back by sqlx when dropped.
pub struct SqliteLeaseTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl LeaseTransaction for SqliteLeaseTransaction {
    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError> {
        let rows = bind(statement)
            .try_map(|row: SqliteRow| LeaseRowRecord::from_row(&row))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| store_error(e, statement))?;
        Ok(rows.into_iter().map(LeaseRow::from).collect())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let result = bind(statement)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| store_error(e, statement))?;
        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| classify(e, "Failed to commit transaction"))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| classify(e, "Failed to roll back transaction"))
    }
}

fn bind(statement: &Statement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    statement
        .params()
        .iter()
        .fold(sqlx::query(statement.sql()), |query, param| match param {
            SqlParam::Text(value) => query.bind(value.as_str()),
            SqlParam::BigInt(value) => query.bind(*value),
        })
}

fn store_error(error: sqlx::Error, statement: &Statement) -> StoreError {
    classify(error, format!("Failed to execute {} statement", statement.kind()))
}

/// SQLite has no SQLSTATE, only its (extended) result code.
pub(crate) fn classify<C>(error: sqlx::Error, context: C) -> StoreError
where
    C: std::fmt::Display + Send + Sync + 'static,
{
    let dialect = DatabaseEngine::Sqlite.dialect();
    let (transient, already_exists) = match &error {
        sqlx::Error::Database(db) => {
            let info = DbErrorInfo {
                sqlstate: None,
                vendor_code: db.code().and_then(|code| code.parse().ok()),
                message: db.message().to_string(),
            };
            (dialect.is_transient(&info), dialect.is_already_exists(&info))
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (true, false),
        _ => (false, false),
    };
    let error = anyhow::Error::new(error).context(context);
    if already_exists {
        StoreError::AlreadyExists(error)
    } else if transient {
        StoreError::Transient(error)
    } else {
        StoreError::DatabaseError(error)
    }
}
