use crate::types::{ColumnRecord, LeaseRowRecord, ServerRecord};
use anyhow::Context;
use async_trait::async_trait;
use leasehold::core::dialect::{DatabaseEngine, DbErrorInfo, SqlParam, Statement, TableName};
use leasehold::core::lease_row::LeaseRow;
use leasehold::core::store::{ColumnInfo, LeaseStore, LeaseTransaction, ServerInfo, StoreError};
use sqlx::mysql::{MySqlArguments, MySqlDatabaseError, MySqlRow};
use sqlx::query::Query;
use sqlx::{FromRow, MySql, MySqlPool, Transaction};
use tracing::instrument;

/// A lease store backed by MySQL or MariaDB
#[derive(Clone)]
pub struct MySqlLeaseStore {
    pub(crate) pool: MySqlPool,
}

impl MySqlLeaseStore {
    pub fn with_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for MySqlLeaseStore {
    type Transaction = MySqlLeaseTransaction;

    #[instrument(skip_all, err)]
    async fn begin(&self) -> Result<MySqlLeaseTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to start a transaction")
            .map_err(StoreError::Connect)?;
        Ok(MySqlLeaseTransaction { tx })
    }

    #[instrument(skip_all, err, fields(statement = %statement.kind()))]
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let result = bind(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error(e, statement))?;
        Ok(result.rows_affected())
    }

    /// MariaDB identifies itself through the version string only.
    #[instrument(skip_all, err)]
    async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        let record = sqlx::query_as::<_, ServerRecord>(
            "SELECT VERSION() AS version, DATABASE() AS current_schema",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to query server version")
        .map_err(StoreError::Connect)?;
        let engine = if record.version.contains("MariaDB") {
            DatabaseEngine::Mariadb
        } else {
            DatabaseEngine::Mysql
        };
        Ok(ServerInfo {
            product_name: engine.product_name().to_string(),
            version: record.version,
            current_schema: record.current_schema,
        })
    }

    #[instrument(skip_all, err, fields(table = %table.qualified()))]
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
        let columns = sqlx::query_as::<_, ColumnRecord>(
            "SELECT CAST(COLUMN_NAME AS CHAR) AS column_name,
                    CAST(DATA_TYPE AS CHAR) AS data_type,
                    CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS character_maximum_length,
                    CAST(IS_NULLABLE AS CHAR) AS is_nullable
             FROM information_schema.COLUMNS
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
             ORDER BY ORDINAL_POSITION",
        )
        .bind(table.schema.as_deref())
        .bind(table.table.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to inspect lease table"))?;
        Ok(columns.into_iter().map(ColumnInfo::from).collect())
    }
}

/// A transaction on a pooled MySQL connection. Rolled back by sqlx when dropped.
pub struct MySqlLeaseTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl LeaseTransaction for MySqlLeaseTransaction {
    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError> {
        let rows = bind(statement)
            .try_map(|row: MySqlRow| LeaseRowRecord::from_row(&row))
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

fn bind(statement: &Statement) -> Query<'_, MySql, MySqlArguments> {
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

/// Lock wait timeouts and deadlocks are told apart by their error number,
/// the SQLSTATE alone is too coarse.
pub(crate) fn classify<C>(error: sqlx::Error, context: C) -> StoreError
where
    C: std::fmt::Display + Send + Sync + 'static,
{
    let dialect = DatabaseEngine::Mysql.dialect();
    let (transient, already_exists) = match &error {
        sqlx::Error::Database(db) => {
            let info = DbErrorInfo {
                sqlstate: db.code().map(|code| code.into_owned()),
                vendor_code: db
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(|e| i64::from(e.number())),
                message: db.message().to_string(),
            };
            (dialect.is_transient(&info), dialect.is_already_exists(&info))
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => (true, false),
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
