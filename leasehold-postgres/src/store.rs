use crate::types::{ColumnRecord, LeaseRowRecord, ServerRecord};
use anyhow::Context;
use async_trait::async_trait;
use leasehold::core::dialect::{DatabaseEngine, DbErrorInfo, SqlParam, Statement, TableName};
use leasehold::core::lease_row::LeaseRow;
use leasehold::core::store::{ColumnInfo, LeaseStore, LeaseTransaction, ServerInfo, StoreError};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::instrument;

/// A lease store backed by PostgreSQL
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pub(crate) pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    type Transaction = PostgresLeaseTransaction;

    #[instrument(skip_all, err)]
    async fn begin(&self) -> Result<PostgresLeaseTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to start a transaction")
            .map_err(StoreError::Connect)?;
        Ok(PostgresLeaseTransaction { tx })
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
        let record = sqlx::query_as::<_, ServerRecord>(
            "SELECT current_setting('server_version') AS version, current_schema() AS current_schema",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to query server version")
        .map_err(StoreError::Connect)?;
        Ok(ServerInfo {
            product_name: DatabaseEngine::Postgresql.product_name().to_string(),
            version: record.version,
            current_schema: record.current_schema,
        })
    }

    #[instrument(skip_all, err, fields(table = %table.qualified()))]
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
        // Unquoted identifiers are folded to lower case by the server.
        let columns = sqlx::query_as::<_, ColumnRecord>(
            "SELECT column_name::text AS column_name, data_type::text AS data_type,
                    character_maximum_length::bigint AS character_maximum_length,
                    is_nullable::text AS is_nullable
             FROM information_schema.columns
             WHERE table_schema = COALESCE(lower($1), current_schema()) AND table_name = lower($2)
             ORDER BY ordinal_position",
        )
        .bind(table.schema.as_deref())
        .bind(table.table.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to inspect lease table"))?;
        Ok(columns.into_iter().map(ColumnInfo::from).collect())
    }
}

/// A transaction on a pooled PostgreSQL connection. Rolled back by sqlx when dropped.
pub struct PostgresLeaseTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LeaseTransaction for PostgresLeaseTransaction {
    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError> {
        let rows = bind(statement)
            .try_map(|row: PgRow| LeaseRowRecord::from_row(&row))
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

fn bind(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
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

pub(crate) fn classify<C>(error: sqlx::Error, context: C) -> StoreError
where
    C: std::fmt::Display + Send + Sync + 'static,
{
    let dialect = DatabaseEngine::Postgresql.dialect();
    let (transient, already_exists) = match &error {
        sqlx::Error::Database(db) => {
            let info = DbErrorInfo {
                sqlstate: db.code().map(|code| code.into_owned()),
                vendor_code: None,
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
