//! In-process lease store.
//!
//! Behaves like a database holding the lease table: a transaction takes an
//! exclusive lock on the table with its first statement and keeps it until
//! commit or rollback, writes become visible on commit only, and "now" comes
//! from the store's [`Clock`], not from the caller. Useful for tests and for
//! single-process setups that want the elector API without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::dialect::{DatabaseEngine, Statement, StatementKind, TableName};
use crate::core::lease_row::{LeaseRow, NO_LEADER_CANDIDATE_ID, NO_LEADER_LAST_SEEN_MS};
use crate::core::store::{
    ColumnInfo, ColumnType, LeaseStore, LeaseTransaction, ServerInfo, StoreError,
};

/// Source of the store's notion of "now", in milliseconds since the epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_millis)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredLease {
    candidate_id: String,
    last_seen_timestamp: i64,
    lease_counter: i64,
}

type Leases = BTreeMap<String, StoredLease>;

/// A lease table kept in memory. Clones share the same table.
#[derive(Clone)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<Leases>>,
    table_exists: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    engine: DatabaseEngine,
}

impl MemoryLeaseStore {
    /// Store with an existing, empty lease table and the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            leases: Arc::new(Mutex::new(Leases::new())),
            table_exists: Arc::new(AtomicBool::new(true)),
            clock: Arc::new(clock),
            engine: DatabaseEngine::Postgresql,
        }
    }

    /// Start without a lease table, as if the database were empty.
    pub fn without_table(self) -> Self {
        self.table_exists.store(false, Ordering::SeqCst);
        self
    }

    /// Engine reported by [`LeaseStore::server_info`]. PostgreSQL unless set.
    pub fn reporting_engine(mut self, engine: DatabaseEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Current content of the row for `role_id`, read outside any transaction.
    pub async fn row(&self, role_id: &str) -> Option<LeaseRow> {
        let leases = self.leases.lock().await;
        leases.get(role_id).map(|lease| LeaseRow {
            candidate_id: lease.candidate_id.clone(),
            last_seen_timestamp: lease.last_seen_timestamp,
            now_utc_ms: self.clock.now_millis(),
            lease_counter: lease.lease_counter,
        })
    }

    /// Overwrite (or create) the row for `role_id`, like an operator would with SQL.
    pub async fn put_row(
        &self,
        role_id: &str,
        candidate_id: &str,
        last_seen_timestamp: i64,
        lease_counter: i64,
    ) {
        self.leases.lock().await.insert(
            role_id.to_string(),
            StoredLease {
                candidate_id: candidate_id.to_string(),
                last_seen_timestamp,
                lease_counter,
            },
        );
    }

    pub async fn delete_row(&self, role_id: &str) {
        self.leases.lock().await.remove(role_id);
    }

    fn ensure_table(&self) -> Result<(), StoreError> {
        if self.table_exists.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::DatabaseError(anyhow::anyhow!(
                "lease table does not exist"
            )))
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLeaseStore")
            .field("engine", &self.engine)
            .field("table_exists", &self.table_exists.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(MemoryTransaction {
            store: self.clone(),
            lock: None,
            pending: None,
        })
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        match statement.kind() {
            StatementKind::CreateTable => {
                if self.table_exists.swap(true, Ordering::SeqCst) {
                    Err(StoreError::AlreadyExists(anyhow::anyhow!(
                        "lease table already exists"
                    )))
                } else {
                    Ok(0)
                }
            }
            _ => {
                let mut tx = self.begin().await?;
                let affected = tx.execute(statement).await?;
                tx.commit().await?;
                Ok(affected)
            }
        }
    }

    async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        Ok(ServerInfo {
            product_name: self.engine.product_name().to_string(),
            version: "in-memory".to_string(),
            current_schema: None,
        })
    }

    async fn table_columns(&self, _table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
        if !self.table_exists.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(vec![
            ColumnInfo::new(
                "role_id",
                ColumnType::Text {
                    max_length: Some(20),
                },
                false,
            ),
            ColumnInfo::new(
                "candidate_id",
                ColumnType::Text {
                    max_length: Some(256),
                },
                false,
            ),
            ColumnInfo::new("last_seen_timestamp", ColumnType::Integer { bits: 64 }, false),
            ColumnInfo::new("lease_counter", ColumnType::Integer { bits: 64 }, false),
        ])
    }
}

/// Transaction of a [`MemoryLeaseStore`]. Holds the table lock from its first
/// statement until it ends.
pub struct MemoryTransaction {
    store: MemoryLeaseStore,
    lock: Option<OwnedMutexGuard<Leases>>,
    pending: Option<Leases>,
}

impl MemoryTransaction {
    async fn working_copy(&mut self) -> Result<&mut Leases, StoreError> {
        self.store.ensure_table()?;
        if self.lock.is_none() {
            let guard = self.store.leases.clone().lock_owned().await;
            self.pending = Some((*guard).clone());
            self.lock = Some(guard);
        }
        self.pending
            .as_mut()
            .ok_or_else(|| StoreError::DatabaseError(anyhow::anyhow!("transaction has ended")))
    }
}

fn text_param<'a>(statement: &'a Statement, index: usize) -> Result<&'a str, StoreError> {
    statement
        .text_param(index)
        .ok_or_else(|| StoreError::InvalidStatement {
            kind: statement.kind().to_string(),
            reason: format!("parameter {} must be text", index + 1),
        })
}

fn bigint_param(statement: &Statement, index: usize) -> Result<i64, StoreError> {
    statement
        .bigint_param(index)
        .ok_or_else(|| StoreError::InvalidStatement {
            kind: statement.kind().to_string(),
            reason: format!("parameter {} must be an integer", index + 1),
        })
}

#[async_trait]
impl LeaseTransaction for MemoryTransaction {
    async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError> {
        if statement.kind() != StatementKind::SelectForUpdate {
            return Err(StoreError::InvalidStatement {
                kind: statement.kind().to_string(),
                reason: "only the lease select returns rows".to_string(),
            });
        }
        let role_id = text_param(statement, 0)?.to_string();
        let clock = self.store.clock.clone();
        let leases = self.working_copy().await?;
        let now = clock.now_millis();
        Ok(leases
            .get(&role_id)
            .map(|lease| LeaseRow {
                candidate_id: lease.candidate_id.clone(),
                last_seen_timestamp: lease.last_seen_timestamp,
                now_utc_ms: now,
                lease_counter: lease.lease_counter,
            })
            .into_iter()
            .collect())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let clock = self.store.clock.clone();
        match statement.kind() {
            // Session settings and clock reads take no lock.
            StatementKind::LockTimeout | StatementKind::CurrentTime => {
                self.store.ensure_table()?;
                Ok(0)
            }
            StatementKind::LockRow => {
                let role_id = text_param(statement, 0)?.to_string();
                let leases = self.working_copy().await?;
                Ok(u64::from(leases.contains_key(&role_id)))
            }
            StatementKind::Affirm => {
                let role_id = text_param(statement, 0)?.to_string();
                let candidate_id = text_param(statement, 1)?.to_string();
                let leases = self.working_copy().await?;
                match leases.get_mut(&role_id) {
                    Some(lease) if lease.candidate_id == candidate_id => {
                        lease.last_seen_timestamp = clock.now_millis();
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            StatementKind::Assume => {
                let candidate_id = text_param(statement, 0)?.to_string();
                let lease_counter = bigint_param(statement, 1)?;
                let role_id = text_param(statement, 2)?.to_string();
                let leases = self.working_copy().await?;
                match leases.get_mut(&role_id) {
                    Some(lease) => {
                        lease.candidate_id = candidate_id;
                        lease.last_seen_timestamp = clock.now_millis();
                        lease.lease_counter = lease_counter;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            StatementKind::Relinquish => {
                let role_id = text_param(statement, 0)?.to_string();
                let candidate_id = text_param(statement, 1)?.to_string();
                let leases = self.working_copy().await?;
                match leases.get_mut(&role_id) {
                    Some(lease) if lease.candidate_id == candidate_id => {
                        lease.candidate_id = NO_LEADER_CANDIDATE_ID.to_string();
                        lease.last_seen_timestamp = NO_LEADER_LAST_SEEN_MS;
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            StatementKind::InsertRole => {
                let role_id = text_param(statement, 0)?.to_string();
                let leases = self.working_copy().await?;
                if leases.contains_key(&role_id) {
                    Ok(0)
                } else {
                    leases.insert(
                        role_id,
                        StoredLease {
                            candidate_id: NO_LEADER_CANDIDATE_ID.to_string(),
                            last_seen_timestamp: NO_LEADER_LAST_SEEN_MS,
                            lease_counter: 0,
                        },
                    );
                    Ok(1)
                }
            }
            StatementKind::SelectForUpdate | StatementKind::CreateTable => {
                Err(StoreError::InvalidStatement {
                    kind: statement.kind().to_string(),
                    reason: "not allowed inside a transaction".to_string(),
                })
            }
        }
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if let (Some(mut guard), Some(pending)) = (self.lock.take(), self.pending.take()) {
            *guard = pending;
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.pending = None;
        self.lock = None;
        Ok(())
    }
}
