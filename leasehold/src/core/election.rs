//! One election cycle at a time.
//!
//! [`ElectionEngine::elect`] runs a single cycle inside one database
//! transaction: lock the lease row, look at who holds it, affirm, assume,
//! relinquish or do nothing, commit. Everything that goes wrong is folded into
//! the returned [`Event`], the engine itself never fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::{ConfigError, ElectorOptions};
use crate::core::dialect::{DatabaseEngine, LeaseStatements, UnknownEngine};
use crate::core::event::{ElectionError, ErrorRecord, Event, EventType};
use crate::core::lease_row::{next_lease_counter, Holder, LeaseRow};
use crate::core::schema::verify_columns;
use crate::core::store::{LeaseStore, LeaseTransaction, StoreError};
use crate::core::DateTime;

/// Transient failures in a row before they count as non-recoverable.
pub const MAX_CONSECUTIVE_TRANSIENT_ERRORS: u32 = 3;

/// Errors that prevent an elector from starting.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PreFlightError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Could not connect to database: {0}")]
    Connect(#[source] StoreError),
    #[error(transparent)]
    UnknownEngine(#[from] UnknownEngine),
    #[error("Could not inspect table {table}: {source}")]
    Inspect {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("Could not create table {table}: {source}")]
    CreateTable {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("Table {0} does not exist")]
    MissingTable(String),
    #[error("Table {table} does not have the expected shape: {problems}")]
    TableShape { table: String, problems: String },
    #[error("Could not insert row for role_id='{role_id}' into table {table}: {source}")]
    InsertRole {
        table: String,
        role_id: String,
        #[source]
        source: StoreError,
    },
}

/// Runs election cycles for one candidate of one role.
pub struct ElectionEngine<S: LeaseStore> {
    store: Arc<S>,
    statements: LeaseStatements,
    role_id: String,
    candidate_id: String,
    assume_dead_ms: i64,
    query_timeout: Duration,
    table_display: String,
    leader: Arc<AtomicBool>,
    has_relinquished: bool,
    consecutive_transient_errors: u32,
    has_had_successful_execution: bool,
}

impl<S: LeaseStore> ElectionEngine<S> {
    /// Engine over an already provisioned table. See [`ElectionEngine::prepare`]
    /// for the variant that checks and provisions first.
    pub fn new(
        store: Arc<S>,
        statements: LeaseStatements,
        options: &ElectorOptions,
        table_display: impl Into<String>,
    ) -> Self {
        Self {
            store,
            statements,
            role_id: options.role_id.clone(),
            candidate_id: options.candidate_id.clone(),
            assume_dead_ms: i64::try_from(options.assume_dead_ms).unwrap_or(i64::MAX),
            query_timeout: options.query_timeout(),
            table_display: table_display.into(),
            leader: Arc::new(AtomicBool::new(false)),
            has_relinquished: false,
            consecutive_transient_errors: 0,
            has_had_successful_execution: false,
        }
    }

    /// Validate the options, connect, resolve the engine and get the table ready:
    /// create it when asked to, check its shape and make sure the role has its row.
    #[instrument(skip_all, err, fields(role_id = %options.role_id))]
    pub async fn prepare(store: Arc<S>, options: &ElectorOptions) -> Result<Self, PreFlightError> {
        options.validate()?;
        let server = store.server_info().await.map_err(PreFlightError::Connect)?;
        let engine = match options.database_engine {
            Some(engine) => engine,
            None => {
                let engine = DatabaseEngine::detect(&server)?;
                info!(
                    %engine,
                    product = %server.product_name,
                    version = %server.version,
                    "Auto-detected database engine"
                );
                engine
            }
        };
        let table = options.table();
        let table_display = table.display_name(server.current_schema.as_deref());
        let statements = LeaseStatements::new(engine, table, options.query_timeout());
        let inspect = |source| PreFlightError::Inspect {
            table: table_display.clone(),
            source,
        };

        let mut columns = store
            .table_columns(statements.table())
            .await
            .map_err(inspect)?;
        if columns.is_empty() && options.create_table {
            info!(table = %table_display, "Creating lease table");
            match store.execute(&statements.create_table()).await {
                Ok(_) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(table = %table_display, "Lease table was created concurrently");
                }
                Err(source) => {
                    return Err(PreFlightError::CreateTable {
                        table: table_display.clone(),
                        source,
                    })
                }
            }
            columns = store
                .table_columns(statements.table())
                .await
                .map_err(inspect)?;
        }
        if columns.is_empty() {
            return Err(PreFlightError::MissingTable(table_display));
        }
        verify_columns(&columns).map_err(|problems| PreFlightError::TableShape {
            table: table_display.clone(),
            problems: problems.join("; "),
        })?;

        let inserted = store
            .execute(&statements.insert_role(&options.role_id))
            .await
            .map_err(|source| PreFlightError::InsertRole {
                table: table_display.clone(),
                role_id: options.role_id.clone(),
                source,
            })?;
        if inserted > 0 {
            info!(table = %table_display, role_id = %options.role_id, "Inserted lease row");
        }

        Ok(Self::new(store, statements, options, table_display))
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn database_engine(&self) -> DatabaseEngine {
        self.statements.engine()
    }

    /// Table name as shown in logs and errors.
    pub fn table_display(&self) -> &str {
        &self.table_display
    }

    /// Leadership as of the last completed cycle.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Shared view of [`ElectionEngine::is_leader`] for other tasks.
    pub(crate) fn leadership(&self) -> Arc<AtomicBool> {
        self.leader.clone()
    }

    fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    /// Run one election cycle. With `relinquish` set, a leading candidate gives
    /// up the lease instead of renewing it.
    #[instrument(skip_all, fields(role_id = %self.role_id, candidate_id = %self.candidate_id, relinquish = relinquish))]
    pub async fn elect(&mut self, relinquish: bool) -> Event {
        let started_at = Utc::now();
        let was_leader = self.is_leader();
        match self.run_cycle(started_at, was_leader, relinquish).await {
            Ok(event) => {
                self.has_had_successful_execution = true;
                self.consecutive_transient_errors = 0;
                debug!(%event, "Election cycle completed");
                event
            }
            Err(errors) => {
                self.set_leader(false);
                let event = Event::failed(started_at, &self.role_id, was_leader, errors);
                if event.is_non_recoverable_error() {
                    error!(%event, "Election cycle failed with a non-recoverable error");
                } else {
                    warn!(%event, "Election cycle failed");
                }
                event
            }
        }
    }

    async fn run_cycle(
        &mut self,
        started_at: DateTime,
        was_leader: bool,
        relinquish: bool,
    ) -> Result<Event, Vec<ErrorRecord>> {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(error) => return Err(vec![self.classify_begin_failure(error)]),
        };
        match self
            .locked_cycle(&mut tx, started_at, was_leader, relinquish)
            .await
        {
            Ok(event) => match tx.commit().await {
                Ok(()) => {
                    self.apply_committed(&event);
                    Ok(event)
                }
                Err(error) => Err(vec![self.classify(ElectionError::Store(error))]),
            },
            Err(error) => {
                let mut errors = vec![self.classify(error)];
                if let Err(rollback) = tx.rollback().await {
                    errors.push(ErrorRecord::non_recoverable(ElectionError::Rollback(
                        rollback,
                    )));
                }
                Err(errors)
            }
        }
    }

    /// Leadership changes only become visible once the database has them.
    fn apply_committed(&mut self, event: &Event) {
        match event.event_type() {
            EventType::LeadershipAssumed => self.set_leader(true),
            EventType::LeadershipLost => {
                self.set_leader(false);
                self.has_relinquished = true;
            }
            _ => {}
        }
    }

    async fn locked_cycle(
        &mut self,
        tx: &mut S::Transaction,
        started_at: DateTime,
        was_leader: bool,
        relinquish: bool,
    ) -> Result<Event, ElectionError> {
        let row = self.lock_and_read(tx).await?;
        let holder = row.holder(&self.candidate_id);
        self.check_consistency(&row, holder, was_leader)?;
        let expired = row.is_expired(self.assume_dead_ms);

        let event = match holder {
            Holder::Me if relinquish => {
                let statement = self.statements.relinquish(&self.role_id, &self.candidate_id);
                let rows = tx.execute(&statement).await?;
                self.expect_one_row("relinquish", rows)?;
                info!(lease_counter = row.lease_counter, "Leadership relinquished");
                Event::relinquished(started_at, &self.role_id)
            }
            Holder::Me => {
                let statement = self.statements.affirm(&self.role_id, &self.candidate_id);
                let rows = tx.execute(&statement).await?;
                self.expect_one_row("affirm", rows)?;
                Event::confirmed(started_at, &self.role_id, &row)
            }
            Holder::SomeoneElse if !expired => {
                self.has_relinquished = false;
                Event::noop(started_at, &self.role_id, &row)
            }
            Holder::SomeoneElse | Holder::Nobody if expired && !self.has_relinquished => {
                let lease_counter = next_lease_counter(row.lease_counter);
                let statement =
                    self.statements
                        .assume(&self.role_id, &self.candidate_id, lease_counter);
                let rows = tx.execute(&statement).await?;
                self.expect_one_row("assume", rows)?;
                info!(
                    lease_counter,
                    previous_holder = %row.candidate_id,
                    lease_age_ms = row.lease_age_ms(),
                    "Leadership assumed"
                );
                Event::assumed(started_at, &self.role_id, &row, lease_counter)
            }
            Holder::SomeoneElse | Holder::Nobody => Event::noop(started_at, &self.role_id, &row),
        };
        Ok(event)
    }

    /// Take the row lock and read the row. Everything up to the read, the
    /// lock wait setting included, is bounded by the query timeout.
    async fn lock_and_read(&self, tx: &mut S::Transaction) -> Result<LeaseRow, ElectionError> {
        let read = async {
            if let Some(statement) = self.statements.lock_timeout() {
                tx.execute(&statement).await?;
            }
            if let Some(statement) = self.statements.lock_row(&self.role_id) {
                tx.execute(&statement).await?;
            }
            tx.fetch_rows(&self.statements.select_for_update(&self.role_id))
                .await
        };
        let mut rows = tokio::time::timeout(self.query_timeout, read)
            .await
            .map_err(|_| ElectionError::LockTimeout(self.query_timeout))??;
        match rows.len() {
            1 => rows.pop().ok_or_else(|| self.missing_row()),
            0 => Err(self.missing_row()),
            count => Err(ElectionError::DuplicateRows {
                table: self.table_display.clone(),
                role_id: self.role_id.clone(),
                rows: count,
            }),
        }
    }

    fn missing_row(&self) -> ElectionError {
        ElectionError::MissingRow {
            table: self.table_display.clone(),
            role_id: self.role_id.clone(),
        }
    }

    fn check_consistency(
        &self,
        row: &LeaseRow,
        holder: Holder,
        was_leader: bool,
    ) -> Result<(), ElectionError> {
        match holder {
            Holder::Me if !was_leader => {
                return Err(ElectionError::UnexpectedLeadership {
                    table: self.table_display.clone(),
                    row: row.to_string(),
                })
            }
            Holder::SomeoneElse | Holder::Nobody if was_leader => {
                return Err(ElectionError::LeadershipStolen {
                    table: self.table_display.clone(),
                    row: row.to_string(),
                    holder: row.candidate_id.clone(),
                })
            }
            _ => {}
        }
        if !row.is_consistent() {
            return Err(ElectionError::InconsistentRow {
                table: self.table_display.clone(),
                row: row.to_string(),
            });
        }
        Ok(())
    }

    fn expect_one_row(&self, operation: &'static str, rows: u64) -> Result<(), ElectionError> {
        if rows == 1 {
            Ok(())
        } else {
            Err(ElectionError::UnexpectedRowCount {
                table: self.table_display.clone(),
                operation,
                rows,
            })
        }
    }

    fn classify_begin_failure(&mut self, error: StoreError) -> ErrorRecord {
        match error {
            StoreError::Connect(_) if self.has_had_successful_execution => {
                ErrorRecord::recoverable(ElectionError::ConnectionLost(error))
            }
            StoreError::Connect(_) => {
                ErrorRecord::non_recoverable(ElectionError::InitialConnect(error))
            }
            other => self.classify(ElectionError::Store(other)),
        }
    }

    /// Transient errors are recoverable until the third one in a row.
    fn classify(&mut self, error: ElectionError) -> ErrorRecord {
        let transient = match &error {
            ElectionError::LockTimeout(_) => true,
            ElectionError::Store(store_error) => store_error.is_transient(),
            _ => false,
        };
        if !transient {
            return ErrorRecord::non_recoverable(error);
        }
        self.consecutive_transient_errors += 1;
        if self.consecutive_transient_errors >= MAX_CONSECUTIVE_TRANSIENT_ERRORS {
            self.consecutive_transient_errors = 0;
            ErrorRecord::non_recoverable(error)
        } else {
            ErrorRecord::recoverable(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::core::dialect::{Statement, StatementKind, TableName};
    use crate::core::event::EventType;
    use crate::core::lease_row::NO_LEADER_CANDIDATE_ID;
    use crate::core::memory::{ManualClock, MemoryLeaseStore, MemoryTransaction};
    use crate::core::store::{ColumnInfo, ServerInfo};

    const T0: i64 = 1_700_000_000_000;

    enum Fault {
        Begin(StoreError),
        Select(StoreError),
        SelectRows(Vec<LeaseRow>),
        SelectHangs,
        RowsAffected(StatementKind, u64),
        Commit(StoreError),
        Rollback(StoreError),
    }

    #[derive(Clone, Default)]
    struct Faults(Arc<Mutex<VecDeque<Fault>>>);

    impl Faults {
        fn push(&self, fault: Fault) {
            self.0.lock().unwrap().push_back(fault);
        }

        fn take_if(&self, applies: impl Fn(&Fault) -> bool) -> Option<Fault> {
            let mut faults = self.0.lock().unwrap();
            if faults.front().is_some_and(applies) {
                faults.pop_front()
            } else {
                None
            }
        }
    }

    /// Memory store with injectable failures and a record of how many
    /// transactions held the lock at once.
    #[derive(Clone)]
    struct FaultyStore {
        inner: MemoryLeaseStore,
        faults: Faults,
        holding_lock: Arc<AtomicUsize>,
        max_holding_lock: Arc<AtomicUsize>,
        watched_leadership: Arc<Mutex<Option<Arc<AtomicBool>>>>,
        leader_at_commit: Arc<Mutex<Vec<bool>>>,
    }

    impl FaultyStore {
        fn new(inner: MemoryLeaseStore) -> Self {
            Self {
                inner,
                faults: Faults::default(),
                holding_lock: Arc::new(AtomicUsize::new(0)),
                max_holding_lock: Arc::new(AtomicUsize::new(0)),
                watched_leadership: Arc::default(),
                leader_at_commit: Arc::default(),
            }
        }

        /// Record the engine's leadership flag whenever a commit starts.
        fn watch_leadership(&self, leadership: Arc<AtomicBool>) {
            *self.watched_leadership.lock().unwrap() = Some(leadership);
        }

        fn leader_at_commit(&self) -> Vec<bool> {
            self.leader_at_commit.lock().unwrap().clone()
        }
    }

    struct FaultyTransaction {
        inner: Option<MemoryTransaction>,
        store: FaultyStore,
        locked: bool,
    }

    impl FaultyTransaction {
        fn inner(&mut self) -> &mut MemoryTransaction {
            self.inner.as_mut().unwrap()
        }

        fn release(&mut self) {
            if std::mem::take(&mut self.locked) {
                self.store.holding_lock.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for FaultyTransaction {
        fn drop(&mut self) {
            self.release();
        }
    }

    #[async_trait]
    impl LeaseStore for FaultyStore {
        type Transaction = FaultyTransaction;

        async fn begin(&self) -> Result<Self::Transaction, StoreError> {
            if let Some(Fault::Begin(error)) =
                self.faults.take_if(|f| matches!(f, Fault::Begin(_)))
            {
                return Err(error);
            }
            Ok(FaultyTransaction {
                inner: Some(self.inner.begin().await?),
                store: self.clone(),
                locked: false,
            })
        }

        async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
            self.inner.execute(statement).await
        }

        async fn server_info(&self) -> Result<ServerInfo, StoreError> {
            self.inner.server_info().await
        }

        async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
            self.inner.table_columns(table).await
        }
    }

    #[async_trait]
    impl LeaseTransaction for FaultyTransaction {
        async fn fetch_rows(&mut self, statement: &Statement) -> Result<Vec<LeaseRow>, StoreError> {
            let fault = self.store.faults.take_if(|f| {
                matches!(
                    f,
                    Fault::Select(_) | Fault::SelectRows(_) | Fault::SelectHangs
                )
            });
            match fault {
                Some(Fault::Select(error)) => return Err(error),
                Some(Fault::SelectRows(rows)) => return Ok(rows),
                Some(Fault::SelectHangs) => std::future::pending::<()>().await,
                _ => {}
            }
            let rows = self.inner().fetch_rows(statement).await?;
            let holding = self.store.holding_lock.fetch_add(1, Ordering::SeqCst) + 1;
            self.store
                .max_holding_lock
                .fetch_max(holding, Ordering::SeqCst);
            self.locked = true;
            Ok(rows)
        }

        async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
            let kind = statement.kind();
            if let Some(Fault::RowsAffected(_, rows)) = self
                .store
                .faults
                .take_if(|f| matches!(f, Fault::RowsAffected(k, _) if *k == kind))
            {
                return Ok(rows);
            }
            self.inner().execute(statement).await
        }

        async fn commit(mut self) -> Result<(), StoreError> {
            let watched = self.store.watched_leadership.lock().unwrap().clone();
            if let Some(leadership) = watched {
                let leader = leadership.load(Ordering::SeqCst);
                self.store.leader_at_commit.lock().unwrap().push(leader);
            }
            if let Some(Fault::Commit(error)) =
                self.store.faults.take_if(|f| matches!(f, Fault::Commit(_)))
            {
                return Err(error);
            }
            self.release();
            let inner = self.inner.take().unwrap();
            inner.commit().await
        }

        async fn rollback(mut self) -> Result<(), StoreError> {
            if let Some(Fault::Rollback(error)) =
                self.store.faults.take_if(|f| matches!(f, Fault::Rollback(_)))
            {
                return Err(error);
            }
            self.release();
            let inner = self.inner.take().unwrap();
            inner.rollback().await
        }
    }

    fn options(candidate_id: &str) -> ElectorOptions {
        ElectorOptions::new()
            .with_role_id("test-role")
            .with_candidate_id(candidate_id)
            .with_interval(Duration::from_secs(1))
            .with_assume_dead(Duration::from_secs(3))
            .with_query_timeout(Duration::from_secs(1))
    }

    fn statements() -> LeaseStatements {
        LeaseStatements::new(
            DatabaseEngine::Postgresql,
            TableName::new(None, "db_leader_elect"),
            Duration::from_secs(1),
        )
    }

    async fn provisioned(clock: &ManualClock) -> MemoryLeaseStore {
        let store = MemoryLeaseStore::with_clock(clock.clone());
        store
            .execute(&statements().insert_role("test-role"))
            .await
            .unwrap();
        store
    }

    fn engine<S: LeaseStore>(store: &Arc<S>, candidate_id: &str) -> ElectionEngine<S> {
        ElectionEngine::new(
            store.clone(),
            statements(),
            &options(candidate_id),
            "db_leader_elect",
        )
    }

    fn transient() -> StoreError {
        StoreError::Transient(anyhow::anyhow!("deadlock detected"))
    }

    #[tokio::test]
    async fn test_assume_from_no_leader() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.candidate_id(), Some(NO_LEADER_CANDIDATE_ID));
        assert_eq!(event.lease_counter(), Some(1));
        assert_eq!(event.last_seen().unwrap().timestamp_millis(), 0);
        assert_eq!(event.role_id(), "test-role");
        assert!(a.is_leader());

        let row = store.row("test-role").await.unwrap();
        assert_eq!(row.candidate_id, "a");
        assert_eq!(row.last_seen_timestamp, T0);
        assert_eq!(row.lease_counter, 1);
    }

    #[tokio::test]
    async fn test_affirm_only_moves_last_seen() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut a = engine(&store, "a");
        a.elect(false).await;

        for step in 1..=3 {
            clock.advance(Duration::from_secs(1));
            let event = a.elect(false).await;
            assert_eq!(event.event_type(), EventType::LeadershipConfirmed);
            assert_eq!(event.candidate_id(), Some("a"));
            assert_eq!(event.lease_counter(), Some(1));
            assert_eq!(
                event.last_seen().unwrap().timestamp_millis(),
                T0 + (step - 1) * 1_000
            );
            let row = store.row("test-role").await.unwrap();
            assert_eq!(row.candidate_id, "a");
            assert_eq!(row.lease_counter, 1);
            assert_eq!(row.last_seen_timestamp, T0 + step * 1_000);
        }
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_live_lease_of_someone_else_is_left_alone() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store.put_row("test-role", "b", T0 - 2_999, 7).await;
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipNoop);
        assert_eq!(event.candidate_id(), Some("b"));
        assert_eq!(event.lease_counter(), Some(7));
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_with_next_counter() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store.put_row("test-role", "b", T0 - 3_000, 7).await;
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.candidate_id(), Some("b"));
        assert_eq!(event.lease_counter(), Some(8));
        assert_eq!(event.last_seen().unwrap().timestamp_millis(), T0 - 3_000);
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_lease_counter_wraps_to_zero() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store.put_row("test-role", "b", 1, i64::MAX).await;
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.lease_counter(), Some(0));
    }

    #[tokio::test]
    async fn test_no_split_leadership_under_renewal() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut a = engine(&store, "a");
        let mut b = engine(&store, "b");

        let mut last_counter = 0;
        for _ in 0..20 {
            let ea = a.elect(false).await;
            let eb = b.elect(false).await;
            assert!(!ea.has_errors() && !eb.has_errors());
            assert!(a.is_leader() ^ b.is_leader());
            let counter = store.row("test-role").await.unwrap().lease_counter;
            assert!(counter >= last_counter);
            last_counter = counter;
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(last_counter, 1);
    }

    #[tokio::test]
    async fn test_relinquish_hands_over() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut a = engine(&store, "a");
        let mut b = engine(&store, "b");
        a.elect(false).await;

        let event = a.elect(true).await;
        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(!event.has_errors());
        assert_eq!(event.candidate_id(), None);
        assert!(!a.is_leader());
        let row = store.row("test-role").await.unwrap();
        assert_eq!(row.candidate_id, NO_LEADER_CANDIDATE_ID);
        assert_eq!(row.last_seen_timestamp, 0);

        // The relinquishing candidate does not grab the free lease back.
        assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipNoop);
        assert!(!a.is_leader());

        let event = b.elect(false).await;
        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.lease_counter(), Some(2));

        // Seeing b's live lease clears a's relinquished state.
        assert_eq!(a.elect(false).await.event_type(), EventType::LeadershipNoop);
        clock.advance(Duration::from_secs(3));
        let event = a.elect(false).await;
        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.candidate_id(), Some("b"));
        assert_eq!(event.lease_counter(), Some(3));
    }

    #[tokio::test]
    async fn test_relinquish_without_leadership_is_a_plain_cycle() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store.put_row("test-role", "b", T0, 4).await;
        let mut a = engine(&store, "a");

        let event = a.elect(true).await;

        assert_eq!(event.event_type(), EventType::LeadershipNoop);
        assert_eq!(store.row("test-role").await.unwrap().candidate_id, "b");
    }

    #[tokio::test]
    async fn test_missing_row_is_non_recoverable() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryLeaseStore::with_clock(clock));
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipUndetermined);
        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::MissingRow { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_rows_are_non_recoverable() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        let row = LeaseRow {
            candidate_id: "b".to_string(),
            last_seen_timestamp: T0,
            now_utc_ms: T0,
            lease_counter: 1,
        };
        store
            .faults
            .push(Fault::SelectRows(vec![row.clone(), row]));
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::DuplicateRows { rows: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unexpected_row_count_is_non_recoverable() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        let mut a = engine(&store, "a");
        a.elect(false).await;
        store
            .faults
            .push(Fault::RowsAffected(StatementKind::Affirm, 0));

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::UnexpectedRowCount {
                operation: "affirm",
                rows: 0,
                ..
            }
        ));
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_transient_errors_escalate_on_third() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        store.inner.put_row("test-role", "b", T0, 1).await;
        let mut a = engine(&store, "a");

        store.faults.push(Fault::Select(transient()));
        let first = a.elect(false).await;
        assert_eq!(first.event_type(), EventType::LeadershipUndetermined);
        assert!(first.has_errors() && !first.is_non_recoverable_error());

        store.faults.push(Fault::Select(transient()));
        let second = a.elect(false).await;
        assert!(!second.is_non_recoverable_error());

        store.faults.push(Fault::Commit(transient()));
        let third = a.elect(false).await;
        assert!(third.is_non_recoverable_error());
        assert!(matches!(
            third.errors()[0].error(),
            ElectionError::Store(StoreError::Transient(_))
        ));

        // The count starts over after escalating.
        store.faults.push(Fault::Select(transient()));
        assert!(!a.elect(false).await.is_non_recoverable_error());
    }

    #[tokio::test]
    async fn test_transient_failure_while_leading_reports_lost() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        let mut a = engine(&store, "a");
        a.elect(false).await;
        assert!(a.is_leader());

        store.faults.push(Fault::Select(transient()));
        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(!event.is_non_recoverable_error());
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_success_resets_transient_count() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        store.inner.put_row("test-role", "b", T0, 1).await;
        let mut a = engine(&store, "a");

        for _ in 0..2 {
            store.faults.push(Fault::Select(transient()));
            assert!(!a.elect(false).await.is_non_recoverable_error());
        }
        assert!(!a.elect(false).await.has_errors());
        for _ in 0..2 {
            store.faults.push(Fault::Select(transient()));
            assert!(!a.elect(false).await.is_non_recoverable_error());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_is_bounded() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        store.faults.push(Fault::SelectHangs);
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipUndetermined);
        assert!(!event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::LockTimeout(timeout) if *timeout == Duration::from_secs(1)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_held_by_other_transaction_times_out() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut holder = store.begin().await.unwrap();
        holder
            .fetch_rows(&statements().select_for_update("test-role"))
            .await
            .unwrap();
        let mut a = engine(&store, "a");

        let event = tokio::time::timeout(Duration::from_secs(60), a.elect(false))
            .await
            .expect("election cycle must give up waiting for the row lock");

        assert_eq!(event.event_type(), EventType::LeadershipUndetermined);
        assert!(!event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::LockTimeout(timeout) if *timeout == Duration::from_secs(1)
        ));
        assert!(!a.is_leader());

        holder.rollback().await.unwrap();
        assert_eq!(
            a.elect(false).await.event_type(),
            EventType::LeadershipAssumed
        );
    }

    #[tokio::test]
    async fn test_leadership_changes_only_after_commit() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        let mut a = engine(&store, "a");
        store.watch_leadership(a.leadership());
        store.faults.push(Fault::Commit(transient()));

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipUndetermined);
        assert!(!a.is_leader());
        assert_eq!(
            store.inner.row("test-role").await.unwrap().candidate_id,
            NO_LEADER_CANDIDATE_ID
        );

        let event = a.elect(false).await;
        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert!(a.is_leader());

        let event = a.elect(true).await;
        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(!a.is_leader());

        // Assume was pending while not yet leader, relinquish while still leader.
        assert_eq!(store.leader_at_commit(), vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_fatal() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        store.faults.push(Fault::Begin(StoreError::Connect(anyhow::anyhow!(
            "connection refused"
        ))));
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::InitialConnect(_)
        ));
    }

    #[tokio::test]
    async fn test_lost_connection_is_recoverable() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        let mut a = engine(&store, "a");
        a.elect(false).await;
        store.faults.push(Fault::Begin(StoreError::Connect(anyhow::anyhow!(
            "connection reset by peer"
        ))));

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(!event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::ConnectionLost(_)
        ));
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_appended() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(FaultyStore::new(provisioned(&clock).await));
        store.faults.push(Fault::Select(transient()));
        store
            .faults
            .push(Fault::Rollback(StoreError::DatabaseError(anyhow::anyhow!(
                "socket closed"
            ))));
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.errors().len(), 2);
        assert!(event.errors()[0].is_recoverable());
        assert!(!event.errors()[1].is_recoverable());
        assert!(matches!(
            event.errors()[1].error(),
            ElectionError::Rollback(_)
        ));
        assert!(event.is_non_recoverable_error());
    }

    #[tokio::test]
    async fn test_stolen_leadership_is_detected() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        let mut a = engine(&store, "a");
        a.elect(false).await;
        store.put_row("test-role", "intruder", T0, 2).await;

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipLost);
        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::LeadershipStolen { holder, .. } if holder == "intruder"
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_leadership_is_detected() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store.put_row("test-role", "a", T0, 2).await;
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert_eq!(event.event_type(), EventType::LeadershipUndetermined);
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::UnexpectedLeadership { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_leader_row_with_timestamp_is_inconsistent() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(provisioned(&clock).await);
        store
            .put_row("test-role", NO_LEADER_CANDIDATE_ID, 12, 2)
            .await;
        let mut a = engine(&store, "a");

        let event = a.elect(false).await;

        assert!(event.is_non_recoverable_error());
        assert!(matches!(
            event.errors()[0].error(),
            ElectionError::InconsistentRow { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cycles_are_mutually_exclusive() {
        let store = Arc::new(FaultyStore::new(
            provisioned(&ManualClock::new(T0)).await,
        ));
        let mut handles = Vec::new();
        for i in 0..8 {
            let mut candidate = engine(&store, &format!("candidate-{i}"));
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let event = candidate.elect(false).await;
                    assert!(!event.has_errors(), "{event}");
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.max_holding_lock.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.row("test-role").await.unwrap().lease_counter, 1);
    }

    #[tokio::test]
    async fn test_prepare_provisions_table_and_row() {
        let store = Arc::new(MemoryLeaseStore::new().without_table());
        let first = options("a").with_create_table(true);

        let mut engine = ElectionEngine::prepare(store.clone(), &first)
            .await
            .unwrap();

        assert_eq!(engine.database_engine(), DatabaseEngine::Postgresql);
        assert_eq!(engine.table_display(), "db_leader_elect");
        let row = store.row("test-role").await.unwrap();
        assert_eq!(row.candidate_id, NO_LEADER_CANDIDATE_ID);
        assert_eq!(
            engine.elect(false).await.event_type(),
            EventType::LeadershipAssumed
        );

        // A second candidate finds everything in place.
        ElectionEngine::prepare(store.clone(), &options("b").with_create_table(true))
            .await
            .unwrap();
        assert_eq!(store.row("test-role").await.unwrap().candidate_id, "a");
    }

    #[tokio::test]
    async fn test_prepare_requires_table() {
        let store = Arc::new(MemoryLeaseStore::new().without_table());
        let result = ElectionEngine::prepare(store, &options("a")).await;
        assert!(matches!(result, Err(PreFlightError::MissingTable(_))));
    }

    #[tokio::test]
    async fn test_prepare_validates_options_first() {
        let store = Arc::new(MemoryLeaseStore::new());
        let result = ElectionEngine::prepare(store, &options("a").with_role_id("")).await;
        assert!(matches!(
            result,
            Err(PreFlightError::Config(ConfigError::EmptyRoleId))
        ));
    }

    #[tokio::test]
    async fn test_prepare_detects_engine() {
        let store = Arc::new(MemoryLeaseStore::new().reporting_engine(DatabaseEngine::Sqlite));
        let engine = ElectionEngine::prepare(store.clone(), &options("a"))
            .await
            .unwrap();
        assert_eq!(engine.database_engine(), DatabaseEngine::Sqlite);

        let engine = ElectionEngine::prepare(
            store,
            &options("a").with_database_engine(DatabaseEngine::Mysql),
        )
        .await
        .unwrap();
        assert_eq!(engine.database_engine(), DatabaseEngine::Mysql);
    }
}
