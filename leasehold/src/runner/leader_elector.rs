//! Background leader election.
//!
//! [`LeaderElector`] owns two tasks: one runs election cycles on a fixed
//! delay schedule, the other hands the resulting events to the application's
//! listener. A slow or failing listener therefore never delays an election.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::ElectorOptions;
use crate::core::dialect::DatabaseEngine;
use crate::core::election::{ElectionEngine, PreFlightError};
use crate::core::elector::{Elector, ElectorError};
use crate::core::event::{Event, EventSubscription};
use crate::core::listener::LeaderElectorListener;
use crate::core::store::LeaseStore;

/// Upper bound on how long [`LeaderElector::close`] waits for the election task.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ElectorState {
    Starting = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl ElectorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ElectorState::Starting,
            1 => ElectorState::Running,
            2 => ElectorState::Closing,
            _ => ElectorState::Closed,
        }
    }
}

/// State visible to both the handle and the background tasks.
struct Status {
    state: AtomicU8,
    leader: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Status {
    fn state(&self) -> ElectorState {
        ElectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ElectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Leaves `Starting`, unless closing already began.
    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            ElectorState::Starting as u8,
            ElectorState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_closing(&self) -> bool {
        self.state() >= ElectorState::Closing
    }

    /// Moves to `Closing`. Returns false if some earlier call already did.
    fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < ElectorState::Closing as u8).then_some(ElectorState::Closing as u8)
            })
            .is_ok()
    }
}

struct Tasks {
    election: JoinHandle<()>,
    notifier: JoinHandle<()>,
}

struct Shared {
    status: Arc<Status>,
    relinquish_requests: mpsc::UnboundedSender<()>,
    tasks: Mutex<Option<Tasks>>,
    options: ElectorOptions,
    table_display: String,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone without close(): let the election task wind down.
        self.status.shutdown.cancel();
    }
}

/// Elects a leader among all candidates sharing a role, in the background.
///
/// Cheap to clone, all clones control the same elector.
///
/// # Example
///
/// ```rust
/// use leasehold::core::config::ElectorOptions;
/// use leasehold::core::listener::LoggingListener;
/// use leasehold::core::memory::MemoryLeaseStore;
/// use leasehold::runner::leader_elector::LeaderElector;
///
/// # async fn example() -> anyhow::Result<()> {
/// let options = ElectorOptions::new().with_role_id("nightly-report");
/// let elector = LeaderElector::start(MemoryLeaseStore::new(), options, LoggingListener).await?;
///
/// if elector.is_leader()? {
///     // leader-only work
/// }
///
/// elector.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LeaderElector {
    shared: Arc<Shared>,
}

impl LeaderElector {
    /// Validate the options, check the database and start electing.
    ///
    /// The first election runs after a random delay of up to a third of the
    /// interval so that candidates started together do not collide. After
    /// that, elections run `interval` after the previous one finished.
    #[instrument(skip_all, err, fields(role_id = %options.role_id, candidate_id = %options.candidate_id))]
    pub async fn start<S, L>(
        store: S,
        options: ElectorOptions,
        listener: L,
    ) -> Result<Self, PreFlightError>
    where
        S: LeaseStore,
        L: LeaderElectorListener,
    {
        let started = std::time::Instant::now();
        let engine = ElectionEngine::prepare(Arc::new(store), &options).await?;

        let mut options = options;
        options.database_engine = Some(engine.database_engine());
        let table_display = engine.table_display().to_string();
        let first_delay = initial_delay(options.interval());

        let status = Arc::new(Status {
            state: AtomicU8::new(ElectorState::Starting as u8),
            leader: engine.leadership(),
            shutdown: CancellationToken::new(),
        });
        let (relinquish_requests, relinquish_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn LeaderElectorListener> = Arc::new(listener);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let notifier = tokio::spawn(notify_listener(listener, events_rx, weak.clone()));
            let election = tokio::spawn(run_elections(
                engine,
                ElectionSchedule {
                    first_delay,
                    interval: options.interval(),
                },
                status.clone(),
                options.subscription.clone(),
                relinquish_rx,
                events_tx,
                weak.clone(),
            ));
            Shared {
                status: status.clone(),
                relinquish_requests,
                tasks: Mutex::new(Some(Tasks { election, notifier })),
                options,
                table_display,
            }
        });
        status.mark_running();

        info!(
            engine = %shared.options.database_engine.map(|e| e.to_string()).unwrap_or_default(),
            table = %shared.table_display,
            interval_ms = shared.options.interval_ms,
            assume_dead_ms = shared.options.assume_dead_ms,
            first_election_in_ms = first_delay.as_millis() as u64,
            startup_ms = started.elapsed().as_millis() as u64,
            "Leader elector started"
        );
        Ok(Self { shared })
    }

    /// Leadership as seen by the last election.
    ///
    /// Does not ask the database. A leader that failed to renew its lease for
    /// longer than `assume_dead_ms` may already have been replaced without
    /// knowing it, prefer reacting to events where that matters.
    pub fn is_leader(&self) -> Result<bool, ElectorError> {
        if self.shared.status.is_closing() {
            return Err(ElectorError::Closed);
        }
        Ok(self.shared.status.leader.load(Ordering::Acquire))
    }

    /// Give up leadership right away instead of at the next interval.
    ///
    /// Does nothing unless this candidate currently leads. Does not wait: a
    /// `LEADERSHIP_LOST` event follows shortly after. Other candidates take
    /// over at their next election.
    pub fn relinquish(&self) {
        let status = &self.shared.status;
        if status.is_closing() || !status.leader.load(Ordering::Acquire) {
            return;
        }
        if self.shared.relinquish_requests.send(()).is_err() {
            debug!("Election task is gone, ignoring relinquish request");
        }
    }

    /// True once closing has started, whether by [`LeaderElector::close`] or
    /// because of a non-recoverable error.
    pub fn is_closed(&self) -> bool {
        self.shared.status.is_closing()
    }

    pub fn state(&self) -> ElectorState {
        self.shared.status.state()
    }

    pub fn role_id(&self) -> &str {
        &self.shared.options.role_id
    }

    pub fn candidate_id(&self) -> &str {
        &self.shared.options.candidate_id
    }

    /// Engine in use, whether configured or detected.
    pub fn database_engine(&self) -> Option<DatabaseEngine> {
        self.shared.options.database_engine
    }

    /// Options in effect, with the database engine resolved.
    pub fn options(&self) -> &ElectorOptions {
        &self.shared.options
    }

    /// Stop electing. Leadership, if held, is relinquished on a best-effort
    /// basis and no event is delivered for that.
    ///
    /// Waits at most [`CLOSE_TIMEOUT`] for the election task, then aborts it.
    /// Calling it again has no effect. Never fails.
    pub async fn close(&self) {
        let status = &self.shared.status;
        let first = status.begin_closing();
        if first {
            info!(role_id = %self.role_id(), "Leader elector is closing down");
        }
        let started = std::time::Instant::now();
        status.shutdown.cancel();

        let tasks = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Tasks { election, notifier }) = tasks else {
            return;
        };

        let abort = election.abort_handle();
        match tokio::time::timeout(CLOSE_TIMEOUT, election).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Election task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                    "Election task did not stop in time, aborting it"
                );
                abort.abort();
            }
        }
        // The notification task delivers what is already queued and then ends
        // on its own.
        drop(notifier);

        status.set_state(ElectorState::Closed);
        info!(
            role_id = %self.role_id(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Leader elector closed"
        );
    }
}

impl fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("role_id", &self.shared.options.role_id)
            .field("candidate_id", &self.shared.options.candidate_id)
            .field("table", &self.shared.table_display)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Elector for LeaderElector {
    async fn is_leader(&self) -> Result<bool, ElectorError> {
        LeaderElector::is_leader(self)
    }

    async fn release_leadership(&self) -> Result<(), ElectorError> {
        if self.is_closed() {
            return Err(ElectorError::Closed);
        }
        self.relinquish();
        Ok(())
    }
}

/// Uniformly random in `[0, interval / 3]`.
fn initial_delay(interval: Duration) -> Duration {
    let max_ms = (interval.as_millis() / 3) as u64;
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

struct ElectionSchedule {
    first_delay: Duration,
    interval: Duration,
}

fn close_in_background(shared: &Weak<Shared>, reason: &'static str) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let elector = LeaderElector { shared };
    if elector.is_closed() {
        return;
    }
    error!(role_id = %elector.role_id(), reason, "Closing leader elector");
    tokio::spawn(async move { elector.close().await });
}

async fn run_elections<S: LeaseStore>(
    mut engine: ElectionEngine<S>,
    schedule: ElectionSchedule,
    status: Arc<Status>,
    subscription: EventSubscription,
    mut relinquish_rx: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<Event>,
    shared: Weak<Shared>,
) {
    let mut next_election = Instant::now() + schedule.first_delay;
    loop {
        let relinquish = tokio::select! {
            biased;
            _ = status.shutdown.cancelled() => break,
            Some(()) = relinquish_rx.recv() => true,
            _ = tokio::time::sleep_until(next_election) => false,
        };

        let event = engine.elect(relinquish).await;
        if !relinquish {
            next_election = Instant::now() + schedule.interval;
        }

        let fatal = event.is_non_recoverable_error();
        if !status.is_closing() && subscription.contains(event.event_type()) {
            if events.send(event).is_err() {
                debug!("Notification task is gone, dropping event");
            }
        }
        if fatal {
            close_in_background(&shared, "non-recoverable error in leader election");
        }
    }

    if engine.is_leader() {
        let event = engine.elect(true).await;
        if event.has_errors() {
            warn!(%event, "Could not relinquish leadership while closing");
        } else {
            debug!("Leadership relinquished while closing");
        }
    }
    debug!("Election task stopped");
}

async fn notify_listener(
    listener: Arc<dyn LeaderElectorListener>,
    mut events: mpsc::UnboundedReceiver<Event>,
    shared: Weak<Shared>,
) {
    while let Some(event) = events.recv().await {
        let event_type = event.event_type();
        let listener = listener.clone();
        // Run on its own task so a panicking listener surfaces as a JoinError.
        let outcome = tokio::spawn(async move { listener.on_event(event).await }).await;
        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) if e.is_panic() => "listener panicked".to_string(),
            Err(e) => e.to_string(),
        };
        error!(
            %event_type,
            error = %failure,
            "Error while delivering leader election event, leader elector will be closed"
        );
        close_in_background(&shared, "listener failed");
        break;
    }
    debug!("Notification task stopped");
}
