use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::lease_row::LeaseRow;
use crate::core::store::StoreError;
use crate::core::DateTime;

/// Outcome of one election cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// This candidate took over the lease.
    LeadershipAssumed,
    /// This candidate was leader before the cycle and is not anymore, either
    /// because it relinquished or because the cycle failed.
    LeadershipLost,
    /// The cycle failed and this candidate was not leader before it.
    LeadershipUndetermined,
    /// This candidate renewed its lease.
    LeadershipConfirmed,
    /// Nothing changed.
    LeadershipNoop,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::LeadershipAssumed,
        EventType::LeadershipLost,
        EventType::LeadershipUndetermined,
        EventType::LeadershipConfirmed,
        EventType::LeadershipNoop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LeadershipAssumed => "LEADERSHIP_ASSUMED",
            EventType::LeadershipLost => "LEADERSHIP_LOST",
            EventType::LeadershipUndetermined => "LEADERSHIP_UNDETERMINED",
            EventType::LeadershipConfirmed => "LEADERSHIP_CONFIRMED",
            EventType::LeadershipNoop => "LEADERSHIP_NOOP",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown event type '{}'", s.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// The next cycle may well succeed.
    Recoverable,
    /// The elector closes itself after reporting it.
    NonRecoverable,
}

/// Errors that can happen inside an election cycle.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ElectionError {
    #[error("Cannot connect to database (first time): {0}")]
    InitialConnect(#[source] StoreError),
    #[error("No longer able to connect to database: {0}")]
    ConnectionLost(#[source] StoreError),
    #[error("Timed out after {0:?} waiting for the lease row lock")]
    LockTimeout(Duration),
    #[error("No row found in table {table} for role_id='{role_id}'")]
    MissingRow { table: String, role_id: String },
    #[error(
        "Table {table} has {rows} rows for role_id='{role_id}', it must contain exactly one row"
    )]
    DuplicateRows {
        table: String,
        role_id: String,
        rows: usize,
    },
    #[error("{operation} affected {rows} rows in table {table}, expected exactly one")]
    UnexpectedRowCount {
        table: String,
        operation: &'static str,
        rows: u64,
    },
    #[error(
        "Table {table} with content {row} says this candidate is leader but local state says it is not. \
         The table content was possibly altered by another process"
    )]
    UnexpectedLeadership { table: String, row: String },
    #[error(
        "Table {table} with content {row} says candidate '{holder}' is leader but local state says this candidate is. \
         Leadership was taken over without this candidate noticing, \
         possibly because the lease was not renewed within assume_dead_ms"
    )]
    LeadershipStolen {
        table: String,
        row: String,
        holder: String,
    },
    #[error(
        "Table {table} with content {row} is inconsistent: no leader but last_seen_timestamp is not 0"
    )]
    InconsistentRow { table: String, row: String },
    #[error("Error performing rollback: {0}")]
    Rollback(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One error observed during a cycle.
#[derive(Debug)]
pub struct ErrorRecord {
    occurred_at: DateTime,
    severity: Severity,
    error: ElectionError,
}

impl ErrorRecord {
    pub fn new(severity: Severity, error: ElectionError) -> Self {
        Self {
            occurred_at: Utc::now(),
            severity,
            error,
        }
    }

    pub fn recoverable(error: ElectionError) -> Self {
        Self::new(Severity::Recoverable, error)
    }

    pub fn non_recoverable(error: ElectionError) -> Self {
        Self::new(Severity::NonRecoverable, error)
    }

    pub fn occurred_at(&self) -> DateTime {
        self.occurred_at
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity == Severity::Recoverable
    }

    pub fn error(&self) -> &ElectionError {
        &self.error
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Recoverable => "recoverable",
            Severity::NonRecoverable => "non-recoverable",
        };
        write!(f, "[{}] {}", severity, self.error)
    }
}

/// What one election cycle amounted to.
///
/// Which fields carry a value depends on the event type:
///
/// | field | ASSUMED | LOST | UNDETERMINED | CONFIRMED | NOOP |
/// |---|---|---|---|---|---|
/// | `candidate_id` | previous holder | - | - | self | observed holder |
/// | `lease_counter` | new | - | - | existing | existing |
/// | `last_seen` | previous | - | - | previous | observed |
/// | `errors` | - | maybe | always | - | - |
#[derive(Debug)]
pub struct Event {
    event_type: EventType,
    started_at: DateTime,
    emitted_at: DateTime,
    role_id: String,
    candidate_id: Option<String>,
    lease_counter: Option<i64>,
    last_seen: Option<DateTime>,
    errors: Vec<ErrorRecord>,
}

impl Event {
    fn new(event_type: EventType, started_at: DateTime, role_id: &str) -> Self {
        Self {
            event_type,
            started_at,
            emitted_at: Utc::now(),
            role_id: role_id.to_string(),
            candidate_id: None,
            lease_counter: None,
            last_seen: None,
            errors: Vec::new(),
        }
    }

    fn with_row(mut self, candidate_id: &str, lease_counter: i64, last_seen_ms: i64) -> Self {
        self.candidate_id = Some(candidate_id.to_string());
        self.lease_counter = Some(lease_counter);
        self.last_seen = Utc.timestamp_millis_opt(last_seen_ms).single();
        self
    }

    pub(crate) fn assumed(
        started_at: DateTime,
        role_id: &str,
        previous: &LeaseRow,
        new_lease_counter: i64,
    ) -> Self {
        Self::new(EventType::LeadershipAssumed, started_at, role_id).with_row(
            &previous.candidate_id,
            new_lease_counter,
            previous.last_seen_timestamp,
        )
    }

    pub(crate) fn confirmed(started_at: DateTime, role_id: &str, row: &LeaseRow) -> Self {
        Self::new(EventType::LeadershipConfirmed, started_at, role_id).with_row(
            &row.candidate_id,
            row.lease_counter,
            row.last_seen_timestamp,
        )
    }

    pub(crate) fn noop(started_at: DateTime, role_id: &str, row: &LeaseRow) -> Self {
        Self::new(EventType::LeadershipNoop, started_at, role_id).with_row(
            &row.candidate_id,
            row.lease_counter,
            row.last_seen_timestamp,
        )
    }

    pub(crate) fn relinquished(started_at: DateTime, role_id: &str) -> Self {
        Self::new(EventType::LeadershipLost, started_at, role_id)
    }

    pub(crate) fn failed(
        started_at: DateTime,
        role_id: &str,
        was_leader: bool,
        errors: Vec<ErrorRecord>,
    ) -> Self {
        let event_type = if was_leader {
            EventType::LeadershipLost
        } else {
            EventType::LeadershipUndetermined
        };
        let mut event = Self::new(event_type, started_at, role_id);
        event.errors = errors;
        event
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// When the cycle that produced this event started.
    pub fn started_at(&self) -> DateTime {
        self.started_at
    }

    pub fn emitted_at(&self) -> DateTime {
        self.emitted_at
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }

    pub fn candidate_id(&self) -> Option<&str> {
        self.candidate_id.as_deref()
    }

    /// Fencing token. Only increases, except for a single wrap to 0.
    pub fn lease_counter(&self) -> Option<i64> {
        self.lease_counter
    }

    pub fn last_seen(&self) -> Option<DateTime> {
        self.last_seen
    }

    /// Errors in the order they happened. The first one is the root cause.
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_non_recoverable_error(&self) -> bool {
        self.errors.iter().any(|e| !e.is_recoverable())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [role_id={}", self.event_type, self.role_id)?;
        if let Some(candidate_id) = &self.candidate_id {
            write!(f, ", candidate_id={}", candidate_id)?;
        }
        if let Some(lease_counter) = self.lease_counter {
            write!(f, ", lease_counter={}", lease_counter)?;
        }
        if let Some(last_seen) = self.last_seen {
            write!(f, ", last_seen={}", last_seen.to_rfc3339())?;
        }
        for error in &self.errors {
            write!(f, ", error={}", error)?;
        }
        f.write_str("]")
    }
}

/// Set of event types a listener wants to hear about.
///
/// Parses from a comma separated list:
///
/// ```rust
/// use leasehold::core::event::{EventSubscription, EventType};
///
/// let all: EventSubscription = "#ALL#".parse().unwrap();
/// assert!(all.contains(EventType::LeadershipNoop));
///
/// let some: EventSubscription = "LEADERSHIP_ASSUMED, LEADERSHIP_LOST".parse().unwrap();
/// assert!(!some.contains(EventType::LeadershipNoop));
///
/// let all_but: EventSubscription = "-LEADERSHIP_NOOP".parse().unwrap();
/// assert!(all_but.contains(EventType::LeadershipConfirmed));
/// assert!(!all_but.contains(EventType::LeadershipNoop));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SubscriptionRepr", into = "Vec<EventType>")]
pub struct EventSubscription(BTreeSet<EventType>);

pub const ALL_EVENTS_KEYWORD: &str = "#ALL#";

impl EventSubscription {
    pub fn all() -> Self {
        Self(EventType::ALL.into_iter().collect())
    }

    pub fn only(types: impl IntoIterator<Item = EventType>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn all_except(types: impl IntoIterator<Item = EventType>) -> Self {
        let excluded: BTreeSet<EventType> = types.into_iter().collect();
        Self(
            EventType::ALL
                .into_iter()
                .filter(|t| !excluded.contains(t))
                .collect(),
        )
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        self.0.contains(&event_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = EventType> + '_ {
        self.0.iter().copied()
    }
}

/// Everything except the chatty per-cycle types.
impl Default for EventSubscription {
    fn default() -> Self {
        Self::all_except([EventType::LeadershipConfirmed, EventType::LeadershipNoop])
    }
}

impl fmt::Display for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(EventType::as_str).collect();
        f.write_str(&names.join(", "))
    }
}

impl FromStr for EventSubscription {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();
        if entries.len() == 1 && entries[0] == ALL_EVENTS_KEYWORD {
            return Ok(Self::all());
        }
        let negated = entries.iter().filter(|e| e.starts_with('-')).count();
        if negated > 0 && negated != entries.len() {
            return Err(
                "mixing excluded ('-' prefixed) and included event types is not allowed".to_string(),
            );
        }
        let types = entries
            .iter()
            .map(|e| e.trim_start_matches('-').parse::<EventType>())
            .collect::<Result<Vec<_>, _>>()?;
        if negated > 0 {
            Ok(Self::all_except(types))
        } else {
            Ok(Self::only(types))
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubscriptionRepr {
    Text(String),
    List(Vec<EventType>),
}

impl TryFrom<SubscriptionRepr> for EventSubscription {
    type Error = String;

    fn try_from(value: SubscriptionRepr) -> Result<Self, Self::Error> {
        match value {
            SubscriptionRepr::Text(text) => text.parse(),
            SubscriptionRepr::List(types) => Ok(Self::only(types)),
        }
    }
}

impl From<EventSubscription> for Vec<EventType> {
    fn from(value: EventSubscription) -> Self {
        value.0.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lease_row::NO_LEADER_CANDIDATE_ID;

    fn row() -> LeaseRow {
        LeaseRow {
            candidate_id: "other".to_string(),
            last_seen_timestamp: 1_700_000_000_000,
            now_utc_ms: 1_700_000_050_000,
            lease_counter: 9,
        }
    }

    #[test]
    fn assumed_carries_previous_holder_and_new_counter() {
        let event = Event::assumed(Utc::now(), "role", &row(), 10);
        assert_eq!(event.event_type(), EventType::LeadershipAssumed);
        assert_eq!(event.candidate_id(), Some("other"));
        assert_eq!(event.lease_counter(), Some(10));
        assert_eq!(
            event.last_seen().unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert!(!event.has_errors());
    }

    #[test]
    fn no_leader_row_has_epoch_last_seen() {
        let previous = LeaseRow {
            candidate_id: NO_LEADER_CANDIDATE_ID.to_string(),
            last_seen_timestamp: 0,
            now_utc_ms: 5,
            lease_counter: 0,
        };
        let event = Event::assumed(Utc::now(), "role", &previous, 1);
        assert_eq!(event.last_seen().unwrap().timestamp_millis(), 0);
    }

    #[test]
    fn failure_type_depends_on_prior_leadership() {
        let lost = Event::failed(
            Utc::now(),
            "role",
            true,
            vec![ErrorRecord::recoverable(ElectionError::LockTimeout(
                Duration::from_secs(1),
            ))],
        );
        assert_eq!(lost.event_type(), EventType::LeadershipLost);
        assert!(!lost.is_non_recoverable_error());
        assert_eq!(lost.candidate_id(), None);
        assert_eq!(lost.lease_counter(), None);

        let undetermined = Event::failed(
            Utc::now(),
            "role",
            false,
            vec![
                ErrorRecord::recoverable(ElectionError::LockTimeout(Duration::from_secs(1))),
                ErrorRecord::non_recoverable(ElectionError::Rollback(StoreError::DatabaseError(
                    anyhow::anyhow!("connection reset"),
                ))),
            ],
        );
        assert_eq!(undetermined.event_type(), EventType::LeadershipUndetermined);
        assert!(undetermined.is_non_recoverable_error());
        assert!(matches!(
            undetermined.errors()[0].error(),
            ElectionError::LockTimeout(_)
        ));
    }

    #[test]
    fn display_includes_present_fields_only() {
        let text = Event::noop(Utc::now(), "role", &row()).to_string();
        assert!(text.starts_with("LEADERSHIP_NOOP [role_id=role, candidate_id=other"));
        assert!(text.contains("lease_counter=9"));

        let text = Event::relinquished(Utc::now(), "role").to_string();
        assert_eq!(text, "LEADERSHIP_LOST [role_id=role]");
    }

    #[test]
    fn event_type_serializes_in_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::LeadershipUndetermined).unwrap(),
            "\"LEADERSHIP_UNDETERMINED\""
        );
        assert_eq!(
            "leadership_noop".parse::<EventType>().unwrap(),
            EventType::LeadershipNoop
        );
        assert!("LEADERSHIP_WON".parse::<EventType>().is_err());
    }

    #[test]
    fn default_subscription_skips_confirmed_and_noop() {
        let subscription = EventSubscription::default();
        assert!(subscription.contains(EventType::LeadershipAssumed));
        assert!(subscription.contains(EventType::LeadershipLost));
        assert!(subscription.contains(EventType::LeadershipUndetermined));
        assert!(!subscription.contains(EventType::LeadershipConfirmed));
        assert!(!subscription.contains(EventType::LeadershipNoop));
    }

    #[test]
    fn parses_subscription_lists() {
        assert_eq!(
            "#ALL#".parse::<EventSubscription>().unwrap(),
            EventSubscription::all()
        );
        assert_eq!(
            " -LEADERSHIP_CONFIRMED , -LEADERSHIP_NOOP ".parse::<EventSubscription>().unwrap(),
            EventSubscription::default()
        );
        assert_eq!(
            "LEADERSHIP_ASSUMED,LEADERSHIP_LOST"
                .parse::<EventSubscription>()
                .unwrap(),
            EventSubscription::only([EventType::LeadershipAssumed, EventType::LeadershipLost])
        );
        assert!("LEADERSHIP_ASSUMED,-LEADERSHIP_NOOP"
            .parse::<EventSubscription>()
            .is_err());
        assert!("LEADERSHIP_ASSUMED,BOGUS".parse::<EventSubscription>().is_err());
    }

    #[test]
    fn subscription_deserializes_from_text_or_list() {
        let from_text: EventSubscription = serde_json::from_str("\"-LEADERSHIP_NOOP\"").unwrap();
        assert!(!from_text.contains(EventType::LeadershipNoop));
        assert!(from_text.contains(EventType::LeadershipConfirmed));

        let from_list: EventSubscription =
            serde_json::from_str("[\"LEADERSHIP_ASSUMED\", \"LEADERSHIP_LOST\"]").unwrap();
        assert_eq!(
            from_list,
            EventSubscription::only([EventType::LeadershipAssumed, EventType::LeadershipLost])
        );

        let json = serde_json::to_string(&EventSubscription::default()).unwrap();
        assert_eq!(
            json,
            "[\"LEADERSHIP_ASSUMED\",\"LEADERSHIP_LOST\",\"LEADERSHIP_UNDETERMINED\"]"
        );
    }
}
