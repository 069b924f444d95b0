use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::dialect::{DatabaseEngine, TableName};
use crate::core::event::{EventSubscription, EventType};
use crate::core::schema::{CANDIDATE_ID_MAX_LENGTH, ROLE_ID_MAX_LENGTH};

pub const DEFAULT_ROLE_ID: &str = "DEFAULT";
pub const DEFAULT_TABLE_NAME: &str = "db_leader_elect";
pub const DEFAULT_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_ASSUME_DEAD_MS: u64 = 40_000;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 120;

/// Settings of one leader elector.
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes:
///
/// ```rust
/// use leasehold::core::config::ElectorOptions;
///
/// let options: ElectorOptions = serde_json::from_str(r#"{
///     "role_id": "billing",
///     "interval_ms": 5000,
///     "assume_dead_ms": 15000
/// }"#).unwrap();
/// assert!(options.validate().is_ok());
/// assert_eq!(options.table_name, "db_leader_elect");
/// ```
///
/// The same thing with the builder methods:
///
/// ```rust
/// use leasehold::core::config::ElectorOptions;
/// use std::time::Duration;
///
/// let options = ElectorOptions::new()
///     .with_role_id("billing")
///     .with_interval(Duration::from_secs(5))
///     .with_assume_dead(Duration::from_secs(15));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct ElectorOptions {
    /// Election namespace. Candidates compete only with candidates of the same role.
    pub role_id: String,
    /// Identity of this candidate. Must be unique among candidates of a role.
    pub candidate_id: String,
    /// `None` means detect it from the server at start.
    pub database_engine: Option<DatabaseEngine>,
    pub schema_name: Option<String>,
    pub table_name: String,
    /// Delay between the end of one cycle and the start of the next.
    pub interval_ms: u64,
    /// A lease not renewed for this long is up for grabs.
    pub assume_dead_ms: u64,
    /// Bound on waiting for the lease row lock.
    pub query_timeout_secs: u64,
    /// Create the table at start if it does not exist.
    pub create_table: bool,
    /// Event types delivered to the listener.
    pub subscription: EventSubscription,
}

impl Default for ElectorOptions {
    fn default() -> Self {
        Self {
            role_id: DEFAULT_ROLE_ID.to_string(),
            candidate_id: default_candidate_id(),
            database_engine: None,
            schema_name: None,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            interval_ms: DEFAULT_INTERVAL_MS,
            assume_dead_ms: DEFAULT_ASSUME_DEAD_MS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            create_table: false,
            subscription: EventSubscription::default(),
        }
    }
}

impl ElectorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role_id(mut self, role_id: impl Into<String>) -> Self {
        self.role_id = role_id.into();
        self
    }

    /// Longer ids are cut to 256 characters.
    pub fn with_candidate_id(mut self, candidate_id: impl Into<String>) -> Self {
        self.candidate_id = truncate_chars(candidate_id.into(), CANDIDATE_ID_MAX_LENGTH);
        self
    }

    pub fn with_database_engine(mut self, engine: DatabaseEngine) -> Self {
        self.database_engine = Some(engine);
        self
    }

    /// An empty schema name means no schema.
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        let schema_name = schema_name.into();
        self.schema_name = if schema_name.trim().is_empty() {
            None
        } else {
            Some(schema_name)
        };
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_assume_dead(mut self, assume_dead: Duration) -> Self {
        self.assume_dead_ms = assume_dead.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout_secs = query_timeout.as_secs();
        self
    }

    pub fn with_create_table(mut self, create_table: bool) -> Self {
        self.create_table = create_table;
        self
    }

    pub fn with_subscription(mut self, subscription: EventSubscription) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn assume_dead(&self) -> Duration {
        Duration::from_millis(self.assume_dead_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn table(&self) -> TableName {
        let schema = self
            .schema_name
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .cloned();
        TableName::new(schema, self.table_name.clone())
    }

    /// Check every setting. Nothing touches the database before this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role_id.is_empty() {
            return Err(ConfigError::EmptyRoleId);
        }
        if self.role_id.chars().count() > ROLE_ID_MAX_LENGTH {
            return Err(ConfigError::RoleIdTooLong(self.role_id.clone()));
        }
        if self.candidate_id.trim().is_empty() {
            return Err(ConfigError::EmptyCandidateId);
        }
        if self.candidate_id.chars().count() > CANDIDATE_ID_MAX_LENGTH {
            return Err(ConfigError::CandidateIdTooLong);
        }
        if let Some(schema) = &self.schema_name {
            if schema.contains('.') {
                return Err(ConfigError::QualifiedSchemaName(schema.clone()));
            }
        }
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::EmptyTableName);
        }
        if self.table_name.contains('.') {
            return Err(ConfigError::QualifiedTableName(self.table_name.clone()));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::NotPositive("interval_ms"));
        }
        if self.assume_dead_ms == 0 {
            return Err(ConfigError::NotPositive("assume_dead_ms"));
        }
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("query_timeout_secs"));
        }
        if self.interval_ms >= self.assume_dead_ms {
            return Err(ConfigError::IntervalNotBelowAssumeDead {
                interval_ms: self.interval_ms,
                assume_dead_ms: self.assume_dead_ms,
            });
        }
        for required in [EventType::LeadershipAssumed, EventType::LeadershipLost] {
            if !self.subscription.contains(required) {
                return Err(ConfigError::MissingSubscription(required));
            }
        }
        Ok(())
    }
}

/// Errors related to elector settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("role_id must have a value, cannot be empty")]
    EmptyRoleId,
    #[error("Invalid value for role_id \"{0}\": must be no longer than 20 characters")]
    RoleIdTooLong(String),
    #[error("candidate_id must have a value, cannot be empty")]
    EmptyCandidateId,
    #[error("candidate_id must be no longer than 256 characters")]
    CandidateIdTooLong,
    #[error("Invalid value for schema_name \"{0}\": must not contain '.'")]
    QualifiedSchemaName(String),
    #[error("table_name must have a value, cannot be empty")]
    EmptyTableName,
    #[error("Invalid value for table_name \"{0}\": must be non-qualified, without any '.'")]
    QualifiedTableName(String),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("interval_ms ({interval_ms}) must be less than assume_dead_ms ({assume_dead_ms})")]
    IntervalNotBelowAssumeDead { interval_ms: u64, assume_dead_ms: u64 },
    #[error("Event subscription must include {0}")]
    MissingSubscription(EventType),
}

static DEFAULT_CANDIDATE_ID: OnceLock<String> = OnceLock::new();

/// `<pid>@<hostname>`, cut to 256 characters. Resolved once per process.
pub fn default_candidate_id() -> String {
    DEFAULT_CANDIDATE_ID
        .get_or_init(|| {
            truncate_chars(
                format!("{}@{}", std::process::id(), hostname()),
                CANDIDATE_ID_MAX_LENGTH,
            )
        })
        .clone()
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .or_else(hostname_from_command)
        .unwrap_or_else(|| "localhost".to_string())
}

fn hostname_from_command() -> Option<String> {
    let output = std::process::Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn truncate_chars(value: String, max: usize) -> String {
    if value.chars().count() <= max {
        value
    } else {
        value.chars().take(max).collect()
    }
}
