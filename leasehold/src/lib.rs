#![doc = include_str!("../README.md")]

pub mod core;

/// Shared test specifications for backend implementations.
///
/// These test functions check that every LeaseStore implementation (PostgreSQL,
/// MySQL, SQLite) elects leaders the same way. Backend tests generate wrappers
/// for them with [`generate_store_spec_tests`].
#[doc(hidden)]
pub mod store_spec;

/// Background election loop and event delivery.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod leader_elector;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        config::{ConfigError, ElectorOptions},
        dialect::DatabaseEngine,
        election::{ElectionEngine, PreFlightError},
        elector::{Elector, ElectorError},
        event::{ElectionError, Event, EventSubscription, EventType},
        listener::{ChannelListener, LeaderElectorListener, LoggingListener},
        store::{LeaseStore, LeaseTransaction, StoreError},
        DateTime, Utc,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::leader_elector::{ElectorState, LeaderElector};
}
