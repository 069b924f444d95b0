//! Engine-agnostic building blocks of the leader election and re-exports of 3rd party types used in public interface.

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::Utc;
pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod dialect;
pub mod election;
pub mod elector;
pub mod event;
pub mod lease_row;
pub mod listener;
pub mod memory;
pub mod schema;
pub mod store;
