//! MySQL and MariaDB implementation of the LeaseStore trait from leasehold

pub mod store;
pub mod types;

pub use store::{MySqlLeaseStore, MySqlLeaseTransaction};
