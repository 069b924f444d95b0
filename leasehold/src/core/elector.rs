use async_trait::async_trait;
use thiserror::Error;

/// Something that knows whether this process currently holds leadership.
///
/// Schedulers and workers ask it before doing anything only one instance of
/// the application may do at a time.
#[async_trait]
pub trait Elector: Send + Sync {
    /// `Ok(false)` when another candidate leads or nobody does. Expected to be
    /// cheap, callers may ask before every unit of work.
    async fn is_leader(&self) -> Result<bool, ElectorError>;

    /// Give leadership up ahead of a graceful shutdown. Does nothing unless
    /// overridden.
    async fn release_leadership(&self) -> Result<(), ElectorError> {
        Ok(())
    }
}

/// Errors from asking an [`Elector`] about leadership.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ElectorError {
    /// The elector was closed and will never report leadership again.
    #[error("Leader elector is closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
