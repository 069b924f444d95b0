use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::event::{Event, EventType};

/// Receives the outcome of election cycles.
///
/// Invoked on the elector's notification task, one event at a time and in
/// order. Returning an error (or panicking) closes the elector.
#[async_trait]
pub trait LeaderElectorListener: Send + Sync + 'static {
    async fn on_event(&self, event: Event) -> anyhow::Result<()>;
}

/// Writes every event to the log. The default listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

#[async_trait]
impl LeaderElectorListener for LoggingListener {
    async fn on_event(&self, event: Event) -> anyhow::Result<()> {
        match event.event_type() {
            _ if event.is_non_recoverable_error() => {
                error!(role_id = event.role_id(), %event, "Leader election failed")
            }
            _ if event.has_errors() => {
                warn!(role_id = event.role_id(), %event, "Leader election failed")
            }
            EventType::LeadershipAssumed => {
                info!(role_id = event.role_id(), %event, "Leadership assumed")
            }
            EventType::LeadershipLost => {
                info!(role_id = event.role_id(), %event, "Leadership lost")
            }
            EventType::LeadershipUndetermined
            | EventType::LeadershipConfirmed
            | EventType::LeadershipNoop => debug!(role_id = event.role_id(), %event, "Leader election"),
        }
        Ok(())
    }
}

/// Forwards events into a bounded channel.
///
/// Waits for room in the channel, so a slow consumer slows down notification
/// but never the elections themselves. Fails once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::Sender<Event>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Listener plus the receiving end of a fresh channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl LeaderElectorListener for ChannelListener {
    async fn on_event(&self, event: Event) -> anyhow::Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("receiver dropped"))
            .context("Failed to forward leader election event")
    }
}
