//! Queue driver contract.

use std::time::Duration;

use async_trait::async_trait;

use super::message::{Channel, PersistedEvent, QueueError, QueueInfo};

/// Storage behind a persistent queue.
///
/// Five channels per queue: Waiting, Delayed (scored by visibility time),
/// Reserved (scored by handling deadline), Failed and Timeout.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Enqueues `msg`, into Waiting when `delay` is zero and into Delayed
    /// otherwise.
    async fn push(&self, msg: &PersistedEvent, delay: Duration) -> Result<(), QueueError>;

    /// Promotes due Delayed entries, moves expired Reserved entries to
    /// Timeout, then waits up to the poll timeout for a Waiting entry.
    /// A popped entry is Reserved until acked, failed or retried.
    ///
    /// Returns `None` when the poll timeout elapses first.
    async fn pop(&self) -> Result<Option<PersistedEvent>, QueueError>;

    /// Removes `msg` from Reserved. No-op if it is not there.
    async fn ack(&self, msg: &PersistedEvent) -> Result<(), QueueError>;

    /// Moves `msg` from Reserved to Failed.
    async fn fail(&self, msg: &PersistedEvent) -> Result<(), QueueError>;

    /// Moves `msg` from Reserved back to Delayed with one more attempt and
    /// the next backoff.
    async fn retry(&self, msg: &PersistedEvent) -> Result<(), QueueError>;

    /// Returns `msg` from Reserved to the front of Waiting unchanged, so
    /// the next pop hands it out again. Used when a popped entry was never
    /// given to a listener.
    async fn release(&self, msg: &PersistedEvent) -> Result<(), QueueError>;

    /// Moves every Failed or Timeout entry back to Waiting. Returns the
    /// number of entries moved.
    async fn reload(&self, channel: Channel) -> Result<u64, QueueError>;

    /// Deletes a channel.
    async fn flush(&self, channel: Channel) -> Result<(), QueueError>;

    async fn info(&self) -> Result<QueueInfo, QueueError>;
}

/// Rejects reloads of channels other than Failed and Timeout.
pub(crate) fn ensure_reloadable(channel: Channel) -> Result<(), QueueError> {
    match channel {
        Channel::Failed | Channel::Timeout => Ok(()),
        other => Err(QueueError::NotReloadable(other)),
    }
}
