//! Stream store abstraction
//!
//! Every consumer-group command goes through [`StreamStore`]. The worker runs
//! against [`RedisConnection`](crate::RedisConnection) in production and
//! [`MemoryStore`](memory::MemoryStore) in tests and local development.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConsumerError;
use crate::message::{EntryId, Fields, Message};

/// One row of the pending-entries list (`XPENDING` extended form)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

/// Consumer-group operations on a stream backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create the group (and the stream if missing). Returns `false` when the
    /// group already existed.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<bool, ConsumerError>;

    /// Read entries never delivered to the group (`XREADGROUP ... >`).
    ///
    /// With `block` set, waits up to that long for data and returns an empty
    /// vector on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Message>, ConsumerError>;

    /// Pending entries of the whole group idle for at least `min_idle`
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingInfo>, ConsumerError>;

    /// Pending entries owned by one consumer, regardless of idle time
    async fn pending_for(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingInfo>, ConsumerError>;

    /// Take ownership of pending entries still idle for `min_idle`.
    ///
    /// Entries acknowledged or re-claimed in the meantime are skipped. Each
    /// returned message carries its incremented delivery count.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Message>, ConsumerError>;

    /// Acknowledge an entry. Returns `false` when it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, ConsumerError>;

    /// Append an entry, optionally trimming to roughly `max_len`
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<EntryId, ConsumerError>;

    async fn ping(&self) -> Result<(), ConsumerError>;

    /// Last observed connection health
    fn is_healthy(&self) -> bool;
}

/// Produces a store session when the worker starts
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, ConsumerError>;
}

/// A shared store connects to itself
#[async_trait]
impl<S> Connector for Arc<S>
where
    S: StreamStore + 'static,
{
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, ConsumerError> {
        self.ping().await?;
        Ok(self.clone() as Arc<dyn StreamStore>)
    }
}
