//! Stream reader
//!
//! Pulls batches for one consumer of one group and reclaims entries left
//! behind by consumers that died mid-processing. Reads and claims are
//! serialized: the cursor has a single owner at any time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::message::{EntryId, Message, PendingEntry};
use crate::store::StreamStore;

/// Local view of the group's last-delivered ID.
///
/// Redis keeps the authoritative copy; this one tracks what this reader
/// has seen so ordering can be checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerGroupCursor {
    pub last_delivered: Option<EntryId>,
}

pub struct StreamReader {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    consumer: String,
    start_id: String,
    cursor: Mutex<ConsumerGroupCursor>,
}

impl StreamReader {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            start_id: "$".to_string(),
            cursor: Mutex::new(ConsumerGroupCursor::default()),
        }
    }

    /// ID the group starts from if this reader creates it
    pub fn with_start_id(mut self, start_id: impl Into<String>) -> Self {
        self.start_id = start_id.into();
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    pub async fn cursor(&self) -> ConsumerGroupCursor {
        *self.cursor.lock().await
    }

    /// Create the consumer group if it does not exist yet
    pub async fn ensure_group(&self) -> Result<(), ConsumerError> {
        let created = self
            .store
            .ensure_group(&self.stream, &self.group, &self.start_id)
            .await?;

        if created {
            info!(
                stream = %self.stream,
                group = %self.group,
                start_id = %self.start_id,
                "Created consumer group"
            );
        } else {
            debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
        }
        Ok(())
    }

    /// Read up to `max_count` new entries, waiting at most `block_timeout`.
    ///
    /// A timeout yields an empty batch. If the group vanished (stream deleted
    /// or `XGROUP DESTROY`), it is re-created and an empty batch is returned.
    pub async fn read_batch(
        &self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Message>, ConsumerError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut cursor = self.cursor.lock().await;

        let batch = match self
            .store
            .read_group(
                &self.stream,
                &self.group,
                &self.consumer,
                max_count,
                Some(block_timeout),
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) if e.is_nogroup() => {
                warn!(
                    stream = %self.stream,
                    group = %self.group,
                    "Consumer group missing, re-creating"
                );
                self.ensure_group().await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        for message in &batch {
            if let Some(last) = cursor.last_delivered
                && message.id() <= last
            {
                warn!(
                    stream = %self.stream,
                    message_id = %message.id(),
                    last_delivered = %last,
                    "Entry delivered out of order"
                );
            }
            cursor.last_delivered = Some(message.id());
        }

        if !batch.is_empty() {
            debug!(
                stream = %self.stream,
                consumer = %self.consumer,
                count = batch.len(),
                "Read batch"
            );
        }

        Ok(batch)
    }

    /// Take over entries idle for at least `min_idle`, oldest first.
    ///
    /// Entries owned by this consumer are included unless `busy` reports
    /// them: a handler still running on an entry does not refresh its idle
    /// time, and claiming it would bump its delivery count.
    pub async fn claim_stale(
        &self,
        min_idle: Duration,
        max_count: usize,
        busy: impl Fn(EntryId) -> bool,
    ) -> Result<Vec<PendingEntry>, ConsumerError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let _cursor = self.cursor.lock().await;

        let mut stale = self
            .store
            .pending(&self.stream, &self.group, min_idle, max_count)
            .await?;
        stale.retain(|p| !(p.consumer == self.consumer && busy(p.id)));
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<EntryId> = stale.iter().map(|p| p.id).collect();
        let claimed = self
            .store
            .claim(&self.stream, &self.group, &self.consumer, min_idle, &ids)
            .await?;

        let mut entries: Vec<PendingEntry> = claimed
            .into_iter()
            .filter_map(|message| {
                let info = stale.iter().find(|p| p.id == message.id())?;
                Some(PendingEntry {
                    previous_consumer: info.consumer.clone(),
                    idle: info.idle,
                    message,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.message.id());

        if !entries.is_empty() {
            info!(
                stream = %self.stream,
                consumer = %self.consumer,
                count = entries.len(),
                "Claimed stale entries"
            );
        }

        Ok(entries)
    }

    /// Re-claim entries still assigned to this consumer name, e.g. after a
    /// crash and restart under the same name.
    pub async fn recover_own_pending(&self, max_count: usize) -> Result<Vec<Message>, ConsumerError> {
        let _cursor = self.cursor.lock().await;

        let owned = self
            .store
            .pending_for(&self.stream, &self.group, &self.consumer, max_count)
            .await?;
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<EntryId> = owned.iter().map(|p| p.id).collect();
        let mut recovered = self
            .store
            .claim(&self.stream, &self.group, &self.consumer, Duration::ZERO, &ids)
            .await?;
        recovered.sort_by_key(Message::id);

        info!(
            stream = %self.stream,
            consumer = %self.consumer,
            count = recovered.len(),
            "Recovered own pending entries"
        );

        Ok(recovered)
    }
}
