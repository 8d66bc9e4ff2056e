//! Acknowledgment tracker
//!
//! Turns a handler outcome into Redis state:
//! - `Success`: `XACK`
//! - `Retryable`: nothing, the entry stays pending until a stale-claim pass
//!   picks it up again; dead-lettered once its delivery budget is spent
//! - `Fatal`: append to the dead-letter stream, then `XACK` once the append
//!   is confirmed
//!
//! Commands that fail are queued and replayed by [`AckTracker::flush_retries`].
//! A dead-letter append that went through is never repeated; only its ack is.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterEntry, DeadLetterWriter};
use crate::error::ConsumerError;
use crate::handler::ProcessingOutcome;
use crate::message::{EntryId, Message};
use crate::metrics::ConsumerMetrics;
use crate::store::StreamStore;

/// What happened to a message after its outcome was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    LeftPending,
    DeadLettered,
}

#[derive(Debug, Clone)]
enum Deferred {
    Ack { id: EntryId },
    DeadLetter { message: Message, reason: String },
}

impl Deferred {
    fn id(&self) -> EntryId {
        match self {
            Deferred::Ack { id } => *id,
            Deferred::DeadLetter { message, .. } => message.id(),
        }
    }
}

pub struct AckTracker {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    consumer: String,
    max_delivery_attempts: u32,
    dead_letter: DeadLetterWriter,
    deferred: Mutex<VecDeque<Deferred>>,
    metrics: ConsumerMetrics,
}

impl AckTracker {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        max_delivery_attempts: u32,
        dead_letter: DeadLetterWriter,
    ) -> Self {
        let stream = stream.into();
        let group = group.into();
        Self {
            metrics: ConsumerMetrics::new(stream.clone(), group.clone()),
            store,
            stream,
            group,
            consumer: consumer.into(),
            max_delivery_attempts,
            dead_letter,
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Deferred>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    /// Whether an ack or dead-letter write for `id` is waiting for a retry
    pub fn is_deferred(&self, id: EntryId) -> bool {
        self.queue().iter().any(|d| d.id() == id)
    }

    pub fn deferred_len(&self) -> usize {
        self.queue().len()
    }

    /// Apply a handler outcome.
    ///
    /// On error the failed command is already queued for retry; the error is
    /// returned so the caller can log it (or stop, if it is fatal).
    pub async fn record(
        &self,
        message: &Message,
        outcome: ProcessingOutcome,
    ) -> Result<Disposition, ConsumerError> {
        match outcome {
            ProcessingOutcome::Success => {
                self.ack(message.id()).await?;
                Ok(Disposition::Acknowledged)
            }
            ProcessingOutcome::Retryable(reason)
                if message.delivery_count() >= self.max_delivery_attempts =>
            {
                let reason = format!(
                    "delivery attempts exhausted ({}): {}",
                    self.max_delivery_attempts, reason
                );
                self.dead_letter(message, reason).await?;
                Ok(Disposition::DeadLettered)
            }
            ProcessingOutcome::Retryable(reason) => {
                debug!(
                    stream = %self.stream,
                    message_id = %message.id(),
                    delivery_count = message.delivery_count(),
                    reason = %reason,
                    "Message left pending for redelivery"
                );
                Ok(Disposition::LeftPending)
            }
            ProcessingOutcome::Fatal(reason) => {
                self.dead_letter(message, reason).await?;
                Ok(Disposition::DeadLettered)
            }
        }
    }

    /// Replay queued acks and dead-letter writes.
    ///
    /// Returns how many went through. Entries that fail again stay queued; a
    /// fatal error stops the pass and is returned.
    pub async fn flush_retries(&self) -> Result<usize, ConsumerError> {
        let pending: Vec<Deferred> = self.queue().drain(..).collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        let mut iter = pending.into_iter();
        while let Some(item) = iter.next() {
            let result = match &item {
                Deferred::Ack { id } => self.try_ack(*id).await,
                Deferred::DeadLetter { message, reason } => {
                    self.try_dead_letter(message, reason.clone()).await
                }
            };

            match result {
                Ok(()) => flushed += 1,
                Err(e) if e.is_fatal() => {
                    let mut queue = self.queue();
                    queue.push_back(item);
                    queue.extend(iter);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        stream = %self.stream,
                        message_id = %item.id(),
                        error = %e,
                        "Deferred acknowledgment failed again"
                    );
                    self.queue().push_back(item);
                }
            }
        }

        self.metrics.deferred(self.deferred_len());
        if flushed > 0 {
            info!(stream = %self.stream, flushed, "Flushed deferred acknowledgments");
        }
        Ok(flushed)
    }

    async fn ack(&self, id: EntryId) -> Result<(), ConsumerError> {
        self.try_ack(id).await.map_err(|e| {
            self.defer(Deferred::Ack { id });
            self.failure(id, "ack", e)
        })
    }

    async fn try_ack(&self, id: EntryId) -> Result<(), ConsumerError> {
        let acked = self.store.ack(&self.stream, &self.group, id).await?;
        if acked {
            self.metrics.acked();
        } else {
            debug!(stream = %self.stream, message_id = %id, "Entry was no longer pending");
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &Message, reason: String) -> Result<(), ConsumerError> {
        let entry = DeadLetterEntry::new(message, &self.stream, &self.group, &self.consumer, reason.clone());

        if let Err(e) = self.dead_letter.write(&entry).await {
            self.defer(Deferred::DeadLetter {
                message: message.clone(),
                reason,
            });
            return Err(self.failure(message.id(), "dead-letter", e));
        }
        self.metrics.dead_lettered();

        self.ack(message.id()).await
    }

    /// Replay variant: a write that succeeds but whose ack fails is queued
    /// as a plain ack
    async fn try_dead_letter(&self, message: &Message, reason: String) -> Result<(), ConsumerError> {
        let entry = DeadLetterEntry::new(message, &self.stream, &self.group, &self.consumer, reason);
        self.dead_letter.write(&entry).await?;
        self.metrics.dead_lettered();

        if let Err(e) = self.try_ack(message.id()).await {
            self.defer(Deferred::Ack { id: message.id() });
            warn!(
                stream = %self.stream,
                message_id = %message.id(),
                error = %e,
                "Ack after dead-letter failed, queued"
            );
        }
        Ok(())
    }

    fn defer(&self, item: Deferred) {
        let len = {
            let mut queue = self.queue();
            queue.push_back(item);
            queue.len()
        };
        self.metrics.ack_failed();
        self.metrics.deferred(len);
    }

    fn failure(&self, id: EntryId, action: &str, err: ConsumerError) -> ConsumerError {
        error!(
            stream = %self.stream,
            group = %self.group,
            message_id = %id,
            action,
            error = %err,
            "Acknowledgment failed, queued for retry"
        );

        if err.is_fatal() {
            err
        } else {
            ConsumerError::acknowledgment(id, format!("{} failed: {}", action, err))
        }
    }
}
