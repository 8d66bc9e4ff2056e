//! Dispatch loop
//!
//! One coordinating task per worker: pull a batch, fan messages out to a
//! bounded pool of handler tasks, record every outcome. Cancellation stops
//! pulling, lets in-flight handlers finish, then returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::handler::{Handler, ProcessingOutcome};
use crate::message::{EntryId, Message};
use crate::metrics::ConsumerMetrics;
use crate::reader::StreamReader;
use crate::shutdown::Shutdown;
use crate::tracker::AckTracker;

type InFlight = Arc<Mutex<HashSet<EntryId>>>;

/// Removes a message from the in-flight set when its task ends, panics included
struct InFlightGuard {
    set: InFlight,
    id: EntryId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct Dispatcher<H: Handler> {
    reader: Arc<StreamReader>,
    tracker: Arc<AckTracker>,
    handler: Arc<H>,
    max_concurrency: usize,
    batch_size: usize,
    block_timeout: Duration,
    claim_min_idle: Duration,
    claim_interval: Duration,
    max_delivery_attempts: u32,
    backoff: BackoffPolicy,
    metrics: ConsumerMetrics,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(
        reader: Arc<StreamReader>,
        tracker: Arc<AckTracker>,
        handler: Arc<H>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            metrics: ConsumerMetrics::new(reader.stream(), reader.group()),
            reader,
            tracker,
            handler,
            max_concurrency: config.max_concurrency.max(1),
            batch_size: config.batch_size.max(1),
            block_timeout: config.block_timeout,
            claim_min_idle: config.claim_min_idle,
            claim_interval: config.claim_interval,
            max_delivery_attempts: config.max_delivery_attempts,
            backoff: config.backoff.clone(),
        }
    }

    /// Run until `shutdown` fires or the store is unreachable for good.
    ///
    /// Returns `Ok` after a clean drain, or the fatal error that ended the loop.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ConsumerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks: JoinSet<Result<(), ConsumerError>> = JoinSet::new();
        let mut fault: Option<ConsumerError> = None;
        let mut consecutive_errors: u32 = 0;
        let mut last_claim = Instant::now();

        info!(
            stream = %self.reader.stream(),
            group = %self.reader.group(),
            consumer = %self.reader.consumer(),
            handler = self.handler.name(),
            max_concurrency = self.max_concurrency,
            "Dispatch loop started"
        );

        match self.reader.recover_own_pending(self.batch_size).await {
            Ok(messages) => {
                for message in messages {
                    let Some(permit) = acquire(&semaphore, &shutdown).await else {
                        break;
                    };
                    self.spawn(&mut tasks, message, permit, &shutdown, &in_flight);
                }
            }
            Err(e) if e.is_fatal() => fault = Some(e),
            Err(e) => warn!(error = %e, "Recovering own pending entries failed"),
        }

        'dispatch: while fault.is_none() {
            if shutdown.is_cancelled() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = reap(joined) {
                    fault = Some(e);
                    break 'dispatch;
                }
            }
            self.metrics.in_flight(tasks.len());

            if let Err(e) = self.tracker.flush_retries().await {
                if e.is_fatal() {
                    fault = Some(e);
                    break;
                }
                warn!(error = %e, "Flushing deferred acknowledgments failed");
            }

            if last_claim.elapsed() >= self.claim_interval {
                last_claim = Instant::now();
                let busy = |id: EntryId| {
                    self.tracker.is_deferred(id)
                        || in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .contains(&id)
                };
                match self
                    .reader
                    .claim_stale(self.claim_min_idle, self.batch_size, busy)
                    .await
                {
                    Ok(entries) => {
                        self.metrics.claimed(entries.len());
                        for entry in entries {
                            debug!(
                                message_id = %entry.message.id(),
                                previous_consumer = %entry.previous_consumer,
                                idle_ms = entry.idle.as_millis() as u64,
                                delivery_count = entry.message.delivery_count(),
                                "Dispatching reclaimed entry"
                            );
                            let Some(permit) = acquire(&semaphore, &shutdown).await else {
                                break 'dispatch;
                            };
                            self.spawn(&mut tasks, entry.message, permit, &shutdown, &in_flight);
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        fault = Some(e);
                        break;
                    }
                    Err(e) => warn!(error = %e, "Stale-claim pass failed"),
                }
            }

            // Backpressure: never read more than there are free slots
            let Some(first) = acquire(&semaphore, &shutdown).await else {
                break;
            };
            let capacity = (semaphore.available_permits() + 1).min(self.batch_size);

            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self.reader.read_batch(capacity, self.block_timeout) => batch,
            };

            match batch {
                Ok(messages) => {
                    consecutive_errors = 0;
                    if messages.is_empty() {
                        continue;
                    }
                    self.metrics.received(messages.len());

                    let mut first = Some(first);
                    for message in messages {
                        let permit = match first.take() {
                            Some(permit) => permit,
                            None => match acquire(&semaphore, &shutdown).await {
                                Some(permit) => permit,
                                None => break 'dispatch,
                            },
                        };
                        self.spawn(&mut tasks, message, permit, &shutdown, &in_flight);
                    }
                }
                Err(e) if e.is_fatal() => {
                    fault = Some(e);
                    break;
                }
                Err(e) => {
                    drop(first);
                    let delay = self.backoff.delay_for_attempt(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Reading batch failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Draining in-flight handlers");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = reap(joined) {
                fault.get_or_insert(e);
            }
        }
        self.metrics.in_flight(0);

        if fault.is_none()
            && let Err(e) = self.tracker.flush_retries().await
        {
            warn!(error = %e, "Final flush of deferred acknowledgments failed");
            if e.is_fatal() {
                fault = Some(e);
            }
        }

        match fault {
            Some(e) => {
                error!(error = %e, "Dispatch loop stopped on fatal error");
                Err(e)
            }
            None => {
                info!(stream = %self.reader.stream(), "Dispatch loop stopped");
                Ok(())
            }
        }
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Result<(), ConsumerError>>,
        message: Message,
        permit: OwnedSemaphorePermit,
        shutdown: &Shutdown,
        in_flight: &InFlight,
    ) {
        let id = message.id();

        // A redelivered copy of a message we are still working on stays pending
        if self.tracker.is_deferred(id) {
            debug!(message_id = %id, "Skipping message with deferred acknowledgment");
            return;
        }
        if !in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
        {
            debug!(message_id = %id, "Skipping message already in flight");
            return;
        }
        let guard = InFlightGuard {
            set: in_flight.clone(),
            id,
        };

        let handler = self.handler.clone();
        let tracker = self.tracker.clone();
        let metrics = self.metrics.clone();
        let shutdown = shutdown.clone();
        let max_attempts = self.max_delivery_attempts;

        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let started = Instant::now();

            let outcome = if message.delivery_count() > max_attempts {
                ProcessingOutcome::fatal(format!(
                    "delivery attempts exhausted ({} > {})",
                    message.delivery_count(),
                    max_attempts
                ))
            } else {
                handler.handle(&message, &shutdown).await
            };
            metrics.handled(outcome.label(), started.elapsed());

            debug!(
                message_id = %message.id(),
                delivery_count = message.delivery_count(),
                outcome = outcome.label(),
                "Message handled"
            );

            match tracker.record(&message, outcome).await {
                Ok(disposition) => {
                    debug!(message_id = %message.id(), ?disposition, "Outcome recorded");
                    Ok(())
                }
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    warn!(message_id = %message.id(), error = %e, "Recording outcome failed");
                    Ok(())
                }
            }
        });
    }
}

async fn acquire(semaphore: &Arc<Semaphore>, shutdown: &Shutdown) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    }
}

/// Surface fatal task errors; a panicking handler leaves its message pending
fn reap(joined: Result<Result<(), ConsumerError>, JoinError>) -> Result<(), ConsumerError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            error!(error = %e, "Handler panicked, message stays pending");
            Ok(())
        }
        Err(_) => Ok(()),
    }
}
