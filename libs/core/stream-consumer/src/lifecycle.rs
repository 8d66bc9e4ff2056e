//! Lifecycle controller
//!
//! `Created -> Starting -> Running -> Stopping -> Stopped`, with `start()`
//! allowed again from `Stopped`. State and faults are published on `watch`
//! channels so hosts can observe them without polling.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::dead_letter::DeadLetterWriter;
use crate::dispatch::Dispatcher;
use crate::error::ConsumerError;
use crate::handler::Handler;
use crate::reader::StreamReader;
use crate::shutdown::{self, ShutdownTrigger};
use crate::store::{Connector, StreamStore};
use crate::tracker::AckTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    /// A loop task may exist in this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Terminal failure of a running worker, published once per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerFault {
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl WorkerFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Read-only view of a worker, used by the health endpoints
pub trait WorkerStatus: Send + Sync {
    fn state(&self) -> LifecycleState;

    /// Running and the store connection is up
    fn is_healthy(&self) -> bool;

    fn fault(&self) -> Option<WorkerFault>;
}

struct RunningWorker {
    trigger: ShutdownTrigger,
    task: JoinHandle<()>,
}

pub struct ConsumerWorker<H: Handler> {
    config: ConsumerConfig,
    handler: Arc<H>,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<LifecycleState>>,
    fault: Arc<watch::Sender<Option<WorkerFault>>>,
    running: Mutex<Option<RunningWorker>>,
    store: StdMutex<Option<Arc<dyn StreamStore>>>,
}

impl<H: Handler> ConsumerWorker<H> {
    pub fn new(config: ConsumerConfig, handler: H, connector: impl Connector) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        let (fault, _) = watch::channel(None);
        Self {
            config,
            handler: Arc::new(handler),
            connector: Arc::new(connector),
            state: Arc::new(state),
            fault: Arc::new(fault),
            running: Mutex::new(None),
            store: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Watch for the terminal fault of the current run
    pub fn faults(&self) -> watch::Receiver<Option<WorkerFault>> {
        self.fault.subscribe()
    }

    pub fn fault(&self) -> Option<WorkerFault> {
        self.fault.borrow().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == LifecycleState::Running
            && self
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|store| store.is_healthy())
    }

    fn transition(&self, to: LifecycleState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(stream = %self.config.stream_name, %from, %to, "Lifecycle transition");
        }
    }

    /// Connect, make sure the group exists and launch the dispatch loop.
    ///
    /// Allowed from `Created` and `Stopped`. A failed start leaves the worker
    /// `Stopped`, so it can be started again.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;

        let current = self.state();
        if !matches!(current, LifecycleState::Created | LifecycleState::Stopped) {
            return Err(ConsumerError::InvalidState {
                action: "start",
                state: current,
            });
        }
        self.config.validate()?;

        // A run that ended on its own leaves a finished task behind
        running.take();
        self.fault.send_replace(None);
        self.transition(LifecycleState::Starting);

        let config = &self.config;
        let setup = async {
            let store = self.connector.connect().await?;
            let reader = StreamReader::new(
                store.clone(),
                &config.stream_name,
                &config.group_name,
                &config.consumer_name,
            )
            .with_start_id(&config.group_start_id);
            reader.ensure_group().await?;
            Ok::<_, ConsumerError>((store, reader))
        };

        let (store, reader) = match tokio::time::timeout(config.start_timeout, setup).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                error!(stream = %config.stream_name, error = %e, "Worker failed to start");
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
            Err(_) => {
                error!(
                    stream = %config.stream_name,
                    timeout_ms = config.start_timeout.as_millis() as u64,
                    "Worker start timed out"
                );
                self.transition(LifecycleState::Stopped);
                return Err(ConsumerError::StartTimeout(config.start_timeout));
            }
        };

        let dead_letter = DeadLetterWriter::new(
            store.clone(),
            &config.dead_letter_name,
            config.dead_letter_max_len,
        );
        let tracker = AckTracker::new(
            store.clone(),
            &config.stream_name,
            &config.group_name,
            &config.consumer_name,
            config.max_delivery_attempts,
            dead_letter,
        );
        let dispatcher = Dispatcher::new(
            Arc::new(reader),
            Arc::new(tracker),
            self.handler.clone(),
            config,
        );

        *self.store.lock().unwrap_or_else(PoisonError::into_inner) = Some(store);

        let (trigger, signal) = shutdown::channel();
        let state = self.state.clone();
        let fault = self.fault.clone();
        let stream = config.stream_name.clone();

        let task = tokio::spawn(async move {
            let Err(e) = dispatcher.run(signal).await else {
                return;
            };

            let published = fault.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(WorkerFault::new(e.to_string()));
                true
            });
            if published {
                error!(stream = %stream, error = %e, "Worker faulted");
            }

            // stop() owns the transition once it has begun
            state.send_if_modified(|s| {
                if matches!(s, LifecycleState::Starting | LifecycleState::Running) {
                    *s = LifecycleState::Stopped;
                    true
                } else {
                    false
                }
            });
        });

        *running = Some(RunningWorker { trigger, task });

        // The loop may already have faulted
        let started = self.state.send_if_modified(|s| {
            if *s == LifecycleState::Starting {
                *s = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if started {
            info!(
                stream = %config.stream_name,
                group = %config.group_name,
                consumer = %config.consumer_name,
                max_concurrency = config.max_concurrency,
                "Worker started"
            );
        }

        Ok(())
    }

    /// Stop pulling, wait up to the shutdown grace for in-flight handlers,
    /// then abort whatever is left. Always ends in `Stopped`.
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut running = self.running.lock().await;

        if !self.state().is_active() {
            running.take();
            return Ok(());
        }
        self.transition(LifecycleState::Stopping);

        if let Some(RunningWorker { trigger, mut task }) = running.take() {
            trigger.trigger();

            let grace = self.config.shutdown_grace;
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Dispatch task ended abnormally"),
                Err(_) => {
                    warn!(
                        stream = %self.config.stream_name,
                        grace_ms = grace.as_millis() as u64,
                        "Shutdown grace expired, aborting in-flight handlers"
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        self.store.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.transition(LifecycleState::Stopped);
        info!(stream = %self.config.stream_name, "Worker stopped");
        Ok(())
    }
}

impl<H: Handler> WorkerStatus for ConsumerWorker<H> {
    fn state(&self) -> LifecycleState {
        ConsumerWorker::state(self)
    }

    fn is_healthy(&self) -> bool {
        ConsumerWorker::is_healthy(self)
    }

    fn fault(&self) -> Option<WorkerFault> {
        ConsumerWorker::fault(self)
    }
}

impl<H: Handler> Drop for ConsumerWorker<H> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.trigger.trigger();
        }
    }
}
