//! Stream Consumer
//!
//! A reliable Redis Streams consumer worker, hosted by any process that can
//! call `start()` and `stop()`.
//!
//! ## Components
//!
//! - **Connection manager**: one shared Redis session, reconnect with backoff
//! - **Stream reader**: consumer-group reads, stale-entry reclaim, cursor tracking
//! - **Dispatch loop**: single coordinator fanning out to a bounded handler pool
//! - **Acknowledgment tracker**: ack, leave pending, or dead-letter then ack
//! - **Lifecycle controller**: `Created -> Starting -> Running -> Stopping -> Stopped`
//!
//! ## Example
//!
//! ```ignore
//! use stream_consumer::{handler_fn, ConsumerConfig, ConsumerWorker, ProcessingOutcome, RedisConnector};
//!
//! let config = ConsumerConfig::new("orders:events", "order_workers")
//!     .with_endpoint("redis://127.0.0.1:6379")
//!     .with_max_concurrency(8);
//!
//! let handler = handler_fn(|message, _shutdown| async move {
//!     tracing::info!(id = %message.id(), "Handling order event");
//!     ProcessingOutcome::Success
//! });
//!
//! let worker = ConsumerWorker::new(config.clone(), handler, RedisConnector::from_config(&config));
//! worker.start().await?;
//! // ...
//! worker.stop().await?;
//! ```

pub mod backoff;
mod config;
mod connection;
mod dead_letter;
mod dispatch;
mod error;
mod handler;
mod health;
mod lifecycle;
mod message;
pub mod metrics;
mod reader;
pub mod shutdown;
pub mod store;
mod tracker;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use config::ConsumerConfig;
pub use connection::{RedisConnection, RedisConnector};
pub use dead_letter::{DeadLetterEntry, DeadLetterWriter};
pub use dispatch::Dispatcher;
pub use error::{ConsumerError, HandlerError, InvalidEntryId};
pub use handler::{handler_fn, Handler, HandlerFn, ProcessingOutcome};
pub use health::{health_router, HealthState};
pub use lifecycle::{ConsumerWorker, LifecycleState, WorkerFault, WorkerStatus};
pub use message::{EntryId, Fields, Message, PendingEntry};
pub use crate::metrics::{init_metrics, ConsumerMetrics};
pub use reader::{ConsumerGroupCursor, StreamReader};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use store::memory::{MemoryStore, StoreOp};
pub use store::{Connector, PendingInfo, StreamStore};
pub use tracker::{AckTracker, Disposition};
