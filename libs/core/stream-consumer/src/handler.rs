//! Message handler trait and processing outcomes

use std::future::Future;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::message::Message;
use crate::shutdown::Shutdown;

/// Result of handling one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Handled; acknowledge the message
    Success,
    /// Try again later; the message stays pending
    Retryable(String),
    /// Never succeeds; dead-letter the message
    Fatal(String),
}

impl ProcessingOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        ProcessingOutcome::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        ProcessingOutcome::Fatal(reason.into())
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::Retryable(_) => "retryable",
            ProcessingOutcome::Fatal(_) => "fatal",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProcessingOutcome::Success => None,
            ProcessingOutcome::Retryable(r) | ProcessingOutcome::Fatal(r) => Some(r),
        }
    }
}

impl From<Result<(), HandlerError>> for ProcessingOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => ProcessingOutcome::Success,
            Err(HandlerError::Transient(reason)) => ProcessingOutcome::Retryable(reason),
            Err(HandlerError::Permanent(reason)) => ProcessingOutcome::Fatal(reason),
        }
    }
}

/// Application logic invoked for every delivered message.
///
/// Handlers run concurrently up to the configured pool size and should
/// observe `shutdown` for long-running work.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: &Message, shutdown: &Shutdown) -> ProcessingOutcome;

    /// Name used in logs and metrics
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`Handler`]
///
/// The closure receives an owned clone of the message and shutdown signal so
/// the returned future can be `'static`.
pub fn handler_fn<F, Fut, O>(f: F) -> HandlerFn<F>
where
    F: Fn(Message, Shutdown) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<ProcessingOutcome> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut, O> Handler for HandlerFn<F>
where
    F: Fn(Message, Shutdown) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<ProcessingOutcome> + Send,
{
    async fn handle(&self, message: &Message, shutdown: &Shutdown) -> ProcessingOutcome {
        (self.f)(message.clone(), shutdown.clone()).await.into()
    }

    fn name(&self) -> &'static str {
        "handler_fn"
    }
}
