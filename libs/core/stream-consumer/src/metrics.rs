//! Prometheus metrics for stream consumers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::error::ConsumerError;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), ConsumerError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ConsumerError::Metrics(e.to_string()))?;
        info!("Prometheus metrics initialized");
        Ok::<_, ConsumerError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a command retried after a connection error
pub fn connection_retry(op: &'static str) {
    counter!("stream_consumer_connection_retries_total", "op" => op).increment(1);
}

/// Consumer metrics helper, labeled by stream and group
#[derive(Clone, Debug)]
pub struct ConsumerMetrics {
    stream: String,
    group: String,
}

impl ConsumerMetrics {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }

    /// Record messages returned by a read
    pub fn received(&self, count: usize) {
        counter!(
            "stream_consumer_messages_received_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(count as u64);
    }

    /// Record a handler invocation and its outcome
    pub fn handled(&self, outcome: &'static str, duration: Duration) {
        counter!(
            "stream_consumer_messages_handled_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "stream_consumer_handler_duration_seconds",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn acked(&self) {
        counter!(
            "stream_consumer_messages_acked_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "stream_consumer_messages_dead_lettered_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }

    /// Record a failed ack or dead-letter write that was queued for retry
    pub fn ack_failed(&self) {
        counter!(
            "stream_consumer_ack_failures_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(1);
    }

    /// Record entries taken over from other consumers
    pub fn claimed(&self, count: usize) {
        counter!(
            "stream_consumer_messages_claimed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .increment(count as u64);
    }

    /// Update the in-flight handler gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "stream_consumer_in_flight",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .set(count as f64);
    }

    /// Update the deferred ack queue gauge
    pub fn deferred(&self, count: usize) {
        gauge!(
            "stream_consumer_deferred_acks",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .set(count as f64);
    }
}
