//! Consumer Worker Service
//!
//! Hosts one stream consumer worker and its health endpoints.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (CONSUMER_STREAM)
//!   ↓ (Consumer Group: CONSUMER_GROUP)
//! ConsumerWorker<LoggingHandler>
//!   ↓ (ack / leave pending / dead-letter)
//! Redis Stream (<stream>:dlq)
//! ```
//!
//! The worker stops on SIGINT/SIGTERM, or on its own when Redis stays
//! unreachable; the process then exits non-zero so the orchestrator restarts it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use core_config::server::HealthServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use stream_consumer::{
    health_router, init_metrics, ConsumerConfig, ConsumerWorker, Handler, HealthState, Message,
    ProcessingOutcome, RedisConnector, Shutdown,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Logs every entry and acknowledges it
pub struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, message: &Message, _shutdown: &Shutdown) -> ProcessingOutcome {
        let fields: Vec<String> = message
            .payload()
            .iter()
            .map(|(key, value)| format!("{}={}", key, String::from_utf8_lossy(value)))
            .collect();

        info!(
            message_id = %message.id(),
            delivery_count = message.delivery_count(),
            redelivery = message.is_redelivery(),
            fields = %fields.join(" "),
            "Received stream entry"
        );

        ProcessingOutcome::Success
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

/// Load and validate everything the service needs from the environment
pub fn load_config() -> Result<(ConsumerConfig, HealthServerConfig)> {
    let consumer = ConsumerConfig::from_env().wrap_err("Failed to load consumer configuration")?;
    consumer
        .validate()
        .wrap_err("Invalid consumer configuration")?;
    let health =
        HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    Ok((consumer, health))
}

/// Serve `/health`, `/ready` and `/metrics`
async fn start_health_server(health_state: HealthState, address: String) -> Result<()> {
    let app: Router = health_router(health_state);

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", address))?;

    info!(address = %address, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the consumer worker service
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is missing or invalid
/// - The worker cannot connect or create its consumer group
/// - The worker faults while running
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let (config, health_config) = load_config()?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting consumer worker service"
    );
    info!(
        stream = %config.stream_name,
        group = %config.group_name,
        consumer = %config.consumer_name,
        dead_letter_stream = %config.dead_letter_name,
        max_concurrency = config.max_concurrency,
        max_delivery_attempts = config.max_delivery_attempts,
        batch_size = config.batch_size,
        "Worker configuration loaded"
    );

    let connector = RedisConnector::from_config(&config);
    let worker = Arc::new(ConsumerWorker::new(config.clone(), LoggingHandler, connector));

    let health_state = HealthState::new(
        worker.clone(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.stream_name.clone(),
    );
    let address = health_config.address();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, address).await {
            error!(error = %e, "Health server failed");
        }
    });

    worker
        .start()
        .await
        .wrap_err("Failed to start consumer worker")?;

    let mut faults = worker.faults();
    let outcome = tokio::select! {
        result = shutdown_signal() => result,
        fault = faults.wait_for(|f| f.is_some()) => {
            let reason = fault
                .ok()
                .and_then(|f| f.as_ref().map(|f| f.reason.clone()))
                .unwrap_or_else(|| "fault channel closed".to_string());
            Err(eyre!("Consumer worker faulted: {}", reason))
        }
    };

    worker
        .stop()
        .await
        .wrap_err("Failed to stop consumer worker")?;

    info!("Consumer worker service stopped");
    outcome
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_consumer::{EntryId, Fields};

    const VARS: [&str; 4] = ["REDIS_URL", "CONSUMER_STREAM", "CONSUMER_GROUP", "HEALTH_PORT"];

    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|key| {
                let value = set.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[tokio::test]
    async fn test_logging_handler_acknowledges() {
        let mut payload = Fields::new();
        payload.insert("order_id".into(), b"42".to_vec());
        let message = Message::new(EntryId::new(1, 0), payload, 1);

        let outcome = LoggingHandler.handle(&message, &Shutdown::never()).await;
        assert_eq!(outcome, ProcessingOutcome::Success);
    }

    #[test]
    fn test_load_config_from_env() {
        with_env(
            &[
                ("REDIS_URL", "redis://cache:6379"),
                ("CONSUMER_STREAM", "orders:events"),
                ("CONSUMER_GROUP", "billing"),
                ("HEALTH_PORT", "9100"),
            ],
            || {
                let (consumer, health) = load_config().unwrap();
                assert_eq!(consumer.stream_name, "orders:events");
                assert_eq!(consumer.dead_letter_name, "orders:events:dlq");
                assert_eq!(health.port, 9100);
            },
        );
    }

    #[test]
    fn test_load_config_requires_stream() {
        with_env(&[("REDIS_URL", "redis://cache:6379")], || {
            assert!(load_config().is_err());
        });
    }
}
