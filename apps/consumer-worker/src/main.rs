//! Consumer Worker - Entry Point
//!
//! Hosts a stream consumer worker until SIGINT/SIGTERM.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    consumer_worker::run().await
}
