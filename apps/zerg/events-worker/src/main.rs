//! Events Worker Service - Entry Point
//!
//! Background worker that consumes task lifecycle events from RabbitMQ.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    zerg_events_worker::run().await
}
