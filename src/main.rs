//! modbus-reader - Modbus TCP/RTU polling gateway
//!
//! Polls the configured slaves in grouped reads and serves the decoded
//! values over HTTP.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modbus_reader::bridge::Bridge;
use modbus_reader::config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting modbus-reader v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config()?;
    info!(
        "Configuration loaded: {} devices configured",
        config.devices.len()
    );

    let bridge = Bridge::new(config)?;
    bridge.run().await?;

    info!("modbus-reader stopped");
    Ok(())
}
