//! Wiring of configuration, poll loop and HTTP API

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::config::Config;
use crate::device::ModbusDevice;
use crate::metrics;
use crate::modbus::{ModbusReader, ReaderEvent, TokioModbusClient};

/// Owns the devices and the reader for the lifetime of the process
pub struct Bridge {
    config: Config,
    devices: Vec<Arc<ModbusDevice>>,
    reader: Arc<ModbusReader>,
}

impl Bridge {
    /// Build the client, devices and reader from configuration
    pub fn new(config: Config) -> Result<Self> {
        let limits = config
            .reader
            .limits()
            .context("Invalid reader limits")?;
        let client =
            TokioModbusClient::from_config(&config.connection, config.reader.request_timeout())
                .context("Invalid connection settings")?;
        let reader = Arc::new(ModbusReader::new(Arc::new(client), config.reader.settings()));

        let mut devices = Vec::with_capacity(config.devices.len());
        for device_config in &config.devices {
            let device = Arc::new(
                device_config
                    .build(&limits)
                    .with_context(|| format!("Invalid device '{}'", device_config.name))?,
            );
            reader
                .add_device(&device)
                .with_context(|| format!("Cannot register device '{}'", device_config.name))?;
            info!(
                "Device {} (slave {}): {} mapping(s) in {} group(s)",
                device.name(),
                device.slave_address(),
                device.mappings().count(),
                device.groups().len()
            );
            devices.push(device);
        }

        Ok(Self {
            config,
            devices,
            reader,
        })
    }

    pub fn reader(&self) -> &Arc<ModbusReader> {
        &self.reader
    }

    /// Run until ctrl-c, then stop polling
    pub async fn run(self) -> Result<()> {
        let api_state = if self.config.server.metrics_enabled {
            let handle = metrics::init_metrics()?;
            info!("Prometheus metrics enabled at /metrics");
            ApiState::new(self.reader.clone()).with_metrics(handle)
        } else {
            ApiState::new(self.reader.clone())
        };

        let events = self.reader.subscribe();
        tokio::spawn(log_events(events));

        if self.devices.is_empty() {
            warn!("No devices configured, polling disabled");
        } else {
            self.reader.start()?;
        }

        let app = api::create_router(api_state);
        let addr: SocketAddr =
            format!("{}:{}", self.config.server.host, self.config.server.port).parse()?;

        info!("Starting API server on http://{}", addr);
        info!("  - Health check: http://{}/health", addr);
        info!("  - Devices:      http://{}/api/devices", addr);
        if self.config.server.metrics_enabled {
            info!("  - Metrics:      http://{}/metrics", addr);
        }

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.reader.stop().await;
        Ok(())
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ReaderEvent>) {
    loop {
        match events.recv().await {
            Ok(ReaderEvent::ValueChanged(change)) => {
                tracing::debug!("Slave {} {} -> {}", change.slave, change.mapping, change.value);
            }
            Ok(ReaderEvent::StatusChanged { slave, status }) => {
                info!("Slave {} is now {}", slave, status);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, {} event(s) skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
