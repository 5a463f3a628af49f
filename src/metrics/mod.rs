//! Prometheus metrics for the Modbus reader
//!
//! Exposes metrics at /metrics endpoint in Prometheus format:
//! - Group read counts and latency per slave and register type
//! - Poll cycle duration
//! - Device online status
//! - Write counts
//! - Reconnect attempts

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};
use tracing::info;

use crate::mapping::RegisterType;

/// Initialize Prometheus metrics exporter
/// Returns a handle to render metrics
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    info!("Prometheus metrics initialized");
    Ok(handle)
}

/// Timing of one group read
pub struct ReadMetrics {
    start: Instant,
    slave: String,
    register_type: &'static str,
}

impl ReadMetrics {
    /// Start timing a group read
    pub fn start(slave: u8, register_type: RegisterType) -> Self {
        Self {
            start: Instant::now(),
            slave: slave.to_string(),
            register_type: register_type_label(register_type),
        }
    }

    /// Record successful read
    pub fn success(self, values: usize) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "modbus_reader_group_reads_total",
            "slave" => self.slave.clone(),
            "register_type" => self.register_type,
            "status" => "success"
        )
        .increment(1);

        counter!(
            "modbus_reader_values_decoded_total",
            "slave" => self.slave.clone()
        )
        .increment(values as u64);

        histogram!(
            "modbus_reader_read_duration_seconds",
            "slave" => self.slave,
            "register_type" => self.register_type
        )
        .record(duration);
    }

    /// Record failed read
    pub fn failure(self, error_type: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "modbus_reader_group_reads_total",
            "slave" => self.slave.clone(),
            "register_type" => self.register_type,
            "status" => "error"
        )
        .increment(1);

        counter!(
            "modbus_reader_errors_total",
            "slave" => self.slave.clone(),
            "type" => error_type
        )
        .increment(1);

        // latency of failed reads is still interesting for timeouts
        histogram!(
            "modbus_reader_read_duration_seconds",
            "slave" => self.slave,
            "register_type" => self.register_type
        )
        .record(duration);
    }
}

fn register_type_label(register_type: RegisterType) -> &'static str {
    match register_type {
        RegisterType::Coil => "coil",
        RegisterType::Discrete => "discrete",
        RegisterType::Holding => "holding",
        RegisterType::Input => "input",
    }
}

/// Record device online status
pub fn record_device_status(slave: u8, online: bool) {
    gauge!(
        "modbus_reader_device_online",
        "slave" => slave.to_string()
    )
    .set(if online { 1.0 } else { 0.0 });
}

/// Record a single-mapping write
pub fn record_write(slave: u8, success: bool) {
    counter!(
        "modbus_reader_writes_total",
        "slave" => slave.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record number of devices polled in the last cycle
pub fn record_active_devices(count: usize) {
    gauge!("modbus_reader_active_devices").set(count as f64);
}

/// Record poll cycle timing
pub fn record_poll_cycle(duration: Duration) {
    histogram!("modbus_reader_poll_cycle_seconds").record(duration.as_secs_f64());
}

/// Record a reconnect attempt
pub fn record_reconnect(success: bool) {
    counter!(
        "modbus_reader_reconnects_total",
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}
