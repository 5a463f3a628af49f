//! `tokio-modbus` backed transport for TCP and RTU links

use anyhow::{bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::ModbusClient;
use crate::config::ConnectionConfig;
use crate::error::TransportError;

/// Serial line parameters for RTU
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
}

impl SerialSettings {
    fn builder(&self) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .flow_control(tokio_serial::FlowControl::None)
    }
}

/// Where the link goes
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Rtu(SerialSettings),
}

/// Modbus link that connects lazily and drops the connection after timeouts
/// or I/O failures, so the next request starts from a fresh one.
pub struct TokioModbusClient {
    endpoint: Endpoint,
    timeout: Duration,
    context: Mutex<Option<Context>>,
}

impl TokioModbusClient {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            context: Mutex::new(None),
        }
    }

    /// Create a client from the connection section of the configuration
    pub fn from_config(config: &ConnectionConfig, timeout: Duration) -> Result<Self> {
        let endpoint = match config {
            ConnectionConfig::Tcp(tcp) => {
                let addr: SocketAddr = format!("{}:{}", tcp.host, tcp.port)
                    .parse()
                    .with_context(|| "Invalid TCP address")?;
                Endpoint::Tcp(addr)
            }
            ConnectionConfig::Rtu(rtu) => Endpoint::Rtu(SerialSettings {
                path: rtu.port.clone(),
                baud_rate: rtu.baud_rate,
                data_bits: parse_data_bits(rtu.data_bits)?,
                stop_bits: parse_stop_bits(rtu.stop_bits)?,
                parity: parse_parity(&rtu.parity)?,
            }),
        };

        Ok(Self::new(endpoint, timeout))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Context, TransportError> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                info!("Connecting to Modbus TCP: {}", addr);
                let ctx = timeout(self.timeout, tcp::connect(*addr))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                Ok(ctx)
            }
            Endpoint::Rtu(serial) => {
                info!(
                    "Opening Modbus RTU port {} at {} baud",
                    serial.path, serial.baud_rate
                );
                let port = tokio_serial::SerialStream::open(&serial.builder())
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                Ok(rtu::attach(port))
            }
        }
    }

    async fn connected(
        &self,
        slave: u8,
    ) -> Result<MutexGuard<'_, Option<Context>>, TransportError> {
        let mut guard = self.context.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        if let Some(ctx) = guard.as_mut() {
            ctx.set_slave(Slave(slave));
        }
        Ok(guard)
    }

    /// Map a request outcome, dropping the connection when it is no longer trustworthy
    fn finish<T>(
        &self,
        guard: &mut MutexGuard<'_, Option<Context>>,
        result: Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T, TransportError> {
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(TransportError::Exception(exception.to_string())),
            Ok(Err(e)) => {
                warn!("Modbus transport error, dropping connection: {}", e);
                **guard = None;
                Err(TransportError::Io(e.to_string()))
            }
            Err(_) => {
                warn!("Modbus request timed out after {:?}, dropping connection", self.timeout);
                **guard = None;
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ModbusClient for TokioModbusClient {
    async fn read_coils(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        debug!("Reading {} coils from address {} on slave {}", count, address, slave);
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.read_coils(address, count)).await;
        let mut bits = self.finish(&mut guard, result)?;
        // bit responses are padded to whole bytes
        bits.truncate(usize::from(count));
        Ok(bits)
    }

    async fn read_discrete_inputs(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        debug!("Reading {} discrete inputs from address {} on slave {}", count, address, slave);
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.read_discrete_inputs(address, count)).await;
        let mut bits = self.finish(&mut guard, result)?;
        bits.truncate(usize::from(count));
        Ok(bits)
    }

    async fn read_holding_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        debug!("Reading {} holding registers from address {} on slave {}", count, address, slave);
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.read_holding_registers(address, count)).await;
        self.finish(&mut guard, result)
    }

    async fn read_input_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        debug!("Reading {} input registers from address {} on slave {}", count, address, slave);
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.read_input_registers(address, count)).await;
        self.finish(&mut guard, result)
    }

    async fn write_single_register(
        &self,
        slave: u8,
        address: u16,
        word: u16,
    ) -> Result<(), TransportError> {
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.write_single_register(address, word)).await;
        self.finish(&mut guard, result)
    }

    async fn write_multiple_registers(
        &self,
        slave: u8,
        address: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.write_multiple_registers(address, words)).await;
        self.finish(&mut guard, result)
    }

    async fn write_coil(&self, slave: u8, address: u16, bit: bool) -> Result<(), TransportError> {
        let mut guard = self.connected(slave).await?;
        let ctx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = timeout(self.timeout, ctx.write_single_coil(address, bit)).await;
        self.finish(&mut guard, result)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut guard = self.context.lock().await;
        *guard = None;
        *guard = Some(self.connect().await?);
        info!("Modbus link re-established");
        Ok(())
    }
}

fn parse_data_bits(bits: u8) -> Result<tokio_serial::DataBits> {
    Ok(match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => bail!("Unsupported data bits: {}", other),
    })
}

fn parse_stop_bits(bits: u8) -> Result<tokio_serial::StopBits> {
    Ok(match bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => bail!("Unsupported stop bits: {}", other),
    })
}

fn parse_parity(parity: &str) -> Result<tokio_serial::Parity> {
    Ok(match parity.to_ascii_lowercase().as_str() {
        "none" => tokio_serial::Parity::None,
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        other => bail!("Unsupported parity: {}", other),
    })
}
