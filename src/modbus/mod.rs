//! Modbus transport capability and polling
//!
//! The transport is consumed through [`ModbusClient`]; TCP and RTU links are
//! interchangeable implementations of it.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod client;
pub mod group_reader;
pub mod reader;

pub use client::{Endpoint, SerialSettings, TokioModbusClient};
pub use group_reader::ModbusGroupReader;
pub use reader::{ModbusReader, ReaderEvent, ReaderSettings, ReaderState};

/// Request/response access to Modbus slaves over one link.
///
/// Every call either returns the payload or a [`TransportError`]; callers
/// never see panics for timeouts, CRC failures or slave exceptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn read_coils(&self, slave: u8, address: u16, count: u16)
        -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_single_register(
        &self,
        slave: u8,
        address: u16,
        word: u16,
    ) -> Result<(), TransportError>;

    async fn write_multiple_registers(
        &self,
        slave: u8,
        address: u16,
        words: &[u16],
    ) -> Result<(), TransportError>;

    async fn write_coil(&self, slave: u8, address: u16, bit: bool) -> Result<(), TransportError>;

    /// Re-establish the link after every request of a poll cycle failed
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
