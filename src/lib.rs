//! modbus-reader - Modbus master library
//!
//! Packs register mappings into the fewest wire reads, decodes raw words
//! into typed values and polls many slaves over one link with per-device
//! fault isolation and change detection.

pub mod api;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod mapping;
pub mod metrics;
pub mod modbus;

pub use device::{DeviceStatus, MappingSnapshot, ModbusDevice, ReadOutcome, ValueChange};
pub use error::{
    ConfigError, DecodeError, EncodeError, ReadError, ReaderError, TransportError, WriteError,
};
pub use group::{group_mappings, RegisterGroup, SpanLimits};
pub use mapping::{ByteOrder, DataType, RegisterMapping, RegisterType, Value, WordOrder};
pub use modbus::{
    ModbusClient, ModbusGroupReader, ModbusReader, ReaderEvent, ReaderSettings, ReaderState,
};
