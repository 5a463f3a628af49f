//! Register mappings
//!
//! A mapping describes one logical value on a device: where it lives, how many
//! registers it covers and how the raw words turn into a typed [`Value`]. The
//! shape of a mapping is fixed once it is constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::group::MAX_WRITE_REGISTERS;

/// Modbus register table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegisterType {
    /// Coils and discrete inputs are addressed per bit
    pub fn is_bit_addressed(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }

    /// Discrete inputs and input registers cannot be written
    pub fn is_read_only(self) -> bool {
        matches!(self, RegisterType::Discrete | RegisterType::Input)
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        };
        f.write_str(name)
    }
}

/// Application-level type of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    #[serde(alias = "i16")]
    Int16,
    #[serde(alias = "u16")]
    UInt16,
    #[serde(alias = "i32")]
    Int32,
    #[serde(alias = "u32")]
    UInt32,
    #[serde(alias = "f32")]
    Float,
    String,
}

impl DataType {
    /// Register count of fixed-size types, `None` for strings
    pub fn fixed_register_count(self) -> Option<u16> {
        match self {
            DataType::Bool | DataType::Int16 | DataType::UInt16 => Some(1),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(2),
            DataType::String => None,
        }
    }

    fn is_numeric(self) -> bool {
        !matches!(self, DataType::Bool | DataType::String)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float => "float",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// Order of the two words of a 32-bit value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// High word at the lower address (Modbus convention)
    #[default]
    HighFirst,
    /// Low word at the lower address ("little-endian register order")
    LowFirst,
}

/// Order of the two characters packed into one register of a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// First character in the high byte
    #[default]
    HighFirst,
    /// First character in the low byte
    LowFirst,
}

/// Decoded value of a mapping
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float(f32),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int16(_) => DataType::Int16,
            Value::UInt16(_) => DataType::UInt16,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
        }
    }

    /// Numeric view used by deadband filtering and metrics
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int16(v) => Some(f64::from(*v)),
            Value::UInt16(v) => Some(f64::from(*v)),
            Value::Int32(v) => Some(f64::from(*v)),
            Value::UInt32(v) => Some(f64::from(*v)),
            Value::Float(v) => Some(f64::from(*v)),
            Value::String(_) => None,
        }
    }

    /// Change detection between a cached value and a freshly decoded one.
    ///
    /// Floats compare by bit pattern when no deadband is set, so a NaN that
    /// keeps its payload is not reported as a change on every cycle.
    pub fn differs_from(&self, previous: &Value, deadband: f64) -> bool {
        if self.data_type() != previous.data_type() {
            return true;
        }

        if deadband > 0.0 && self.data_type().is_numeric() {
            return match (self.as_f64(), previous.as_f64()) {
                (Some(new), Some(old)) if new.is_nan() || old.is_nan() => {
                    new.to_bits() != old.to_bits()
                }
                (Some(new), Some(old)) => (new - old).abs() >= deadband,
                _ => true,
            };
        }

        match (self, previous) {
            (Value::Float(new), Value::Float(old)) => new.to_bits() != old.to_bits(),
            _ => self != previous,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
        }
    }
}

/// One logical value on a device
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMapping {
    name: String,
    register_type: RegisterType,
    address: u16,
    data_type: DataType,
    register_count: u16,
    bit_index: Option<u8>,
    word_order: WordOrder,
    byte_order: ByteOrder,
    write_only: bool,
    deadband: f64,
    frequency_filter: Duration,
    repeated_write: Option<Duration>,
}

impl RegisterMapping {
    /// Mapping of a fixed-size type.
    ///
    /// Coils and discrete inputs only carry `Bool`. On holding and input
    /// registers a `Bool` without bit index treats the whole word as a flag.
    pub fn new(
        name: impl Into<String>,
        register_type: RegisterType,
        address: u16,
        data_type: DataType,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let register_count = data_type
            .fixed_register_count()
            .ok_or_else(|| ConfigError::MissingRegisterCount { name: name.clone() })?;

        if register_type.is_bit_addressed() && data_type != DataType::Bool {
            return Err(ConfigError::InvalidDataType {
                name,
                register_type,
                data_type,
            });
        }

        Self::build(name, register_type, address, data_type, register_count, None)
    }

    /// Single bit taken from a holding or input register
    pub fn bit(
        name: impl Into<String>,
        register_type: RegisterType,
        address: u16,
        bit_index: u8,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if register_type.is_bit_addressed() {
            return Err(ConfigError::BitIndexOnBitRegister { name });
        }
        if bit_index > 15 {
            return Err(ConfigError::BitIndexOutOfRange { name, bit_index });
        }

        Self::build(
            name,
            register_type,
            address,
            DataType::Bool,
            1,
            Some(bit_index),
        )
    }

    /// Latin-1 string spread over `register_count` registers, two characters each.
    ///
    /// Holding register strings are writable and so limited to the width of
    /// a single multiple-register write.
    pub fn string(
        name: impl Into<String>,
        register_type: RegisterType,
        address: u16,
        register_count: u16,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if register_type.is_bit_addressed() {
            return Err(ConfigError::InvalidDataType {
                name,
                register_type,
                data_type: DataType::String,
            });
        }
        if register_count == 0 {
            return Err(ConfigError::EmptyString { name });
        }

        Self::build(
            name,
            register_type,
            address,
            DataType::String,
            register_count,
            None,
        )
    }

    fn build(
        name: String,
        register_type: RegisterType,
        address: u16,
        data_type: DataType,
        register_count: u16,
        bit_index: Option<u8>,
    ) -> Result<Self, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if u32::from(address) + u32::from(register_count) > 0x1_0000 {
            return Err(ConfigError::AddressOverflow {
                name,
                address,
                count: register_count,
            });
        }
        if register_type == RegisterType::Holding && register_count > MAX_WRITE_REGISTERS {
            return Err(ConfigError::MappingTooWide {
                name,
                count: register_count,
                max_span: MAX_WRITE_REGISTERS,
            });
        }

        Ok(Self {
            name,
            register_type,
            address,
            data_type,
            register_count,
            bit_index,
            word_order: WordOrder::default(),
            byte_order: ByteOrder::default(),
            write_only: false,
            deadband: 0.0,
            frequency_filter: Duration::ZERO,
            repeated_write: None,
        })
    }

    /// Word order for 32-bit types; other types ignore it
    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    /// Character order inside each register; only strings use it
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Exclude the mapping from polling while keeping it writable
    pub fn write_only(mut self) -> Result<Self, ConfigError> {
        if self.register_type.is_read_only() {
            return Err(ConfigError::WriteOnlyReadOnlyRegister {
                name: self.name,
                register_type: self.register_type,
            });
        }
        self.write_only = true;
        Ok(self)
    }

    /// Minimum absolute difference reported as a change for numeric types
    pub fn with_deadband(mut self, deadband: f64) -> Result<Self, ConfigError> {
        if !deadband.is_finite() || deadband < 0.0 {
            return Err(ConfigError::InvalidDeadband { name: self.name });
        }
        self.deadband = deadband;
        Ok(self)
    }

    /// Suppress changes arriving sooner than `filter` after the last reported
    /// one. `Duration::ZERO` turns the filter off.
    pub fn with_frequency_filter(mut self, filter: Duration) -> Self {
        self.frequency_filter = filter;
        self
    }

    /// Write the cached value again whenever it has not been updated for `period`
    pub fn with_repeated_write(mut self, period: Duration) -> Result<Self, ConfigError> {
        if self.register_type.is_read_only() {
            return Err(ConfigError::RepeatedWriteReadOnlyRegister {
                name: self.name,
                register_type: self.register_type,
            });
        }
        if period.is_zero() {
            return Err(ConfigError::InvalidRepeatedWrite { name: self.name });
        }
        self.repeated_write = Some(period);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    pub fn bit_index(&self) -> Option<u8> {
        self.bit_index
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only
    }

    pub fn deadband(&self) -> f64 {
        self.deadband
    }

    pub fn frequency_filter(&self) -> Duration {
        self.frequency_filter
    }

    pub fn repeated_write(&self) -> Option<Duration> {
        self.repeated_write
    }

    /// Exclusive end address, widened so the last register can be 65535
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.register_count)
    }
}
