//! Error types for the register engine and the polling orchestrator
//!
//! Configuration errors are fatal at construction time. Transport errors are
//! recovered locally by the poll loop and show up as per-mapping outcomes.
//! Decode errors indicate a mismatch between what was requested and what the
//! transport returned and are surfaced as soon as they happen.

use crate::mapping::{DataType, RegisterType};

/// Invalid mapping, group or device configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("mapping name must not be empty")]
    EmptyName,
    #[error("mapping '{name}': {data_type} is not valid for {register_type} registers")]
    InvalidDataType {
        name: String,
        register_type: RegisterType,
        data_type: DataType,
    },
    #[error("mapping '{name}': bit index {bit_index} is out of range 0-15")]
    BitIndexOutOfRange { name: String, bit_index: u8 },
    #[error("mapping '{name}': bit index requires a holding or input register")]
    BitIndexOnBitRegister { name: String },
    #[error("mapping '{name}': string mappings need at least one register")]
    EmptyString { name: String },
    #[error("mapping '{name}': use the string constructor for string mappings")]
    MissingRegisterCount { name: String },
    #[error("mapping '{name}': {count} register(s) at {address} overflow the address space")]
    AddressOverflow { name: String, address: u16, count: u16 },
    #[error("mapping '{name}': {register_type} registers are read-only and cannot be write-only")]
    WriteOnlyReadOnlyRegister {
        name: String,
        register_type: RegisterType,
    },
    #[error("mapping '{name}': deadband must be a finite, non-negative number")]
    InvalidDeadband { name: String },
    #[error("mapping '{name}': {register_type} registers are read-only and cannot be rewritten")]
    RepeatedWriteReadOnlyRegister {
        name: String,
        register_type: RegisterType,
    },
    #[error("mapping '{name}': repeated write period must be greater than zero")]
    InvalidRepeatedWrite { name: String },
    #[error(
        "mapping '{name}' claims {register_type} address {address} already claimed by '{other}'"
    )]
    AddressConflict {
        name: String,
        other: String,
        register_type: RegisterType,
        address: u16,
    },
    #[error("duplicate mapping name '{0}'")]
    DuplicateName(String),
    #[error("mapping '{name}' spans {count} registers, more than the limit of {max_span}")]
    MappingTooWide {
        name: String,
        count: u16,
        max_span: u16,
    },
    #[error("{register_type} group spans {span} registers, more than the limit of {max_span}")]
    GroupTooWide {
        register_type: RegisterType,
        span: u32,
        max_span: u16,
    },
    #[error("invalid span limit: {0}")]
    InvalidLimits(String),
    #[error("group members must share one register type")]
    MixedRegisterTypes,
    #[error("a register group needs at least one mapping")]
    EmptyGroup,
    #[error("a device with slave address {0} is already registered")]
    DuplicateSlave(u8),
}

/// Failure reported by the transport for a single request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("slave exception: {0}")]
    Exception(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("no connection available")]
    NotConnected,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Mismatch between a requested span and the returned payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} value(s), received {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("expected {expected} payload")]
    WrongPayload { expected: &'static str },
}

/// Value cannot be turned into register words for a mapping
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("mapping '{name}' expects a {expected} value")]
    TypeMismatch { name: String, expected: DataType },
    #[error("string of {len} bytes does not fit into {capacity} bytes")]
    StringTooLong { len: usize, capacity: usize },
    #[error("character {0:?} cannot be encoded into a single byte")]
    UnencodableChar(char),
}

/// Cause of a failed group read
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A group read that produced no values, with the failing address range
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "reading {count} {register_type} register(s) from {start} on slave {slave} failed: {source}"
)]
pub struct ReadError {
    pub slave: u8,
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    #[source]
    pub source: ReadFailure,
}

impl ReadError {
    /// True when the failure is a decode defect rather than a transport problem
    pub fn is_decode(&self) -> bool {
        matches!(self.source, ReadFailure::Decode(_))
    }
}

/// Failure of a single-mapping write
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error("no device registered with slave address {0}")]
    UnknownDevice(u8),
    #[error("device has no mapping named '{0}'")]
    UnknownMapping(String),
    #[error("mapping '{name}' targets read-only {register_type} registers")]
    NotWritable {
        name: String,
        register_type: RegisterType,
    },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("write to address {address} on slave {slave} failed: {source}")]
    Transport {
        slave: u8,
        address: u16,
        #[source]
        source: TransportError,
    },
}

/// Lifecycle errors of the polling orchestrator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReaderError {
    #[error("cannot start a reader without registered devices")]
    NoDevices,
    #[error("reader is already running")]
    AlreadyRunning,
    #[error("operation requires a stopped reader")]
    NotStopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
