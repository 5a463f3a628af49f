//! Configuration management for the Modbus reader
//!
//! Configuration is read from a YAML file with `MODBUS_READER__*`
//! environment overrides (e.g. `MODBUS_READER__SERVER__PORT=8080`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::ModbusDevice;
use crate::error::ConfigError;
use crate::group::{SpanLimits, MAX_READ_BITS, MAX_READ_REGISTERS};
use crate::mapping::{ByteOrder, DataType, RegisterMapping, RegisterType, WordOrder};
use crate::modbus::reader::{ReaderSettings, DEFAULT_RECONNECT_DELAYS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Link shared by all devices
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Poll loop tuning
    #[serde(default)]
    pub reader: ReaderConfig,
    /// Slaves on the link
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Tcp(TcpConnection),
    Rtu(RtuConnection),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Tcp(TcpConnection {
            host: "127.0.0.1".to_string(),
            port: 502,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConnection {
    /// Host address
    pub host: String,
    /// Port (default: 502)
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConnection {
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity: "none", "even", "odd"
    #[serde(default = "default_parity")]
    pub parity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Sleep between poll cycles
    pub polling_period_ms: u64,
    /// Timeout of a single request
    pub request_timeout_ms: u64,
    /// Largest holding/input span per request
    pub max_registers: u16,
    /// Largest coil/discrete span per request
    pub max_bits: u16,
    /// Largest hole inside a group
    pub max_gap: Option<u16>,
    /// Delays used one after another while reconnecting fails
    pub reconnect_delays_secs: Vec<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            polling_period_ms: 1000,
            request_timeout_ms: 1000,
            max_registers: MAX_READ_REGISTERS,
            max_bits: MAX_READ_BITS,
            max_gap: None,
            reconnect_delays_secs: DEFAULT_RECONNECT_DELAYS.to_vec(),
        }
    }
}

impl ReaderConfig {
    pub fn settings(&self) -> ReaderSettings {
        ReaderSettings {
            polling_period: Duration::from_millis(self.polling_period_ms),
            reconnect_delays: self
                .reconnect_delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    pub fn limits(&self) -> Result<SpanLimits, ConfigError> {
        let limits = SpanLimits::new(self.max_registers, self.max_bits)?;
        Ok(match self.max_gap {
            Some(gap) => limits.with_max_gap(gap),
            None => limits,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable name
    pub name: String,
    /// Modbus unit ID
    pub slave_address: u8,
    /// Values to read or write
    pub mappings: Vec<MappingConfig>,
}

impl DeviceConfig {
    pub fn build(&self, limits: &SpanLimits) -> Result<ModbusDevice, ConfigError> {
        let mappings = self
            .mappings
            .iter()
            .map(MappingConfig::to_mapping)
            .collect::<Result<Vec<_>, _>>()?;

        ModbusDevice::new(self.name.clone(), self.slave_address, mappings, limits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub name: String,
    /// "holding", "input", "coil", "discrete"
    pub register_type: RegisterType,
    pub address: u16,
    pub data_type: DataType,
    /// Bit of a holding/input register for bool mappings
    #[serde(default)]
    pub bit_index: Option<u8>,
    /// Register count of string mappings
    #[serde(default)]
    pub register_count: Option<u16>,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Character order inside string registers
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Never polled, only written
    #[serde(default)]
    pub write_only: bool,
    #[serde(default)]
    pub deadband: Option<f64>,
    /// Minimum time between reported changes
    #[serde(default)]
    pub frequency_filter_ms: Option<u64>,
    /// Write the last value again after this long without a write
    #[serde(default)]
    pub repeated_write_ms: Option<u64>,
}

impl MappingConfig {
    pub fn to_mapping(&self) -> Result<RegisterMapping, ConfigError> {
        let name = self.name.as_str();
        let mapping = match (self.data_type, self.bit_index, self.register_count) {
            (DataType::String, _, Some(count)) => {
                RegisterMapping::string(name, self.register_type, self.address, count)?
            }
            (DataType::Bool, Some(bit), _) => {
                RegisterMapping::bit(name, self.register_type, self.address, bit)?
            }
            (data_type, Some(_), _) => {
                return Err(ConfigError::InvalidDataType {
                    name: self.name.clone(),
                    register_type: self.register_type,
                    data_type,
                })
            }
            (data_type, None, _) => {
                RegisterMapping::new(name, self.register_type, self.address, data_type)?
            }
        };

        let mut mapping = mapping
            .with_word_order(self.word_order)
            .with_byte_order(self.byte_order);
        if self.write_only {
            mapping = mapping.write_only()?;
        }
        if let Some(deadband) = self.deadband {
            mapping = mapping.with_deadband(deadband)?;
        }
        if let Some(ms) = self.frequency_filter_ms {
            mapping = mapping.with_frequency_filter(Duration::from_millis(ms));
        }
        match self.repeated_write_ms {
            Some(ms) => mapping.with_repeated_write(Duration::from_millis(ms)),
            None => Ok(mapping),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tcp_port() -> u16 {
    502
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

/// Load configuration from file or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("MODBUS_READER_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    if Path::new(&config_path).exists() {
        load_config_from_path(Path::new(&config_path))
    } else {
        tracing::warn!("Config file {} not found, using defaults", config_path);
        Ok(Config::default())
    }
}

/// Load a YAML configuration file with environment overrides
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
        .add_source(
            ::config::Environment::with_prefix("MODBUS_READER")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| "Failed to parse config file")
}

/// Load configuration from a YAML string (used in tests)
#[cfg(test)]
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    serde_yaml::from_str(yaml).with_context(|| "Failed to parse config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert!(config.server.metrics_enabled);
        assert_eq!(config.reader.polling_period_ms, 1000);
        assert_eq!(config.reader.max_registers, 125);
        assert_eq!(config.reader.reconnect_delays_secs.len(), 10);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_parse_tcp_device() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080
connection:
  host: "192.168.1.100"
  port: 502
reader:
  polling_period_ms: 500
devices:
  - name: "meter"
    slave_address: 1
    mappings:
      - name: "temperature"
        register_type: holding
        address: 0
        data_type: i16
        deadband: 0.5
      - name: "energy"
        register_type: input
        address: 10
        data_type: uint32
        word_order: low_first
"#;
        let config = load_config_from_str(yaml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.server.metrics_enabled);
        assert_eq!(config.reader.polling_period_ms, 500);
        assert_eq!(config.reader.request_timeout_ms, 1000);

        match &config.connection {
            ConnectionConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "192.168.1.100");
                assert_eq!(tcp.port, 502);
            }
            _ => panic!("Expected TCP connection"),
        }

        let device = &config.devices[0];
        assert_eq!(device.slave_address, 1);
        assert_eq!(device.mappings.len(), 2);
        assert_eq!(device.mappings[0].data_type, DataType::Int16);
        assert_eq!(device.mappings[0].deadband, Some(0.5));
        assert_eq!(device.mappings[1].word_order, WordOrder::LowFirst);
    }

    #[test]
    fn test_parse_rtu_connection() {
        let yaml = r#"
connection:
  port: "/dev/ttyUSB0"
  baud_rate: 9600
devices: []
"#;
        let config = load_config_from_str(yaml).unwrap();

        match &config.connection {
            ConnectionConfig::Rtu(rtu) => {
                assert_eq!(rtu.port, "/dev/ttyUSB0");
                assert_eq!(rtu.baud_rate, 9600);
                assert_eq!(rtu.data_bits, 8);
                assert_eq!(rtu.stop_bits, 1);
                assert_eq!(rtu.parity, "none");
            }
            _ => panic!("Expected RTU connection"),
        }
    }

    #[test]
    fn test_mapping_variants() {
        let yaml = r#"
devices:
  - name: "plc"
    slave_address: 2
    mappings:
      - name: "alarm"
        register_type: holding
        address: 4
        data_type: bool
        bit_index: 3
      - name: "serial"
        register_type: input
        address: 20
        data_type: string
        register_count: 4
      - name: "setpoint"
        register_type: holding
        address: 30
        data_type: float
        write_only: true
      - name: "relay"
        register_type: coil
        address: 0
        data_type: bool
"#;
        let config = load_config_from_str(yaml).unwrap();
        let device = config.devices[0]
            .build(&config.reader.limits().unwrap())
            .unwrap();

        let alarm = device.mapping("alarm").unwrap();
        assert_eq!(alarm.bit_index(), Some(3));
        assert_eq!(device.mapping("serial").unwrap().register_count(), 4);
        assert!(device.mapping("setpoint").unwrap().is_write_only());
        assert_eq!(device.mapping("relay").unwrap().register_type(), RegisterType::Coil);
        // coil, holding, input; the write-only mapping is not polled
        assert_eq!(device.groups().len(), 3);
    }

    #[test]
    fn test_invalid_mappings_rejected() {
        let mapping = |data_type, bit_index, register_count| MappingConfig {
            name: "m".to_string(),
            register_type: RegisterType::Holding,
            address: 0,
            data_type,
            bit_index,
            register_count,
            word_order: WordOrder::default(),
            byte_order: ByteOrder::default(),
            write_only: false,
            deadband: None,
            frequency_filter_ms: None,
            repeated_write_ms: None,
        };

        assert!(matches!(
            mapping(DataType::String, None, None).to_mapping(),
            Err(ConfigError::MissingRegisterCount { .. })
        ));
        assert!(matches!(
            mapping(DataType::UInt16, Some(2), None).to_mapping(),
            Err(ConfigError::InvalidDataType { .. })
        ));
        assert!(matches!(
            mapping(DataType::Bool, Some(16), None).to_mapping(),
            Err(ConfigError::BitIndexOutOfRange { .. })
        ));

        let mut negative = mapping(DataType::Float, None, None);
        negative.deadband = Some(-1.0);
        assert!(matches!(
            negative.to_mapping(),
            Err(ConfigError::InvalidDeadband { .. })
        ));

        let mut never = mapping(DataType::UInt16, None, None);
        never.repeated_write_ms = Some(0);
        assert!(matches!(
            never.to_mapping(),
            Err(ConfigError::InvalidRepeatedWrite { .. })
        ));
    }

    #[test]
    fn test_mapping_timing_and_byte_order() {
        let yaml = r#"
devices:
  - name: "drive"
    slave_address: 3
    mappings:
      - name: "label"
        register_type: holding
        address: 0
        data_type: string
        register_count: 4
        byte_order: low_first
      - name: "speed"
        register_type: input
        address: 0
        data_type: int16
        deadband: 2.0
        frequency_filter_ms: 1500
      - name: "watchdog"
        register_type: holding
        address: 10
        data_type: uint16
        write_only: true
        repeated_write_ms: 5000
      - name: "status"
        register_type: input
        address: 5
        data_type: uint16
        repeated_write_ms: 5000
"#;
        let config = load_config_from_str(yaml).unwrap();
        let mappings = &config.devices[0].mappings;

        let label = mappings[0].to_mapping().unwrap();
        assert_eq!(label.byte_order(), ByteOrder::LowFirst);
        let speed = mappings[1].to_mapping().unwrap();
        assert_eq!(speed.frequency_filter(), Duration::from_millis(1500));
        assert_eq!(speed.deadband(), 2.0);
        assert_eq!(speed.byte_order(), ByteOrder::HighFirst);
        let watchdog = mappings[2].to_mapping().unwrap();
        assert_eq!(watchdog.repeated_write(), Some(Duration::from_secs(5)));
        assert!(matches!(
            mappings[3].to_mapping(),
            Err(ConfigError::RepeatedWriteReadOnlyRegister { .. })
        ));
    }

    #[test]
    fn test_unknown_data_type_is_parse_error() {
        let yaml = r#"
devices:
  - name: "plc"
    slave_address: 2
    mappings:
      - name: "x"
        register_type: holding
        address: 0
        data_type: double
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_reader_settings_and_limits() {
        let reader = ReaderConfig {
            polling_period_ms: 250,
            max_registers: 60,
            max_gap: Some(4),
            reconnect_delays_secs: vec![2, 4],
            ..ReaderConfig::default()
        };

        let settings = reader.settings();
        assert_eq!(settings.polling_period, Duration::from_millis(250));
        assert_eq!(settings.reconnect_delay(5), Duration::from_secs(4));

        let limits = reader.limits().unwrap();
        assert_eq!(limits.max_registers, 60);
        assert_eq!(limits.max_gap, Some(4));

        let invalid = ReaderConfig {
            max_registers: 200,
            ..ReaderConfig::default()
        };
        assert!(invalid.limits().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 9000
connection:
  host: "10.0.0.5"
reader:
  polling_period_ms: 2000
devices:
  - name: "meter"
    slave_address: 7
    mappings:
      - name: "voltage"
        register_type: holding
        address: 0
        data_type: u16
"#
        )
        .unwrap();

        let config = load_config_from_path(file.path()).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.reader.polling_period_ms, 2000);
        assert_eq!(config.devices[0].slave_address, 7);
        match &config.connection {
            ConnectionConfig::Tcp(tcp) => assert_eq!(tcp.port, 502),
            _ => panic!("Expected TCP connection"),
        }
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "this is not valid yaml: [";
        let result = load_config_from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();

        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.reader.max_bits, config.reader.max_bits);
    }
}
