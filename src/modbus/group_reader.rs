//! Execution of single group reads and single mapping writes
//!
//! Every transport call goes through one link lock, so polling and
//! application writes never interleave on the wire.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ModbusClient;
use crate::codec;
use crate::device::{ModbusDevice, ValueChange};
use crate::error::{ReadError, ReadFailure, TransportError, WriteError};
use crate::mapping::{RegisterType, Value};
use crate::metrics::{self, ReadMetrics};

/// Issues group reads and mapping writes over one shared link
pub struct ModbusGroupReader {
    client: Arc<dyn ModbusClient>,
    link: Mutex<()>,
}

impl ModbusGroupReader {
    pub fn new(client: Arc<dyn ModbusClient>) -> Self {
        Self {
            client,
            link: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<dyn ModbusClient> {
        &self.client
    }

    /// Read one group of `device` and publish the outcome on the device.
    ///
    /// Failures are recorded on the device and returned; they never panic or
    /// affect other groups.
    pub async fn execute(
        &self,
        device: &ModbusDevice,
        group_index: usize,
    ) -> Result<Vec<ValueChange>, ReadError> {
        let Some(group) = device.groups().get(group_index) else {
            return Ok(Vec::new());
        };
        let slave = device.slave_address();

        debug!(
            "Reading {} {} register(s) from {} on slave {}",
            group.register_count(),
            group.register_type(),
            group.start_address(),
            slave
        );

        let timer = ReadMetrics::start(slave, group.register_type());
        let result = {
            let _link = self.link.lock().await;
            group.read(self.client.as_ref(), slave).await
        };

        match result {
            Ok(values) => {
                timer.success(values.len());
                let changes = device.apply_group_result(group_index, values);
                for change in &changes {
                    info!(
                        "Device {} mapping {} = {}",
                        device.name(),
                        change.mapping,
                        change.value
                    );
                }
                Ok(changes)
            }
            Err(err) => {
                match &err.source {
                    ReadFailure::Decode(_) => {
                        timer.failure("decode");
                        error!("Device {}: {}", device.name(), err);
                    }
                    ReadFailure::Transport(source) => {
                        timer.failure(transport_error_label(source));
                        warn!("Device {}: {}", device.name(), err);
                    }
                }
                device.apply_group_error(group_index, &err);
                Err(err)
            }
        }
    }

    /// Write one mapping of `device`.
    ///
    /// Only the registers of that mapping are touched. A bit inside a holding
    /// register is written by reading the register and writing it back with
    /// the bit updated, both under one link lock hold. On success the cached
    /// value is updated and the resulting change, if any, is returned.
    pub async fn execute_write(
        &self,
        device: &ModbusDevice,
        mapping_name: &str,
        value: &Value,
    ) -> Result<Option<ValueChange>, WriteError> {
        let mapping = device
            .mapping(mapping_name)
            .ok_or_else(|| WriteError::UnknownMapping(mapping_name.to_string()))?;
        let slave = device.slave_address();
        let address = mapping.address();
        let transport = |source: TransportError| WriteError::Transport {
            slave,
            address,
            source,
        };

        let words = match mapping.register_type() {
            RegisterType::Coil | RegisterType::Holding => codec::encode_value(mapping, value)?,
            register_type => {
                return Err(WriteError::NotWritable {
                    name: mapping_name.to_string(),
                    register_type,
                })
            }
        };

        let result = {
            let _link = self.link.lock().await;
            match (mapping.register_type(), mapping.bit_index(), value) {
                (RegisterType::Coil, _, _) => {
                    let bit = words.first().map_or(false, |word| *word != 0);
                    self.client.write_coil(slave, address, bit).await
                }
                (_, Some(bit_index), Value::Bool(bit)) => {
                    self.write_bit(slave, address, bit_index, *bit).await
                }
                _ if words.len() == 1 => {
                    self.client
                        .write_single_register(slave, address, words[0])
                        .await
                }
                _ => {
                    self.client
                        .write_multiple_registers(slave, address, &words)
                        .await
                }
            }
        };

        metrics::record_write(slave, result.is_ok());
        result.map_err(transport)?;

        info!(
            "Wrote {} to mapping {} on device {}",
            value,
            mapping_name,
            device.name()
        );
        Ok(device.apply_write(mapping_name, value.clone()))
    }

    /// Re-establish the link, waiting for any in-flight request first
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let _link = self.link.lock().await;
        let result = self.client.reconnect().await;
        metrics::record_reconnect(result.is_ok());
        result
    }

    /// Read-modify-write of a single bit; caller holds the link lock
    async fn write_bit(
        &self,
        slave: u8,
        address: u16,
        bit_index: u8,
        bit: bool,
    ) -> Result<(), TransportError> {
        let current = self
            .client
            .read_holding_registers(slave, address, 1)
            .await?;
        let word = current
            .first()
            .copied()
            .ok_or_else(|| TransportError::Io("empty register response".to_string()))?;

        self.client
            .write_single_register(slave, address, codec::with_bit(word, bit_index, bit))
            .await
    }
}

fn transport_error_label(err: &TransportError) -> &'static str {
    match err {
        TransportError::Timeout => "timeout",
        TransportError::Exception(_) => "exception",
        TransportError::Io(_) => "io",
        TransportError::NotConnected => "not_connected",
    }
}
