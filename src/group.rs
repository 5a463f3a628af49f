//! Register groups and the grouping algorithm
//!
//! A group is a set of mappings of one register type that are fetched with a
//! single read request. [`group_mappings`] packs the mappings of a device into
//! the fewest groups whose span stays within the request limit.

use std::collections::HashMap;
use std::ops::Range;

use crate::codec;
use crate::error::{ConfigError, DecodeError, ReadError, ReadFailure};
use crate::mapping::{RegisterMapping, RegisterType, Value};
use crate::modbus::ModbusClient;

/// Protocol ceiling for one holding/input register read
pub const MAX_READ_REGISTERS: u16 = 125;

/// Protocol ceiling for one coil/discrete input read
pub const MAX_READ_BITS: u16 = 2000;

/// Protocol ceiling for one multiple-register write
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Span limits applied when grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanLimits {
    /// Largest holding/input span per request
    pub max_registers: u16,
    /// Largest coil/discrete span per request
    pub max_bits: u16,
    /// Largest unused hole inside a group, `None` for no limit
    pub max_gap: Option<u16>,
}

impl Default for SpanLimits {
    fn default() -> Self {
        Self {
            max_registers: MAX_READ_REGISTERS,
            max_bits: MAX_READ_BITS,
            max_gap: None,
        }
    }
}

impl SpanLimits {
    /// Limits for devices that accept fewer values per request
    pub fn new(max_registers: u16, max_bits: u16) -> Result<Self, ConfigError> {
        let limits = Self {
            max_registers,
            max_bits,
            max_gap: None,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn with_max_gap(mut self, max_gap: u16) -> Self {
        self.max_gap = Some(max_gap);
        self
    }

    pub fn max_span(&self, register_type: RegisterType) -> u16 {
        if register_type.is_bit_addressed() {
            self.max_bits
        } else {
            self.max_registers
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_registers == 0 || self.max_registers > MAX_READ_REGISTERS {
            return Err(ConfigError::InvalidLimits(format!(
                "max_registers must be within 1..={}, got {}",
                MAX_READ_REGISTERS, self.max_registers
            )));
        }
        if self.max_bits == 0 || self.max_bits > MAX_READ_BITS {
            return Err(ConfigError::InvalidLimits(format!(
                "max_bits must be within 1..={}, got {}",
                MAX_READ_BITS, self.max_bits
            )));
        }
        Ok(())
    }
}

/// Raw payload of a group read
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterData {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl RegisterData {
    pub fn len(&self) -> usize {
        match self {
            RegisterData::Bits(bits) => bits.len(),
            RegisterData::Words(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mappings of one register type satisfied by one contiguous read
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterGroup {
    register_type: RegisterType,
    start_address: u16,
    register_count: u16,
    mappings: Vec<RegisterMapping>,
}

impl RegisterGroup {
    /// Build a group from mappings of one register type.
    ///
    /// Members are ordered by address; they must not claim the same
    /// register and the span is checked against the protocol ceiling of the
    /// register type.
    pub fn new(
        register_type: RegisterType,
        mut mappings: Vec<RegisterMapping>,
    ) -> Result<Self, ConfigError> {
        if mappings.is_empty() {
            return Err(ConfigError::EmptyGroup);
        }
        if mappings.iter().any(|m| m.register_type() != register_type) {
            return Err(ConfigError::MixedRegisterTypes);
        }
        check_address_claims(&mappings)?;

        mappings.sort_by_key(|m| m.address());
        let span = span_of(&mappings);
        let max_span = SpanLimits::default().max_span(register_type);
        if span.end - span.start > u32::from(max_span) {
            return Err(ConfigError::GroupTooWide {
                register_type,
                span: span.end - span.start,
                max_span,
            });
        }

        Ok(Self::from_sorted(register_type, mappings))
    }

    /// Members must be sorted by address and fit in a request
    fn from_sorted(register_type: RegisterType, mappings: Vec<RegisterMapping>) -> Self {
        let span = span_of(&mappings);
        Self {
            register_type,
            start_address: span.start as u16,
            register_count: (span.end - span.start) as u16,
            mappings,
        }
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn register_count(&self) -> u16 {
        self.register_count
    }

    /// `[start, start + count)` as wide integers
    pub fn span(&self) -> Range<u32> {
        let start = u32::from(self.start_address);
        start..start + u32::from(self.register_count)
    }

    pub fn mappings(&self) -> &[RegisterMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Slice the payload of a group read into one value per member, in member order
    pub fn decode(&self, data: &RegisterData) -> Result<Vec<Value>, DecodeError> {
        let expected = usize::from(self.register_count);
        if data.len() != expected {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }

        self.mappings
            .iter()
            .map(|mapping| {
                let offset = usize::from(mapping.address() - self.start_address);
                let range = offset..offset + usize::from(mapping.register_count());
                match (data, self.register_type.is_bit_addressed()) {
                    (RegisterData::Bits(bits), true) => codec::decode_bits(&bits[range]),
                    (RegisterData::Words(words), false) => {
                        codec::decode_words(mapping, &words[range])
                    }
                    (_, true) => Err(DecodeError::WrongPayload { expected: "bit" }),
                    (_, false) => Err(DecodeError::WrongPayload {
                        expected: "register word",
                    }),
                }
            })
            .collect()
    }

    /// Issue one request for the whole span and decode the result.
    ///
    /// Either every member gets a value or none does.
    pub async fn read(
        &self,
        client: &dyn ModbusClient,
        slave: u8,
    ) -> Result<Vec<Value>, ReadError> {
        let start = self.start_address;
        let count = self.register_count;

        let data = match self.register_type {
            RegisterType::Coil => client
                .read_coils(slave, start, count)
                .await
                .map(RegisterData::Bits),
            RegisterType::Discrete => client
                .read_discrete_inputs(slave, start, count)
                .await
                .map(RegisterData::Bits),
            RegisterType::Holding => client
                .read_holding_registers(slave, start, count)
                .await
                .map(RegisterData::Words),
            RegisterType::Input => client
                .read_input_registers(slave, start, count)
                .await
                .map(RegisterData::Words),
        }
        .map_err(|e| self.read_error(slave, e.into()))?;

        self.decode(&data).map_err(|e| self.read_error(slave, e.into()))
    }

    fn read_error(&self, slave: u8, source: ReadFailure) -> ReadError {
        ReadError {
            slave,
            register_type: self.register_type,
            start: self.start_address,
            count: self.register_count,
            source,
        }
    }
}

/// Reject mappings claiming the same register. Bit mappings may share a
/// register as long as their bit indexes differ and no whole-register
/// mapping overlaps it.
pub(crate) fn check_address_claims(mappings: &[RegisterMapping]) -> Result<(), ConfigError> {
    let mut claims: HashMap<(RegisterType, u16), Vec<(&str, Option<u8>)>> = HashMap::new();

    for mapping in mappings {
        let start = u32::from(mapping.address());
        for address in start..mapping.end_address() {
            let address = address as u16;
            let entry = claims.entry((mapping.register_type(), address)).or_default();
            let conflict = entry.iter().find(|(_, bit)| match (bit, mapping.bit_index()) {
                (Some(existing), Some(new)) => *existing == new,
                _ => true,
            });
            if let Some((other, _)) = conflict {
                return Err(ConfigError::AddressConflict {
                    name: mapping.name().to_string(),
                    other: other.to_string(),
                    register_type: mapping.register_type(),
                    address,
                });
            }
            entry.push((mapping.name(), mapping.bit_index()));
        }
    }
    Ok(())
}

fn span_of(mappings: &[RegisterMapping]) -> Range<u32> {
    let start = mappings
        .iter()
        .map(|m| u32::from(m.address()))
        .min()
        .unwrap_or(0);
    let end = mappings.iter().map(|m| m.end_address()).max().unwrap_or(start);
    start..end
}

/// Partition the mappings of one device into the fewest groups.
///
/// Each register type is handled on its own, in the order coil, discrete,
/// holding, input. Within a type mappings are sorted by address (stable for
/// equal addresses) and a group is extended for as long as the span from its
/// first address to the candidate's end stays within the limit. Bit mappings
/// sharing a register count as one address.
pub fn group_mappings(
    mappings: &[RegisterMapping],
    limits: &SpanLimits,
) -> Result<Vec<RegisterGroup>, ConfigError> {
    limits.validate()?;

    let mut groups = Vec::new();
    for register_type in [
        RegisterType::Coil,
        RegisterType::Discrete,
        RegisterType::Holding,
        RegisterType::Input,
    ] {
        let mut members: Vec<&RegisterMapping> = mappings
            .iter()
            .filter(|m| m.register_type() == register_type)
            .collect();
        members.sort_by_key(|m| m.address());

        let max_span = limits.max_span(register_type);
        if let Some(wide) = members
            .iter()
            .find(|m| m.register_count() > max_span)
        {
            return Err(ConfigError::MappingTooWide {
                name: wide.name().to_string(),
                count: wide.register_count(),
                max_span,
            });
        }

        let mut current: Vec<RegisterMapping> = Vec::new();
        let mut start = 0u32;
        let mut end = 0u32;
        for mapping in members {
            if !current.is_empty() {
                let fits_span = mapping.end_address().max(end) - start <= u32::from(max_span);
                let fits_gap = limits
                    .max_gap
                    .map_or(true, |gap| u32::from(mapping.address()) <= end + u32::from(gap));
                if fits_span && fits_gap {
                    end = end.max(mapping.end_address());
                    current.push(mapping.clone());
                    continue;
                }
                groups.push(RegisterGroup::from_sorted(
                    register_type,
                    std::mem::take(&mut current),
                ));
            }
            start = u32::from(mapping.address());
            end = mapping.end_address();
            current.push(mapping.clone());
        }
        if !current.is_empty() {
            groups.push(RegisterGroup::from_sorted(register_type, current));
        }
    }

    Ok(groups)
}
