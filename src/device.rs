//! Per-device value cache and change tracking
//!
//! A [`ModbusDevice`] owns the register groups of one slave together with the
//! last decoded value of every mapping. Slots are locked per group, so a reader
//! never sees a group half-way through an update while unrelated groups stay
//! independent of each other.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ConfigError, ReadError};
use crate::group::{check_address_claims, group_mappings, RegisterGroup, SpanLimits};
use crate::mapping::{RegisterMapping, RegisterType, Value};

/// Result of the most recent read of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadOutcome {
    /// Never read
    Unread,
    Ok,
    /// Last read failed, the cached value is from an earlier read
    Stale,
    /// Last read failed and there is no usable value
    Error,
}

/// Reachability of a device as seen by the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// Value of a mapping that differs from the previously cached one
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    pub slave: u8,
    pub mapping: String,
    pub value: Value,
    pub previous: Option<Value>,
}

/// Point-in-time view of one mapping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingSnapshot {
    pub name: String,
    pub value: Option<Value>,
    pub outcome: ReadOutcome,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct MappingSlot {
    value: Option<Value>,
    outcome: ReadOutcome,
    changed: bool,
    updated_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last reported change or write
    changed_at: Option<Instant>,
}

impl MappingSlot {
    fn new() -> Self {
        Self {
            value: None,
            outcome: ReadOutcome::Unread,
            changed: false,
            updated_at: None,
            changed_at: None,
        }
    }

    /// Store a freshly read value, returning the previous one when it counts as a change.
    ///
    /// A change must clear the deadband and, with a frequency filter, may only
    /// be reported once the filter has elapsed since the last reported change.
    fn store(
        &mut self,
        value: Value,
        mapping: &RegisterMapping,
        now: DateTime<Utc>,
        at: Instant,
    ) -> Option<Option<Value>> {
        let changed = match &self.value {
            None => true,
            Some(previous) => {
                value.differs_from(previous, mapping.deadband())
                    && !self.filtered(mapping.frequency_filter(), at)
            }
        };

        self.outcome = ReadOutcome::Ok;
        self.updated_at = Some(now);

        if changed {
            self.changed = true;
            self.changed_at = Some(at);
            Some(self.value.replace(value))
        } else {
            None
        }
    }

    fn filtered(&self, filter: Duration, at: Instant) -> bool {
        !filter.is_zero() && self.changed_at.is_some_and(|last| at < last + filter)
    }

    /// Store a written value unconditionally; only an exact difference is a change
    fn store_written(
        &mut self,
        value: Value,
        now: DateTime<Utc>,
        at: Instant,
    ) -> Option<Option<Value>> {
        let changed = self
            .value
            .as_ref()
            .map_or(true, |previous| value.differs_from(previous, 0.0));

        self.outcome = ReadOutcome::Ok;
        self.updated_at = Some(now);
        self.changed_at = Some(at);
        let previous = self.value.replace(value);

        if changed {
            self.changed = true;
            Some(previous)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotRef {
    cell: usize,
    slot: usize,
}

/// One Modbus slave with its groups and cached values
#[derive(Debug)]
pub struct ModbusDevice {
    name: String,
    slave_address: u8,
    groups: Vec<RegisterGroup>,
    write_only: Vec<RegisterMapping>,
    /// One cell per group, followed by the cell of write-only mappings
    cells: Vec<RwLock<Vec<MappingSlot>>>,
    index: HashMap<String, SlotRef>,
    status: Mutex<DeviceStatus>,
}

impl ModbusDevice {
    /// Validate the mappings of a slave and build its read groups.
    ///
    /// Write-only mappings are kept for the write path but never grouped.
    pub fn new(
        name: impl Into<String>,
        slave_address: u8,
        mappings: Vec<RegisterMapping>,
        limits: &SpanLimits,
    ) -> Result<Self, ConfigError> {
        check_names(&mappings)?;
        check_address_claims(&mappings)?;

        let (write_only, readable): (Vec<RegisterMapping>, Vec<RegisterMapping>) =
            mappings.into_iter().partition(|m| m.is_write_only());
        let groups = group_mappings(&readable, limits)?;

        let mut index = HashMap::new();
        let mut cells = Vec::with_capacity(groups.len() + 1);
        for (cell, group) in groups.iter().enumerate() {
            for (slot, mapping) in group.mappings().iter().enumerate() {
                index.insert(mapping.name().to_string(), SlotRef { cell, slot });
            }
            cells.push(RwLock::new(vec![MappingSlot::new(); group.len()]));
        }
        for (slot, mapping) in write_only.iter().enumerate() {
            index.insert(
                mapping.name().to_string(),
                SlotRef {
                    cell: groups.len(),
                    slot,
                },
            );
        }
        cells.push(RwLock::new(vec![MappingSlot::new(); write_only.len()]));

        Ok(Self {
            name: name.into(),
            slave_address,
            groups,
            write_only,
            cells,
            index,
            status: Mutex::new(DeviceStatus::Unknown),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    /// Look up a mapping by name, including write-only ones
    pub fn mapping(&self, name: &str) -> Option<&RegisterMapping> {
        let slot_ref = self.index.get(name)?;
        match self.groups.get(slot_ref.cell) {
            Some(group) => group.mappings().get(slot_ref.slot),
            None => self.write_only.get(slot_ref.slot),
        }
    }

    /// All mappings, grouped ones first in group order
    pub fn mappings(&self) -> impl Iterator<Item = &RegisterMapping> {
        self.groups
            .iter()
            .flat_map(|g| g.mappings().iter())
            .chain(self.write_only.iter())
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }

    /// Update the status, returning true if it changed
    pub fn set_status(&self, status: DeviceStatus) -> bool {
        let mut current = self.status.lock();
        if *current == status {
            return false;
        }
        *current = status;
        true
    }

    /// Publish the decoded values of a group, one per member in member order.
    ///
    /// All slots of the group are updated under a single lock hold.
    pub fn apply_group_result(&self, group_index: usize, values: Vec<Value>) -> Vec<ValueChange> {
        let (Some(group), Some(cell)) = (self.groups.get(group_index), self.cells.get(group_index))
        else {
            return Vec::new();
        };
        if values.len() != group.len() {
            return Vec::new();
        }

        let now = Utc::now();
        let at = Instant::now();
        let mut slots = cell.write();
        let mut changes = Vec::new();
        for ((slot, mapping), value) in slots.iter_mut().zip(group.mappings()).zip(values) {
            if let Some(previous) = slot.store(value.clone(), mapping, now, at) {
                changes.push(ValueChange {
                    slave: self.slave_address,
                    mapping: mapping.name().to_string(),
                    value,
                    previous,
                });
            }
        }
        changes
    }

    /// Mark every member of a failed group, keeping last good values
    pub fn apply_group_error(&self, group_index: usize, error: &ReadError) {
        let Some(cell) = self.cells.get(group_index).filter(|_| group_index < self.groups.len())
        else {
            return;
        };

        let mut slots = cell.write();
        for slot in slots.iter_mut() {
            slot.outcome = if slot.value.is_some() && !error.is_decode() {
                ReadOutcome::Stale
            } else {
                ReadOutcome::Error
            };
        }
    }

    /// Record a value that was successfully written to the device.
    ///
    /// The write restarts the repeated-write period of the mapping.
    pub fn apply_write(&self, mapping_name: &str, value: Value) -> Option<ValueChange> {
        let slot_ref = *self.index.get(mapping_name)?;
        let mut slots = self.cells[slot_ref.cell].write();
        let slot = slots.get_mut(slot_ref.slot)?;

        slot.store_written(value.clone(), Utc::now(), Instant::now())
            .map(|previous| ValueChange {
                slave: self.slave_address,
                mapping: mapping_name.to_string(),
                value,
                previous,
            })
    }

    /// Mappings whose repeated-write period has elapsed, with the value to write again.
    ///
    /// Only mappings holding a value are due, and the period counts from the
    /// last write or reported change.
    pub fn due_rewrites(&self, now: Instant) -> Vec<(String, Value)> {
        let mut due = Vec::new();
        for mapping in self.mappings() {
            let Some(period) = mapping.repeated_write() else {
                continue;
            };
            let Some(slot_ref) = self.index.get(mapping.name()) else {
                continue;
            };
            let slots = self.cells[slot_ref.cell].read();
            let Some(slot) = slots.get(slot_ref.slot) else {
                continue;
            };
            if let (Some(value), Some(last)) = (&slot.value, slot.changed_at) {
                if last + period <= now {
                    due.push((mapping.name().to_string(), value.clone()));
                }
            }
        }
        due
    }

    /// Cached value and outcome of a mapping, `None` for unknown names
    pub fn get_value(&self, mapping_name: &str) -> Option<(Option<Value>, ReadOutcome)> {
        let slot_ref = self.index.get(mapping_name)?;
        let slots = self.cells[slot_ref.cell].read();
        slots
            .get(slot_ref.slot)
            .map(|slot| (slot.value.clone(), slot.outcome))
    }

    /// Cached value of a mapping, if one has been read
    pub fn value(&self, mapping_name: &str) -> Option<Value> {
        self.get_value(mapping_name).and_then(|(value, _)| value)
    }

    /// True once after a mapping's value changed; observing resets the flag
    pub fn has_changed(&self, mapping_name: &str) -> bool {
        let Some(slot_ref) = self.index.get(mapping_name) else {
            return false;
        };
        let mut slots = self.cells[slot_ref.cell].write();
        match slots.get_mut(slot_ref.slot) {
            Some(slot) => std::mem::take(&mut slot.changed),
            None => false,
        }
    }

    pub fn snapshot_of(&self, mapping_name: &str) -> Option<MappingSnapshot> {
        let slot_ref = self.index.get(mapping_name)?;
        let slots = self.cells[slot_ref.cell].read();
        slots.get(slot_ref.slot).map(|slot| MappingSnapshot {
            name: mapping_name.to_string(),
            value: slot.value.clone(),
            outcome: slot.outcome,
            updated_at: slot.updated_at,
        })
    }

    /// Consistent view of one group
    pub fn group_snapshot(&self, group_index: usize) -> Option<Vec<MappingSnapshot>> {
        let group = self.groups.get(group_index)?;
        let slots = self.cells[group_index].read();
        Some(snapshot_slots(group.mappings(), &slots))
    }

    /// View of every mapping; each group is consistent on its own
    pub fn snapshot(&self) -> Vec<MappingSnapshot> {
        let mut all = Vec::with_capacity(self.index.len());
        for (index, group) in self.groups.iter().enumerate() {
            let slots = self.cells[index].read();
            all.extend(snapshot_slots(group.mappings(), &slots));
        }
        let slots = self.cells[self.groups.len()].read();
        all.extend(snapshot_slots(&self.write_only, &slots));
        all
    }
}

fn snapshot_slots(mappings: &[RegisterMapping], slots: &[MappingSlot]) -> Vec<MappingSnapshot> {
    mappings
        .iter()
        .zip(slots)
        .map(|(mapping, slot)| MappingSnapshot {
            name: mapping.name().to_string(),
            value: slot.value.clone(),
            outcome: slot.outcome,
            updated_at: slot.updated_at,
        })
        .collect()
}

fn check_names(mappings: &[RegisterMapping]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for mapping in mappings {
        if !seen.insert(mapping.name()) {
            return Err(ConfigError::DuplicateName(mapping.name().to_string()));
        }
    }
    Ok(())
}
