//! Poll loop over all registered devices
//!
//! The reader runs one background task that walks every device and every
//! group in registration order, sleeps for the polling period and repeats.
//! Devices are held weakly; a cycle upgrades them for its own duration only.
//!
//! Registration changes made while the reader is not stopped are queued and
//! applied at the start of the next cycle (or when the reader stops).
//!
//! Mappings with a repeated-write period are written again by the cycle once
//! the period has elapsed since their last write.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ModbusClient, ModbusGroupReader};
use crate::device::{DeviceStatus, ModbusDevice, ValueChange};
use crate::error::{ConfigError, ReaderError, WriteError};
use crate::mapping::Value;
use crate::metrics;

/// Reconnect delays in seconds, used one after another while the link stays down
pub const DEFAULT_RECONNECT_DELAYS: [u64; 10] = [1, 5, 10, 15, 30, 60, 300, 600, 1800, 3600];

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A single cycle requested through `poll_once` is in flight
    Polling,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderState::Stopped => "stopped",
            ReaderState::Starting => "starting",
            ReaderState::Running => "running",
            ReaderState::Stopping => "stopping",
            ReaderState::Polling => "polling",
        };
        write!(f, "{}", s)
    }
}

/// Notification broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    ValueChanged(ValueChange),
    StatusChanged { slave: u8, status: DeviceStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSettings {
    pub polling_period: Duration,
    pub reconnect_delays: Vec<Duration>,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            polling_period: Duration::from_secs(1),
            reconnect_delays: DEFAULT_RECONNECT_DELAYS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl ReaderSettings {
    /// Delay before the next cycle after `attempt` failed reconnects
    pub fn reconnect_delay(&self, attempt: usize) -> Duration {
        self.reconnect_delays
            .get(attempt)
            .or(self.reconnect_delays.last())
            .copied()
            .unwrap_or(self.polling_period)
    }
}

/// Summary of one pass over all devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub devices: usize,
    pub groups_ok: usize,
    pub groups_failed: usize,
    /// Repeated writes performed in the cycle
    pub rewrites: usize,
}

impl CycleReport {
    /// Every request of the cycle failed
    pub fn link_down(&self) -> bool {
        self.groups_ok == 0 && self.groups_failed > 0
    }
}

enum Registration {
    Add(Weak<ModbusDevice>),
    Remove(u8),
}

#[derive(Default)]
struct Registry {
    active: Vec<Weak<ModbusDevice>>,
    pending: Vec<Registration>,
}

impl Registry {
    fn live(&self) -> Vec<Arc<ModbusDevice>> {
        self.active.iter().filter_map(Weak::upgrade).collect()
    }

    /// Slave addresses as they will be once pending changes are applied
    fn effective_slaves(&self) -> Vec<u8> {
        let mut slaves: Vec<u8> = self.live().iter().map(|d| d.slave_address()).collect();
        for registration in &self.pending {
            match registration {
                Registration::Add(device) => {
                    if let Some(device) = device.upgrade() {
                        slaves.push(device.slave_address());
                    }
                }
                Registration::Remove(slave) => slaves.retain(|s| s != slave),
            }
        }
        slaves
    }

    fn apply(&mut self, registration: Registration) {
        match registration {
            Registration::Add(device) => self.active.push(device),
            Registration::Remove(slave) => self
                .active
                .retain(|d| d.upgrade().map_or(false, |d| d.slave_address() != slave)),
        }
    }

    fn apply_pending(&mut self) -> usize {
        let pending = mem::take(&mut self.pending);
        let applied = pending.len();
        for registration in pending {
            self.apply(registration);
        }
        self.active.retain(|d| d.strong_count() > 0);
        applied
    }
}

struct Shared {
    group_reader: ModbusGroupReader,
    settings: ReaderSettings,
    registry: Mutex<Registry>,
    state: watch::Sender<ReaderState>,
    events: broadcast::Sender<ReaderEvent>,
    cycles: watch::Sender<u64>,
}

/// Polling orchestrator for the devices behind one link
pub struct ModbusReader {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusReader {
    pub fn new(client: Arc<dyn ModbusClient>, settings: ReaderSettings) -> Self {
        let (state, _) = watch::channel(ReaderState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cycles, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                group_reader: ModbusGroupReader::new(client),
                settings,
                registry: Mutex::new(Registry::default()),
                state,
                events,
                cycles,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReaderState {
        *self.shared.state.borrow()
    }

    pub fn settings(&self) -> &ReaderSettings {
        &self.shared.settings
    }

    /// Receive value and status change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.shared.events.subscribe()
    }

    /// Number of completed poll cycles, updated after each cycle
    pub fn cycles(&self) -> watch::Receiver<u64> {
        self.shared.cycles.subscribe()
    }

    /// Register a device; the reader keeps only a weak reference.
    ///
    /// Applied immediately when stopped, otherwise at the start of the next
    /// cycle. Slave addresses must be unique.
    pub fn add_device(&self, device: &Arc<ModbusDevice>) -> Result<(), ReaderError> {
        let mut registry = self.shared.registry.lock();
        let slave = device.slave_address();
        if registry.effective_slaves().contains(&slave) {
            return Err(ConfigError::DuplicateSlave(slave).into());
        }

        let registration = Registration::Add(Arc::downgrade(device));
        if self.state() == ReaderState::Stopped {
            registry.apply(registration);
        } else {
            debug!("Queueing registration of slave {}", slave);
            registry.pending.push(registration);
        }
        info!("Registered device {} (slave {})", device.name(), slave);
        Ok(())
    }

    /// Deregister a device by slave address, returning false if it is unknown
    pub fn remove_device(&self, slave: u8) -> bool {
        let mut registry = self.shared.registry.lock();
        if !registry.effective_slaves().contains(&slave) {
            return false;
        }

        if self.state() == ReaderState::Stopped {
            registry.apply(Registration::Remove(slave));
        } else {
            debug!("Queueing removal of slave {}", slave);
            registry.pending.push(Registration::Remove(slave));
        }
        true
    }

    /// Devices currently polled, in registration order
    pub fn devices(&self) -> Vec<Arc<ModbusDevice>> {
        self.shared.registry.lock().live()
    }

    pub fn device(&self, slave: u8) -> Option<Arc<ModbusDevice>> {
        self.devices()
            .into_iter()
            .find(|d| d.slave_address() == slave)
    }

    /// Spawn the poll loop. Must be called within a tokio runtime.
    ///
    /// Fails while a `poll_once` cycle is in flight.
    pub fn start(&self) -> Result<(), ReaderError> {
        let mut task = self.task.lock();
        {
            let registry = self.shared.registry.lock();
            let mut outcome = Ok(());
            self.shared.state.send_if_modified(|state| {
                outcome = match *state {
                    ReaderState::Stopped if registry.live().is_empty() => {
                        Err(ReaderError::NoDevices)
                    }
                    ReaderState::Stopped => Ok(()),
                    ReaderState::Polling => Err(ReaderError::NotStopped),
                    _ => Err(ReaderError::AlreadyRunning),
                };
                if outcome.is_ok() {
                    *state = ReaderState::Starting;
                }
                outcome.is_ok()
            });
            outcome?;
        }

        info!("Starting Modbus reader");
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move { shared.run().await }));
        Ok(())
    }

    /// Interrupt the inter-cycle sleep and wait for the in-flight cycle to finish.
    ///
    /// A stop issued while another one is in progress waits for that one.
    pub async fn stop(&self) {
        let handle = {
            let mut task = self.task.lock();
            let handle = task.take();
            if handle.is_some() {
                self.shared.state.send_replace(ReaderState::Stopping);
            }
            handle
        };
        let Some(handle) = handle else {
            let mut state = self.shared.state.subscribe();
            let _ = state.wait_for(|s| *s != ReaderState::Stopping).await;
            return;
        };

        info!("Stopping Modbus reader");
        if let Err(e) = handle.await {
            error!("Poll task ended abnormally: {}", e);
        }

        let mut registry = self.shared.registry.lock();
        self.shared.state.send_replace(ReaderState::Stopped);
        registry.apply_pending();
        info!("Modbus reader stopped");
    }

    /// Run a single cycle on the caller's task; only allowed while stopped.
    ///
    /// The reader reports `Polling` until the cycle completes or is dropped.
    pub async fn poll_once(&self) -> Result<CycleReport, ReaderError> {
        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == ReaderState::Stopped {
                *state = ReaderState::Polling;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ReaderError::NotStopped);
        }

        let _polling = PollingGuard {
            shared: &self.shared,
        };
        Ok(self.shared.poll_cycle().await)
    }

    /// Write one mapping on the device with the given slave address
    pub async fn write(
        &self,
        slave: u8,
        mapping_name: &str,
        value: &Value,
    ) -> Result<Option<ValueChange>, WriteError> {
        let device = self.device(slave).ok_or(WriteError::UnknownDevice(slave))?;
        let change = self
            .shared
            .group_reader
            .execute_write(&device, mapping_name, value)
            .await?;

        if let Some(change) = &change {
            let _ = self
                .shared
                .events
                .send(ReaderEvent::ValueChanged(change.clone()));
        }
        Ok(change)
    }
}

/// Returns the reader to `Stopped` when a `poll_once` cycle ends
struct PollingGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.shared.registry.lock();
        self.shared.state.send_replace(ReaderState::Stopped);
        registry.apply_pending();
    }
}

impl Drop for ModbusReader {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        self.state.send_if_modified(|state| {
            if *state == ReaderState::Starting {
                *state = ReaderState::Running;
                true
            } else {
                false
            }
        });
        info!(
            "Modbus reader running, polling every {:?}",
            self.settings.polling_period
        );

        let mut state_rx = self.state.subscribe();
        let mut failed_reconnects = 0usize;

        while self.current_state() != ReaderState::Stopping {
            let report = self.poll_cycle().await;

            let delay = if report.link_down() {
                warn!("Every group read failed, reconnecting");
                match self.group_reader.reconnect().await {
                    Ok(()) => {
                        failed_reconnects = 0;
                        self.settings.polling_period
                    }
                    Err(e) => {
                        let delay = self.settings.reconnect_delay(failed_reconnects);
                        failed_reconnects += 1;
                        warn!("Reconnect failed: {}, retrying in {:?}", e, delay);
                        delay
                    }
                }
            } else {
                failed_reconnects = 0;
                self.settings.polling_period
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopping(&mut state_rx) => {}
            }
        }
    }

    fn current_state(&self) -> ReaderState {
        *self.state.borrow()
    }

    /// Apply queued registrations and take strong references for one cycle
    fn begin_cycle(&self) -> Vec<Arc<ModbusDevice>> {
        let mut registry = self.registry.lock();
        let applied = registry.apply_pending();
        if applied > 0 {
            debug!("Applied {} queued registration change(s)", applied);
        }
        registry.live()
    }

    async fn poll_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let devices = self.begin_cycle();
        let mut report = CycleReport {
            devices: devices.len(),
            ..CycleReport::default()
        };

        for device in &devices {
            let groups = device.groups().len();
            let mut failed = 0;
            for index in 0..groups {
                match self.group_reader.execute(device, index).await {
                    Ok(changes) => {
                        report.groups_ok += 1;
                        for change in changes {
                            let _ = self.events.send(ReaderEvent::ValueChanged(change));
                        }
                    }
                    Err(_) => {
                        failed += 1;
                        report.groups_failed += 1;
                    }
                }
            }

            if groups > 0 {
                let status = if failed == groups {
                    DeviceStatus::Offline
                } else {
                    DeviceStatus::Online
                };
                self.update_status(device, status);
            }
            if groups == 0 || failed < groups {
                report.rewrites += self.rewrite_due(device).await;
            }
        }

        metrics::record_active_devices(devices.len());
        metrics::record_poll_cycle(started.elapsed());
        self.cycles.send_modify(|count| *count += 1);
        report
    }

    /// Write again every mapping of the device whose period has elapsed
    async fn rewrite_due(&self, device: &Arc<ModbusDevice>) -> usize {
        let mut written = 0;
        for (name, value) in device.due_rewrites(Instant::now()) {
            match self.group_reader.execute_write(device, &name, &value).await {
                Ok(_) => {
                    debug!("Rewrote {} on slave {}", name, device.slave_address());
                    written += 1;
                }
                Err(e) => warn!(
                    "Repeated write of {} on slave {} failed: {}",
                    name,
                    device.slave_address(),
                    e
                ),
            }
        }
        written
    }

    fn update_status(&self, device: &ModbusDevice, status: DeviceStatus) {
        if !device.set_status(status) {
            return;
        }

        if status == DeviceStatus::Offline {
            warn!(
                "Device {} (slave {}) is offline",
                device.name(),
                device.slave_address()
            );
        } else {
            info!(
                "Device {} (slave {}) is {}",
                device.name(),
                device.slave_address(),
                status
            );
        }
        metrics::record_device_status(device.slave_address(), status == DeviceStatus::Online);
        let _ = self.events.send(ReaderEvent::StatusChanged {
            slave: device.slave_address(),
            status,
        });
    }
}

async fn stopping(state: &mut watch::Receiver<ReaderState>) {
    loop {
        if *state.borrow_and_update() == ReaderState::Stopping {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::group::SpanLimits;
    use crate::mapping::{DataType, RegisterMapping, RegisterType};
    use crate::modbus::MockModbusClient;

    fn device(slave: u8) -> Arc<ModbusDevice> {
        Arc::new(
            ModbusDevice::new(
                format!("dev{}", slave),
                slave,
                vec![
                    RegisterMapping::new("a", RegisterType::Holding, 0, DataType::UInt16)
                        .unwrap(),
                ],
                &SpanLimits::default(),
            )
            .unwrap(),
        )
    }

    fn reader(client: MockModbusClient) -> ModbusReader {
        ModbusReader::new(Arc::new(client), ReaderSettings::default())
    }

    #[test]
    fn test_reconnect_delay_sequence() {
        let settings = ReaderSettings::default();

        assert_eq!(settings.reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(settings.reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(settings.reconnect_delay(9), Duration::from_secs(3600));
        assert_eq!(settings.reconnect_delay(50), Duration::from_secs(3600));

        let empty = ReaderSettings {
            polling_period: Duration::from_millis(250),
            reconnect_delays: vec![],
        };
        assert_eq!(empty.reconnect_delay(0), Duration::from_millis(250));
    }

    #[test]
    fn test_cycle_report_link_down() {
        let report = CycleReport {
            devices: 2,
            groups_ok: 0,
            groups_failed: 3,
            ..CycleReport::default()
        };
        assert!(report.link_down());
        assert!(!CycleReport::default().link_down());
    }

    #[tokio::test]
    async fn test_start_requires_devices() {
        let reader = reader(MockModbusClient::new());

        assert_eq!(reader.start(), Err(ReaderError::NoDevices));
        assert_eq!(reader.state(), ReaderState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_slave_rejected() {
        let reader = reader(MockModbusClient::new());
        let first = device(1);
        let second = device(1);

        reader.add_device(&first).unwrap();
        let err = reader.add_device(&second).unwrap_err();

        assert_eq!(err, ReaderError::Config(ConfigError::DuplicateSlave(1)));
    }

    #[tokio::test]
    async fn test_dropped_device_is_pruned() {
        let reader = reader(MockModbusClient::new());
        let kept = device(1);
        reader.add_device(&kept).unwrap();
        reader.add_device(&device(2)).unwrap();

        let slaves: Vec<u8> = reader.devices().iter().map(|d| d.slave_address()).collect();
        assert_eq!(slaves, vec![1]);
        // the slave address is free again
        reader.add_device(&device(2)).unwrap();
    }

    #[tokio::test]
    async fn test_remove_device_when_stopped() {
        let reader = reader(MockModbusClient::new());
        let dev = device(4);
        reader.add_device(&dev).unwrap();

        assert!(reader.remove_device(4));
        assert!(!reader.remove_device(4));
        assert!(reader.devices().is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_updates_status_and_events() {
        let mut client = MockModbusClient::new();
        client
            .expect_read_holding_registers()
            .returning(|_, _, _| Ok(vec![17]));
        let reader = reader(client);
        let dev = device(1);
        reader.add_device(&dev).unwrap();
        let mut events = reader.subscribe();

        let report = reader.poll_once().await.unwrap();

        assert_eq!(report.groups_ok, 1);
        assert_eq!(dev.value("a"), Some(Value::UInt16(17)));
        assert_eq!(dev.status(), DeviceStatus::Online);
        assert!(matches!(
            events.try_recv().unwrap(),
            ReaderEvent::ValueChanged(ref c) if c.mapping == "a"
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            ReaderEvent::StatusChanged {
                slave: 1,
                status: DeviceStatus::Online
            }
        );
    }

    #[tokio::test]
    async fn test_failed_device_goes_offline() {
        let mut client = MockModbusClient::new();
        client
            .expect_read_holding_registers()
            .returning(|_, _, _| Err(TransportError::Timeout));
        let reader = reader(client);
        let dev = device(1);
        reader.add_device(&dev).unwrap();

        let report = reader.poll_once().await.unwrap();

        assert!(report.link_down());
        assert_eq!(dev.status(), DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_write_to_unknown_device() {
        let reader = reader(MockModbusClient::new());

        let err = reader.write(9, "a", &Value::UInt16(1)).await.unwrap_err();

        assert_eq!(err, WriteError::UnknownDevice(9));
    }
}
