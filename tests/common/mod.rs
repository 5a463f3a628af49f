//! In-memory Modbus link shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use modbus_reader::{ModbusClient, RegisterType, TransportError};

/// Register bank per slave with failure injection
#[derive(Default)]
pub struct FakeClient {
    words: Mutex<HashMap<(u8, RegisterType, u16), u16>>,
    bits: Mutex<HashMap<(u8, RegisterType, u16), bool>>,
    /// Reads starting at these addresses fail with a timeout
    failing: Mutex<HashSet<(u8, RegisterType, u16)>>,
    /// Slaves that never answer
    offline: Mutex<HashSet<u8>>,
    reconnect_fails: Mutex<bool>,
    reconnects: Mutex<Vec<Instant>>,
    /// Time every read takes to answer
    read_delay: Mutex<Duration>,
    requests: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_words(&self, slave: u8, register_type: RegisterType, address: u16, values: &[u16]) {
        let mut words = self.words.lock();
        for (offset, value) in values.iter().enumerate() {
            words.insert((slave, register_type, address + offset as u16), *value);
        }
    }

    pub fn word(&self, slave: u8, register_type: RegisterType, address: u16) -> u16 {
        self.words
            .lock()
            .get(&(slave, register_type, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_bit(&self, slave: u8, register_type: RegisterType, address: u16, value: bool) {
        self.bits.lock().insert((slave, register_type, address), value);
    }

    pub fn bit(&self, slave: u8, register_type: RegisterType, address: u16) -> bool {
        self.bits
            .lock()
            .get(&(slave, register_type, address))
            .copied()
            .unwrap_or(false)
    }

    pub fn fail_reads_at(&self, slave: u8, register_type: RegisterType, address: u16) {
        self.failing.lock().insert((slave, register_type, address));
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
        self.offline.lock().clear();
    }

    pub fn set_offline(&self, slave: u8) {
        self.offline.lock().insert(slave);
    }

    pub fn set_reconnect_fails(&self, fails: bool) {
        *self.reconnect_fails.lock() = fails;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn reconnect_times(&self) -> Vec<Instant> {
        self.reconnects.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn answer_delay(&self) {
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(
        &self,
        slave: u8,
        register_type: RegisterType,
        address: u16,
    ) -> Result<(), TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.lock().contains(&slave)
            || self.failing.lock().contains(&(slave, register_type, address))
        {
            return Err(TransportError::Timeout);
        }
        Ok(())
    }

    async fn read_words(
        &self,
        slave: u8,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.answer_delay().await;
        self.check(slave, register_type, address)?;
        Ok((0..count)
            .map(|offset| self.word(slave, register_type, address + offset))
            .collect())
    }

    async fn read_bits(
        &self,
        slave: u8,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.answer_delay().await;
        self.check(slave, register_type, address)?;
        Ok((0..count)
            .map(|offset| self.bit(slave, register_type, address + offset))
            .collect())
    }
}

#[async_trait]
impl ModbusClient for FakeClient {
    async fn read_coils(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.read_bits(slave, RegisterType::Coil, address, count).await
    }

    async fn read_discrete_inputs(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.read_bits(slave, RegisterType::Discrete, address, count).await
    }

    async fn read_holding_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.read_words(slave, RegisterType::Holding, address, count).await
    }

    async fn read_input_registers(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.read_words(slave, RegisterType::Input, address, count).await
    }

    async fn write_single_register(
        &self,
        slave: u8,
        address: u16,
        word: u16,
    ) -> Result<(), TransportError> {
        self.check(slave, RegisterType::Holding, address)?;
        self.set_words(slave, RegisterType::Holding, address, &[word]);
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        slave: u8,
        address: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        self.check(slave, RegisterType::Holding, address)?;
        self.set_words(slave, RegisterType::Holding, address, words);
        Ok(())
    }

    async fn write_coil(&self, slave: u8, address: u16, bit: bool) -> Result<(), TransportError> {
        self.check(slave, RegisterType::Coil, address)?;
        self.set_bit(slave, RegisterType::Coil, address, bit);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.lock().push(Instant::now());
        if *self.reconnect_fails.lock() {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}
