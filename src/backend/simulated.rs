//! Scriptable in-memory backend for tests.
//!
//! Mirrors the event-driven shape of the real platform stacks: issue-only
//! calls complete by emitting [`BackendEvent`]s on the broadcast channel.
//! Tests script the peripheral side (devices, characteristic values,
//! notifications, link drops) and drive the engine above unchanged.

use crate::error::TransportError;
use crate::models::DeviceDescriptor;
use crate::platform::{AdapterState, BackendEvent, BleBackend};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct SimDevice {
    descriptor: Option<DeviceDescriptor>,
    // service -> characteristic -> readable value (None: never responds)
    services: HashMap<Uuid, HashMap<Uuid, Option<Vec<u8>>>>,
}

pub struct SimulatedBackend {
    powered: AtomicBool,
    fail_rssi: AtomicBool,
    fail_discovery: AtomicBool,
    devices: Mutex<HashMap<String, SimDevice>>,
    connected: Mutex<HashSet<String>>,
    written: Mutex<Vec<(Uuid, Vec<u8>)>>,
    tx: broadcast::Sender<BackendEvent>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            powered: AtomicBool::new(true),
            fail_rssi: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
            devices: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
            tx,
        }
    }

    pub fn set_powered(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
    }

    /// Make subsequent RSSI reads complete with an error.
    pub fn set_rssi_failing(&self, failing: bool) {
        self.fail_rssi.store(failing, Ordering::SeqCst);
    }

    /// Make service discovery fail while the link itself connects fine.
    pub fn set_discovery_failing(&self, failing: bool) {
        self.fail_discovery.store(failing, Ordering::SeqCst);
    }

    /// Script a peripheral. Its advertised services come from the descriptor.
    pub fn add_device(&self, descriptor: DeviceDescriptor) {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices.entry(descriptor.id.clone()).or_default();
        for service in &descriptor.services {
            entry.services.entry(*service).or_default();
        }
        entry.descriptor = Some(descriptor);
    }

    /// Script a characteristic with no readable value (reads never respond).
    pub fn add_characteristic(&self, device: &str, service: Uuid, characteristic: Uuid) {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(device.to_string())
            .or_default()
            .services
            .entry(service)
            .or_default()
            .insert(characteristic, None);
    }

    /// Script the value a characteristic read will return.
    pub fn set_value(&self, device: &str, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(device.to_string())
            .or_default()
            .services
            .entry(service)
            .or_default()
            .insert(characteristic, Some(value));
    }

    /// Push a notification from the peripheral side.
    pub fn notify(&self, device: &str, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let _ = self.tx.send(BackendEvent::ValueUpdated {
            device: device.to_string(),
            service,
            characteristic,
            value,
        });
    }

    /// Drop the link from the peripheral side.
    pub fn drop_connection(&self, device: &str) {
        self.connected.lock().unwrap().remove(device);
        let _ = self.tx.send(BackendEvent::Disconnected {
            device: device.to_string(),
        });
    }

    /// Every write issued so far, as (characteristic, value) pairs.
    pub fn written(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.written.lock().unwrap().clone()
    }

    fn powered_on(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleBackend for SimulatedBackend {
    async fn adapter_state(&self) -> AdapterState {
        if self.powered_on() {
            AdapterState::PoweredOn
        } else {
            AdapterState::PoweredOff
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        if !self.powered_on() {
            return Err(TransportError::ConnectionFailed("adapter powered off".into()));
        }
        let devices = self.devices.lock().unwrap();
        for device in devices.values() {
            let Some(descriptor) = &device.descriptor else {
                continue;
            };
            let matches = services.is_empty()
                || descriptor.services.iter().any(|s| services.contains(s));
            if matches {
                let _ = self.tx.send(BackendEvent::Advertisement(descriptor.clone()));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, device: &str) -> Result<(), TransportError> {
        if !self.powered_on() {
            return Err(TransportError::ConnectionFailed("adapter powered off".into()));
        }
        if !self.devices.lock().unwrap().contains_key(device) {
            return Err(TransportError::ConnectionFailed(format!(
                "unknown device {device}"
            )));
        }
        self.connected.lock().unwrap().insert(device.to_string());
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        if self.connected.lock().unwrap().remove(device) {
            let _ = self.tx.send(BackendEvent::Disconnected {
                device: device.to_string(),
            });
        }
        Ok(())
    }

    async fn is_connected(&self, device: &str) -> bool {
        self.connected.lock().unwrap().contains(device)
    }

    async fn discover_services(&self, device: &str) -> Result<Vec<Uuid>, TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "service discovery failed".into(),
            ));
        }
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .get(device)
            .map(|d| d.services.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn discover_characteristics(
        &self,
        device: &str,
        service: Uuid,
    ) -> Result<(), TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        let characteristics = {
            let devices = self.devices.lock().unwrap();
            devices
                .get(device)
                .and_then(|d| d.services.get(&service))
                .map(|chars| chars.keys().copied().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        let _ = self.tx.send(BackendEvent::CharacteristicsDiscovered {
            device: device.to_string(),
            service,
            characteristics,
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        let value = {
            let devices = self.devices.lock().unwrap();
            devices
                .get(device)
                .and_then(|d| d.services.get(&service))
                .and_then(|chars| chars.get(&characteristic))
                .cloned()
                .flatten()
        };
        // a scripted characteristic without a value simply never responds
        if let Some(value) = value {
            let _ = self.tx.send(BackendEvent::ValueUpdated {
                device: device.to_string(),
                service,
                characteristic,
                value,
            });
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device: &str,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        self.written
            .lock()
            .unwrap()
            .push((characteristic, value.to_vec()));
        if with_response {
            let _ = self.tx.send(BackendEvent::WriteCompleted {
                device: device.to_string(),
                characteristic,
                result: Ok(()),
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn read_rssi(&self, device: &str) -> Result<(), TransportError> {
        if !self.is_connected(device).await {
            return Err(TransportError::NotConnected);
        }
        let result = if self.fail_rssi.load(Ordering::SeqCst) {
            Err("rssi read failed".to_string())
        } else {
            let devices = self.devices.lock().unwrap();
            Ok(devices
                .get(device)
                .and_then(|d| d.descriptor.as_ref())
                .map(|desc| desc.rssi)
                .unwrap_or(0))
        };
        let _ = self.tx.send(BackendEvent::RssiRead {
            device: device.to_string(),
            rssi: result,
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.tx.subscribe()
    }
}
