//! btleplug-backed implementation of [`BleBackend`].
//!
//! One pump task translates adapter-level events (advertisements, link
//! drops); a per-connection pump task translates characteristic
//! notifications. Request completions that btleplug exposes as direct
//! return values are re-emitted as [`BackendEvent`]s so the engine above
//! sees the same callback-shaped surface on every platform.

use crate::error::TransportError;
use crate::models::DeviceDescriptor;
use crate::platform::{AdapterState, BackendEvent, BleBackend};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

pub struct BtleBackend {
    adapter: Adapter,
    // peripherals we have connected to, by platform id string
    peripherals: Mutex<HashMap<String, Peripheral>>,
    tx: broadcast::Sender<BackendEvent>,
}

impl BtleBackend {
    /// Bind to the first Bluetooth adapter and start the event pump.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bluetooth manager: {e}")))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("adapter enumeration: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed("no bluetooth adapter".into()))?;

        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self::spawn_adapter_pump(adapter.clone(), tx.clone()).await?;

        Ok(Self {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            tx,
        })
    }

    async fn spawn_adapter_pump(
        adapter: Adapter,
        tx: broadcast::Sender<BackendEvent>,
    ) -> Result<(), TransportError> {
        let mut events = adapter
            .events()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("adapter events: {e}")))?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        let _ = tx.send(BackendEvent::Advertisement(DeviceDescriptor {
                            id: id.to_string(),
                            name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                            rssi: props.rssi.unwrap_or(0),
                            services: props.services,
                        }));
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        debug!(device = %id, "link dropped");
                        let _ = tx.send(BackendEvent::Disconnected {
                            device: id.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    async fn peripheral(&self, device: &str) -> Result<Peripheral, TransportError> {
        if let Some(p) = self.peripherals.lock().unwrap().get(device).cloned() {
            return Ok(p);
        }
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("peripheral lookup: {e}")))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("unknown device {device}")))
    }

    async fn characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;
        Ok((peripheral, found))
    }

    fn spawn_notification_pump(&self, device: &str, peripheral: Peripheral) {
        let tx = self.tx.clone();
        let device = device.to_string();
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(device = %device, "notification stream unavailable: {e}");
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_else(Uuid::nil);
                let _ = tx.send(BackendEvent::ValueUpdated {
                    device: device.clone(),
                    service,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
    }
}

#[async_trait]
impl BleBackend for BtleBackend {
    async fn adapter_state(&self) -> AdapterState {
        // btleplug has no portable power query; holding an adapter is the
        // closest observable signal.
        AdapterState::PoweredOn
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("scan start: {e}")))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("scan stop: {e}")))
    }

    async fn connect(&self, device: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.spawn_notification_pump(device, peripheral.clone());
        self.peripherals
            .lock()
            .unwrap()
            .insert(device.to_string(), peripheral);
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.peripherals.lock().unwrap().remove(device);
        Ok(())
    }

    async fn is_connected(&self, device: &str) -> bool {
        match self.peripheral(device).await {
            Ok(p) => p.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn discover_services(&self, device: &str) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.peripheral(device).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("service discovery: {e}")))?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        device: &str,
        service: Uuid,
    ) -> Result<(), TransportError> {
        // btleplug discovers characteristics together with services, so this
        // only re-emits the per-service completion the engine waits on.
        let peripheral = self.peripheral(device).await?;
        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .map(|c| c.uuid)
            .collect();
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
        let (peripheral, target) = self.characteristic(device, service, characteristic).await?;
        let value = peripheral
            .read(&target)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let _ = self.tx.send(BackendEvent::ValueUpdated {
            device: device.to_string(),
            service,
            characteristic,
            value,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(device, service, characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&target, value, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
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
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (peripheral, target) = self.characteristic(device, service, characteristic).await?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    async fn read_rssi(&self, device: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let rssi = match peripheral.properties().await {
            Ok(Some(props)) => Ok(props.rssi.unwrap_or(0)),
            Ok(None) => Err("no peripheral properties".to_string()),
            Err(e) => Err(e.to_string()),
        };
        let _ = self.tx.send(BackendEvent::RssiRead {
            device: device.to_string(),
            rssi,
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.tx.subscribe()
    }
}
