//! Platform BLE backend abstraction.
//!
//! Everything above this trait is platform-independent; the trait is
//! implemented once over btleplug for real hardware and once as a scripted
//! in-memory backend for tests.

use crate::error::TransportError;
use crate::models::DeviceDescriptor;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
}

/// Asynchronous events pushed up from the platform stack.
///
/// The backend is callback-shaped on every platform, so all completions
/// (reads, writes, RSSI, discovery) arrive here and are correlated back to
/// their requests by the layers above.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// An advertisement was received while scanning.
    Advertisement(DeviceDescriptor),
    /// The platform dropped the link, solicited or not.
    Disconnected { device: String },
    /// Characteristic discovery finished for one service.
    CharacteristicsDiscovered {
        device: String,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A characteristic value arrived, from a read or a notification.
    ValueUpdated {
        device: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// A write-with-response completed.
    WriteCompleted {
        device: String,
        characteristic: Uuid,
        result: Result<(), String>,
    },
    /// An RSSI read completed.
    RssiRead {
        device: String,
        rssi: Result<i16, String>,
    },
}

/// Low-level BLE operations, one implementation per platform stack.
///
/// Calls are issue-only where the underlying APIs are: completions surface
/// as [`BackendEvent`]s on the broadcast channel from [`events`](BleBackend::events).
/// Callers must subscribe *before* issuing the call they want to observe.
#[async_trait]
pub trait BleBackend: Send + Sync {
    async fn adapter_state(&self) -> AdapterState;

    /// Begin scanning; advertisements for devices carrying any of `services`
    /// arrive as [`BackendEvent::Advertisement`]. An empty filter matches all.
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, device: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &str) -> Result<(), TransportError>;

    async fn is_connected(&self, device: &str) -> bool;

    /// Discover primary services, returning their UUIDs directly.
    async fn discover_services(&self, device: &str) -> Result<Vec<Uuid>, TransportError>;

    /// Issue characteristic discovery for one service. Completion arrives as
    /// [`BackendEvent::CharacteristicsDiscovered`].
    async fn discover_characteristics(
        &self,
        device: &str,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Issue a characteristic read. The value arrives as
    /// [`BackendEvent::ValueUpdated`].
    async fn read_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Issue a characteristic write. With `with_response`, completion arrives
    /// as [`BackendEvent::WriteCompleted`]; without, the call returning is
    /// all the confirmation there is.
    async fn write_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Enable notifications; values arrive as [`BackendEvent::ValueUpdated`].
    async fn subscribe(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Issue an RSSI read. Completion arrives as [`BackendEvent::RssiRead`].
    async fn read_rssi(&self, device: &str) -> Result<(), TransportError>;

    fn events(&self) -> broadcast::Receiver<BackendEvent>;
}
