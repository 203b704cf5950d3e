//! BLE Connection Management
//!
//! Owns the physical link lifecycle: connect with timeout, service and
//! characteristic discovery, and teardown. One device at a time.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::platform::{AdapterState, BackendEvent, BleBackend};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Discovered GATT layout of a connected device: service to characteristics.
pub type GattRegistry = HashMap<Uuid, Vec<Uuid>>;

pub struct ConnectionManager {
    backend: Arc<dyn BleBackend>,
    config: TransportConfig,
    // at most one connected device at a time
    active: Mutex<Option<String>>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BleBackend>, config: TransportConfig) -> Self {
        Self {
            backend,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BleBackend> {
        &self.backend
    }

    pub fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.backend.events()
    }

    /// Connect to `device` and discover its GATT layout.
    ///
    /// Discovery is time-boxed rather than counted: after issuing a
    /// characteristic-discovery request per service, whatever completions
    /// arrive within the configured grace period make up the registry.
    pub async fn connect(&self, device: &str) -> Result<GattRegistry, TransportError> {
        if self.backend.adapter_state().await == AdapterState::PoweredOff {
            return Err(TransportError::ConnectionFailed("adapter powered off".into()));
        }
        {
            let active = self.active.lock().await;
            if let Some(current) = active.as_deref() {
                if current != device {
                    return Err(TransportError::ConnectionFailed(format!(
                        "already connected to {current}"
                    )));
                }
            }
        }

        // subscribe before connecting so no discovery completion is missed
        let mut events = self.backend.events();

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(connect_timeout, self.backend.connect(device)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // the platform op may still complete after the deadline;
                // make sure no half-open link survives
                let _ = self.backend.disconnect(device).await;
                return Err(TransportError::Timeout);
            }
        }
        info!(device = %device, "link established");

        let registry = match self.discover_gatt(device, &mut events).await {
            Ok(registry) => registry,
            Err(e) => {
                // the link is up but the session never formed; tear it down
                // rather than leaking the radio
                if let Err(td) = self.backend.disconnect(device).await {
                    warn!(device = %device, "teardown after failed discovery: {td}");
                }
                return Err(e);
            }
        };
        info!(
            device = %device,
            services = registry.len(),
            "gatt discovery settled"
        );

        *self.active.lock().await = Some(device.to_string());
        Ok(registry)
    }

    async fn discover_gatt(
        &self,
        device: &str,
        events: &mut broadcast::Receiver<BackendEvent>,
    ) -> Result<GattRegistry, TransportError> {
        let services = self.backend.discover_services(device).await?;
        debug!(device = %device, count = services.len(), "services discovered");
        for service in &services {
            self.backend
                .discover_characteristics(device, *service)
                .await?;
        }
        Ok(self
            .collect_characteristics(device, &services, events)
            .await)
    }

    async fn collect_characteristics(
        &self,
        device: &str,
        services: &[Uuid],
        events: &mut broadcast::Receiver<BackendEvent>,
    ) -> GattRegistry {
        let mut registry: GattRegistry =
            services.iter().map(|s| (*s, Vec::new())).collect();
        let grace = Duration::from_millis(self.config.discovery_grace_ms);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = events.recv() => event,
            };
            match event {
                Ok(BackendEvent::CharacteristicsDiscovered {
                    device: d,
                    service,
                    characteristics,
                }) if d == device => {
                    debug!(
                        service = %service,
                        count = characteristics.len(),
                        "characteristics discovered"
                    );
                    registry.insert(service, characteristics);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "discovery event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        registry
    }

    /// Tear down the link. Safe to call when already disconnected.
    pub async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let result = self.backend.disconnect(device).await;
        self.release(device).await;
        info!(device = %device, "disconnected");
        result
    }

    pub async fn is_connected(&self, device: &str) -> bool {
        self.backend.is_connected(device).await
    }

    /// Clear the active slot without touching the link. Used when the
    /// platform stack already dropped it.
    pub(crate) async fn release(&self, device: &str) {
        let mut active = self.active.lock().await;
        if active.as_deref() == Some(device) {
            *active = None;
        }
    }
}
