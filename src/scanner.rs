//! BLE Scanner Module
//!
//! Runs a bounded discovery pass over the backend and hands deduplicated
//! device descriptors to the consumer as they arrive.

use crate::models::DeviceDescriptor;
use crate::platform::{AdapterState, BackendEvent, BleBackend};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct DeviceScanner {
    backend: Arc<dyn BleBackend>,
}

impl DeviceScanner {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self { backend }
    }

    /// Start a scan that stops on its own after `timeout`.
    ///
    /// `filter` keeps only devices advertising at least one of the given
    /// services; an empty filter keeps everything. With the radio powered
    /// off the session completes immediately with no devices rather than
    /// erroring, matching how scan UIs want to behave.
    pub async fn start(
        &self,
        filter: Vec<Uuid>,
        timeout: Duration,
    ) -> Result<ScanSession, crate::error::TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::new(Notify::new());

        if self.backend.adapter_state().await == AdapterState::PoweredOff {
            warn!("scan requested with the radio powered off");
            stopped.store(true, Ordering::SeqCst);
            drop(tx);
            return Ok(ScanSession {
                rx,
                stopped,
                stop_signal,
                backend: self.backend.clone(),
            });
        }

        // subscribe before starting so no advertisement can slip past
        let events = self.backend.events();
        self.backend.start_scan(&filter).await?;
        info!(timeout_ms = timeout.as_millis() as u64, "scan started");

        let session = ScanSession {
            rx,
            stopped: stopped.clone(),
            stop_signal: stop_signal.clone(),
            backend: self.backend.clone(),
        };
        tokio::spawn(scan_worker(
            self.backend.clone(),
            events,
            filter,
            timeout,
            tx,
            stopped,
            stop_signal,
        ));
        Ok(session)
    }
}

async fn scan_worker(
    backend: Arc<dyn BleBackend>,
    mut events: broadcast::Receiver<BackendEvent>,
    filter: Vec<Uuid>,
    timeout: Duration,
    tx: mpsc::UnboundedSender<DeviceDescriptor>,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
) {
    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();
    loop {
        tokio::select! {
            _ = stop_signal.notified() => break,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("scan deadline reached");
                break;
            }
            event = events.recv() => match event {
                Ok(BackendEvent::Advertisement(descriptor)) => {
                    let matches = filter.is_empty()
                        || descriptor.services.iter().any(|s| filter.contains(s));
                    if matches && seen.insert(descriptor.id.clone()) {
                        debug!(device = %descriptor.id, name = %descriptor.name, rssi = descriptor.rssi, "device discovered");
                        if tx.send(descriptor).is_err() {
                            // consumer dropped the session
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "scan event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    if !stopped.swap(true, Ordering::SeqCst) {
        if let Err(e) = backend.stop_scan().await {
            warn!("scan stop failed: {e}");
        }
    }
    info!(devices = seen.len(), "scan finished");
}

/// A running (or finished) scan. Dropping the session stops the scan.
pub struct ScanSession {
    rx: mpsc::UnboundedReceiver<DeviceDescriptor>,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    backend: Arc<dyn BleBackend>,
}

impl ScanSession {
    /// Next discovered device, or `None` once the scan has ended.
    pub async fn next_device(&mut self) -> Option<DeviceDescriptor> {
        self.rx.recv().await
    }

    /// Stop early. Idempotent; safe to race with the timeout.
    pub async fn stop(&self) {
        self.stop_signal.notify_one();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.backend.stop_scan().await {
                warn!("scan stop failed: {e}");
            }
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop_signal.notify_one();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // best effort only; with the runtime already gone there is
            // nothing left to drive the radio anyway
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    let _ = backend.stop_scan().await;
                });
            }
        }
    }
}
