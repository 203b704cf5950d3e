//! Device transport.
//!
//! One `Transport` per device. Wraps the connection manager with the session
//! state machine, correlates request completions arriving as backend events
//! back to their callers, and fans characteristic notifications out to
//! per-characteristic streams.

use crate::connection::{ConnectionManager, GattRegistry};
use crate::error::TransportError;
use crate::models::ConnectionState;
use crate::platform::BackendEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATE_EVENT_CAPACITY: usize = 16;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications from one characteristic, fanned out by the event loop.
///
/// Clones share the same underlying channel; a stream request for a
/// characteristic that already has a live stream returns another handle to
/// it rather than a second subscription.
#[derive(Clone)]
pub struct NotificationStream {
    id: u64,
    inner: Arc<StreamInner>,
}

struct StreamInner {
    // taken on finish so a parked recv() unblocks after draining
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl NotificationStream {
    fn new(id: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            inner: Arc::new(StreamInner {
                tx: std::sync::Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Stable identity of the underlying subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next notification value, or `None` once the stream has finished and
    /// all buffered values are drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inner.rx.lock().await.recv().await
    }

    fn push(&self, value: Vec<u8>) {
        if let Some(tx) = self.inner.tx.lock().unwrap().as_ref() {
            let _ = tx.send(value);
        }
    }

    fn finish(&self) {
        self.inner.tx.lock().unwrap().take();
    }
}

/// Everything scoped to one connected session, torn down together.
#[derive(Default)]
struct SessionTables {
    registry: GattRegistry,
    pending_reads: HashMap<Uuid, oneshot::Sender<Result<Vec<u8>, TransportError>>>,
    pending_writes: HashMap<Uuid, oneshot::Sender<Result<(), TransportError>>>,
    pending_rssi: Option<oneshot::Sender<Result<i16, TransportError>>>,
    streams: HashMap<(Uuid, Uuid), NotificationStream>,
    next_stream_id: u64,
}

struct Shared {
    device_id: String,
    manager: Arc<ConnectionManager>,
    state: std::sync::Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    tables: tokio::sync::Mutex<SessionTables>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut current = self.state.lock().unwrap();
        if *current != next {
            debug!(device = %self.device_id, ?next, "state transition");
            *current = next;
            let _ = self.state_tx.send(next);
        }
    }

    /// Resolve every in-flight operation with `err`, finish all streams,
    /// and forget the GATT registry.
    async fn clear_session(&self, err: TransportError) {
        let mut tables = self.tables.lock().await;
        for (_, tx) in tables.pending_reads.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        for (_, tx) in tables.pending_writes.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        if let Some(tx) = tables.pending_rssi.take() {
            let _ = tx.send(Err(err.clone()));
        }
        for (_, stream) in tables.streams.drain() {
            stream.finish();
        }
        tables.registry.clear();
    }
}

pub struct Transport {
    shared: Arc<Shared>,
    // serializes connect/disconnect against each other
    lifecycle_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(device_id: impl Into<String>, manager: Arc<ConnectionManager>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                device_id: device_id.into(),
                manager,
                state: std::sync::Mutex::new(ConnectionState::Disconnected),
                state_tx,
                tables: tokio::sync::Mutex::new(SessionTables::default()),
            }),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            event_task: std::sync::Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Subscribe to state transitions, including unsolicited drops.
    pub fn state_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Establish the session: link, discovery, event loop. A no-op when
    /// already connected.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        let _guard = self.lifecycle_lock.lock().await;
        if self.shared.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting);

        // subscribe before connecting so an immediate drop is not missed
        let events = self.shared.manager.events();
        match self.shared.manager.connect(&self.shared.device_id).await {
            Ok(registry) => {
                self.shared.tables.lock().await.registry = registry;
                // commit the state before the loop starts: a drop event
                // buffered during discovery must land on Connected, not be
                // overwritten by it
                self.shared.set_state(ConnectionState::Connected);
                let handle = tokio::spawn(event_loop(self.shared.clone(), events));
                if let Some(old) = self.event_task.lock().unwrap().replace(handle) {
                    old.abort();
                }
                info!(device = %self.shared.device_id, "session established");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent and infallible: in-flight
    /// operations resolve with [`TransportError::Disposed`], streams finish
    /// cleanly, link errors are only logged.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle_lock.lock().await;
        if self.shared.state() == ConnectionState::Disconnected {
            return;
        }
        self.shared.set_state(ConnectionState::Disconnecting);
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.clear_session(TransportError::Disposed).await;
        if let Err(e) = self
            .shared
            .manager
            .disconnect(&self.shared.device_id)
            .await
        {
            warn!(device = %self.shared.device_id, "link teardown failed: {e}");
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.manager.is_connected(&self.shared.device_id).await
    }

    /// Liveness probe: reads the link RSSI and waits for the completion.
    /// Returns `false` on any failure rather than erroring.
    pub async fn ping(&self) -> bool {
        if self.shared.state() != ConnectionState::Connected {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.shared.tables.lock().await;
            if tables.pending_rssi.is_some() {
                return false;
            }
            tables.pending_rssi = Some(tx);
        }
        if self
            .shared
            .manager
            .backend()
            .read_rssi(&self.shared.device_id)
            .await
            .is_err()
        {
            self.shared.tables.lock().await.pending_rssi = None;
            return false;
        }
        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(Ok(rssi))) => {
                debug!(device = %self.shared.device_id, rssi, "ping ok");
                true
            }
            _ => {
                self.shared.tables.lock().await.pending_rssi = None;
                false
            }
        }
    }

    /// Read one characteristic value.
    ///
    /// One read per characteristic may be in flight at a time; a second
    /// concurrent read on the same characteristic is rejected.
    pub async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_usable()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.shared.tables.lock().await;
            validate_target(&tables.registry, service, characteristic)?;
            if tables.pending_reads.contains_key(&characteristic) {
                return Err(TransportError::ReadFailed(
                    "read already in flight for this characteristic".into(),
                ));
            }
            tables.pending_reads.insert(characteristic, tx);
        }
        if let Err(e) = self
            .shared
            .manager
            .backend()
            .read_characteristic(&self.shared.device_id, service, characteristic)
            .await
        {
            self.shared
                .tables
                .lock()
                .await
                .pending_reads
                .remove(&characteristic);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::Disposed)?
    }

    /// Write a characteristic value. With `with_response` the call resolves
    /// when the device acknowledges; without, when the write is issued.
    pub async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.check_usable()?;
        let backend = self.shared.manager.backend().clone();
        if !with_response {
            validate_target(
                &self.shared.tables.lock().await.registry,
                service,
                characteristic,
            )?;
            return backend
                .write_characteristic(&self.shared.device_id, service, characteristic, value, false)
                .await;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.shared.tables.lock().await;
            validate_target(&tables.registry, service, characteristic)?;
            if tables.pending_writes.contains_key(&characteristic) {
                return Err(TransportError::WriteFailed(
                    "write already in flight for this characteristic".into(),
                ));
            }
            tables.pending_writes.insert(characteristic, tx);
        }
        if let Err(e) = backend
            .write_characteristic(&self.shared.device_id, service, characteristic, value, true)
            .await
        {
            self.shared
                .tables
                .lock()
                .await
                .pending_writes
                .remove(&characteristic);
            return Err(e);
        }
        rx.await.map_err(|_| TransportError::Disposed)?
    }

    /// Subscribe to a characteristic and return its notification stream.
    /// Repeated calls for the same characteristic return a handle to the
    /// existing stream.
    pub async fn characteristic_stream(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        self.check_usable()?;
        let stream = {
            let mut tables = self.shared.tables.lock().await;
            validate_target(&tables.registry, service, characteristic)?;
            if let Some(existing) = tables.streams.get(&(service, characteristic)) {
                return Ok(existing.clone());
            }
            let stream = NotificationStream::new(tables.next_stream_id);
            tables.next_stream_id += 1;
            tables
                .streams
                .insert((service, characteristic), stream.clone());
            stream
        };
        if let Err(e) = self
            .shared
            .manager
            .backend()
            .subscribe(&self.shared.device_id, service, characteristic)
            .await
        {
            self.shared
                .tables
                .lock()
                .await
                .streams
                .remove(&(service, characteristic));
            return Err(e);
        }
        Ok(stream)
    }

    /// Battery percentage from the standard battery service, if the device
    /// exposes one.
    pub async fn battery_level(&self) -> Option<u8> {
        match self
            .read_characteristic(
                crate::protocol::BATTERY_SERVICE_UUID,
                crate::protocol::BATTERY_LEVEL_CHAR_UUID,
            )
            .await
        {
            Ok(value) => value.first().copied(),
            Err(e) => {
                debug!(device = %self.shared.device_id, "battery read failed: {e}");
                None
            }
        }
    }

    /// Permanently retire the transport. The first call disconnects; every
    /// later call and every later operation fails with
    /// [`TransportError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %self.shared.device_id, "transport disposed");
        self.disconnect().await;
    }

    fn check_usable(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::Disposed);
        }
        if self.shared.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    /// In-flight reads, writes, and RSSI probes. Zero after teardown.
    pub async fn pending_operation_count(&self) -> usize {
        let tables = self.shared.tables.lock().await;
        tables.pending_reads.len()
            + tables.pending_writes.len()
            + usize::from(tables.pending_rssi.is_some())
    }

    /// Live notification streams. Zero after teardown.
    pub async fn stream_count(&self) -> usize {
        self.shared.tables.lock().await.streams.len()
    }
}

fn validate_target(
    registry: &GattRegistry,
    service: Uuid,
    characteristic: Uuid,
) -> Result<(), TransportError> {
    let characteristics = registry
        .get(&service)
        .ok_or(TransportError::ServiceNotFound(service))?;
    if !characteristics.contains(&characteristic) {
        return Err(TransportError::CharacteristicNotFound(characteristic));
    }
    Ok(())
}

async fn event_loop(shared: Arc<Shared>, mut events: broadcast::Receiver<BackendEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "transport event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            BackendEvent::ValueUpdated {
                device,
                service,
                characteristic,
                value,
            } if device == shared.device_id => {
                let mut tables = shared.tables.lock().await;
                // a pending read wins over a stream on the same characteristic
                if let Some(tx) = tables.pending_reads.remove(&characteristic) {
                    let _ = tx.send(Ok(value));
                } else if let Some(stream) = tables.streams.get(&(service, characteristic)) {
                    stream.push(value);
                }
            }
            BackendEvent::WriteCompleted {
                device,
                characteristic,
                result,
            } if device == shared.device_id => {
                if let Some(tx) = shared
                    .tables
                    .lock()
                    .await
                    .pending_writes
                    .remove(&characteristic)
                {
                    let _ = tx.send(result.map_err(TransportError::WriteFailed));
                }
            }
            BackendEvent::RssiRead { device, rssi } if device == shared.device_id => {
                if let Some(tx) = shared.tables.lock().await.pending_rssi.take() {
                    let _ = tx.send(rssi.map_err(TransportError::ReadFailed));
                }
            }
            BackendEvent::Disconnected { device } if device == shared.device_id => {
                handle_unsolicited_drop(&shared).await;
            }
            _ => {}
        }
    }
}

/// The platform stack dropped the link without a caller asking.
/// Callers learn about it through the state event and their resolved
/// operations; the transport stays usable for a reconnect.
async fn handle_unsolicited_drop(shared: &Arc<Shared>) {
    if shared.state() == ConnectionState::Disconnected {
        return;
    }
    warn!(device = %shared.device_id, "link dropped unsolicited");
    shared.set_state(ConnectionState::Disconnected);
    shared.clear_session(TransportError::NotConnected).await;
    shared.manager.release(&shared.device_id).await;
}
