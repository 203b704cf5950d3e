//! End-to-end engine tests over the scripted backend.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;
use wearlink::backend::SimulatedBackend;
use wearlink::platform::BleBackend;
use wearlink::protocol::{
    AUDIO_CODEC_CHAR_UUID, AUDIO_DATA_CHAR_UUID, AUDIO_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID,
    BATTERY_SERVICE_UUID,
};
use wearlink::{
    AudioCodec, ConnectionManager, ConnectionState, DeviceDescriptor, DeviceScanner,
    StreamDiagnostic, Transport, TransportConfig, TransportError,
};

const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

// a characteristic scripted with no value: reads never complete
const SILENT_CHAR_UUID: Uuid = Uuid::from_u128(0x19b10009_e8f2_537e_4f6c_d104768a1214);

fn test_config() -> TransportConfig {
    TransportConfig {
        scan_timeout_ms: 100,
        connect_timeout_ms: 1_000,
        discovery_grace_ms: 25,
        ..Default::default()
    }
}

/// A scripted wearable: audio service with PCM8 codec, battery at 87%.
fn wearable_backend() -> Arc<SimulatedBackend> {
    let backend = Arc::new(SimulatedBackend::new());
    backend.add_device(DeviceDescriptor {
        id: DEVICE.to_string(),
        name: "Wearable".to_string(),
        rssi: -58,
        services: vec![AUDIO_SERVICE_UUID, BATTERY_SERVICE_UUID],
    });
    backend.add_characteristic(DEVICE, AUDIO_SERVICE_UUID, AUDIO_DATA_CHAR_UUID);
    backend.add_characteristic(DEVICE, AUDIO_SERVICE_UUID, SILENT_CHAR_UUID);
    backend.set_value(DEVICE, AUDIO_SERVICE_UUID, AUDIO_CODEC_CHAR_UUID, vec![1]);
    backend.set_value(DEVICE, BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID, vec![87]);
    backend
}

fn transport_over(backend: &Arc<SimulatedBackend>) -> Arc<Transport> {
    let manager = Arc::new(ConnectionManager::new(
        backend.clone() as Arc<dyn BleBackend>,
        test_config(),
    ));
    Arc::new(Transport::new(DEVICE, manager))
}

/// Frame a payload the way the firmware does: sequence counter plus frame id.
fn audio_packet(sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(3 + payload.len());
    packet.extend_from_slice(&sequence.to_le_bytes());
    packet.push(0);
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn scan_finds_matching_devices_and_filters_others() {
    let backend = wearable_backend();
    backend.add_device(DeviceDescriptor {
        id: "11:22:33:44:55:66".to_string(),
        name: "Headphones".to_string(),
        rssi: -40,
        services: vec![Uuid::from_u128(0xdead)],
    });

    let scanner = DeviceScanner::new(backend.clone() as Arc<dyn BleBackend>);
    let mut session = scanner
        .start(vec![AUDIO_SERVICE_UUID], Duration::from_millis(100))
        .await
        .unwrap();

    let found = timeout(Duration::from_secs(1), session.next_device())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, DEVICE);
    // only the wearable matches; the session ends at the deadline
    assert!(timeout(Duration::from_secs(1), session.next_device())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn scan_with_radio_off_completes_empty() {
    let backend = wearable_backend();
    backend.set_powered(false);

    let scanner = DeviceScanner::new(backend as Arc<dyn BleBackend>);
    let mut session = scanner
        .start(vec![], Duration::from_millis(100))
        .await
        .unwrap();
    assert!(session.next_device().await.is_none());
}

#[tokio::test]
async fn connect_is_idempotent() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);

    transport.connect().await.unwrap();
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert!(transport.is_connected().await);
}

#[tokio::test]
async fn failed_connect_returns_to_disconnected() {
    let backend = Arc::new(SimulatedBackend::new());
    let transport = transport_over(&backend);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_discovery_tears_the_link_back_down() {
    let backend = wearable_backend();
    backend.set_discovery_failing(true);
    let transport = transport_over(&backend);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    // the physical link must not outlive the failed session
    assert!(!backend.is_connected(DEVICE).await);

    // nothing leaked: the same transport can connect once discovery works
    backend.set_discovery_failing(false);
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn drop_during_discovery_settles_disconnected() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    let mut states = transport.state_events();

    let connecting = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.connect().await })
    };
    // land the drop inside the discovery grace window
    tokio::time::sleep(Duration::from_millis(10)).await;
    backend.drop_connection(DEVICE);
    connecting.await.unwrap().unwrap();

    // the buffered drop must win over the freshly committed session
    loop {
        let state = timeout(Duration::from_secs(1), states.recv())
            .await
            .unwrap()
            .unwrap();
        if state == ConnectionState::Disconnected {
            break;
        }
    }
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert!(!transport.is_connected().await);
}

#[test]
fn scan_session_outlives_its_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let session = runtime.block_on(async {
        let backend = wearable_backend();
        let scanner = DeviceScanner::new(backend as Arc<dyn BleBackend>);
        scanner
            .start(vec![AUDIO_SERVICE_UUID], Duration::from_secs(30))
            .await
            .unwrap()
    });
    drop(runtime);
    // dropping with no runtime left must not panic
    drop(session);
}

#[tokio::test]
async fn connect_with_radio_off_fails() {
    let backend = wearable_backend();
    backend.set_powered(false);
    let transport = transport_over(&backend);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn audio_stream_decodes_pcm8_packets() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let mut stream = transport.start_audio_stream().await.unwrap();
    assert_eq!(stream.codec(), AudioCodec::Pcm8);
    assert_eq!(stream.sample_rate(), 8_000);

    for sequence in 0..3u16 {
        backend.notify(
            DEVICE,
            AUDIO_SERVICE_UUID,
            AUDIO_DATA_CHAR_UUID,
            audio_packet(sequence, &[128u8; 160]),
        );
    }
    for _ in 0..3 {
        let buffer = timeout(Duration::from_secs(1), stream.next_buffer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.samples.len(), 160);
        assert_eq!(buffer.sample_rate, 8_000);
        assert_eq!(buffer.channels, 1);
    }
    assert!(stream.try_next_diagnostic().is_none());
}

#[tokio::test]
async fn lost_packet_reports_exactly_one_gap() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let mut stream = transport.start_audio_stream().await.unwrap();
    // packet 6 lost: 5, 7, 8
    for sequence in [5u16, 7, 8] {
        backend.notify(
            DEVICE,
            AUDIO_SERVICE_UUID,
            AUDIO_DATA_CHAR_UUID,
            audio_packet(sequence, &[128u8; 10]),
        );
    }
    for _ in 0..3 {
        timeout(Duration::from_secs(1), stream.next_buffer())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(
        stream.try_next_diagnostic(),
        Some(StreamDiagnostic::SequenceGap(wearlink::SequenceGap {
            expected: 6,
            actual: 7
        }))
    );
    // validator re-synchronized at 7, so 8 was clean
    assert!(stream.try_next_diagnostic().is_none());
}

#[tokio::test]
async fn malformed_packet_is_dropped_with_a_diagnostic() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let mut stream = transport.start_audio_stream().await.unwrap();
    backend.notify(DEVICE, AUDIO_SERVICE_UUID, AUDIO_DATA_CHAR_UUID, vec![0x01]);
    backend.notify(
        DEVICE,
        AUDIO_SERVICE_UUID,
        AUDIO_DATA_CHAR_UUID,
        audio_packet(0, &[128u8; 10]),
    );

    let buffer = timeout(Duration::from_secs(1), stream.next_buffer())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buffer.samples.len(), 10);
    assert!(matches!(
        stream.try_next_diagnostic(),
        Some(StreamDiagnostic::DecodeFailed(_))
    ));
}

#[tokio::test]
async fn disconnect_resolves_pending_reads_and_clears_tables() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let reader = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .read_characteristic(AUDIO_SERVICE_UUID, SILENT_CHAR_UUID)
                .await
        })
    };
    // let the read get registered
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.pending_operation_count().await, 1);

    transport.disconnect().await;

    let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(TransportError::Disposed)));
    assert_eq!(transport.pending_operation_count().await, 0);
    assert_eq!(transport.stream_count().await, 0);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn concurrent_reads_on_one_characteristic_are_rejected() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let first = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .read_characteristic(AUDIO_SERVICE_UUID, SILENT_CHAR_UUID)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = transport
        .read_characteristic(AUDIO_SERVICE_UUID, SILENT_CHAR_UUID)
        .await;
    assert!(matches!(second, Err(TransportError::ReadFailed(_))));

    transport.disconnect().await;
    let _ = first.await;
}

#[tokio::test]
async fn reads_validate_against_the_discovered_registry() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let unknown_service = Uuid::from_u128(0xbeef);
    assert!(matches!(
        transport
            .read_characteristic(unknown_service, AUDIO_CODEC_CHAR_UUID)
            .await,
        Err(TransportError::ServiceNotFound(_))
    ));
    assert!(matches!(
        transport
            .read_characteristic(AUDIO_SERVICE_UUID, unknown_service)
            .await,
        Err(TransportError::CharacteristicNotFound(_))
    ));
}

#[tokio::test]
async fn repeated_stream_requests_share_one_subscription() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let first = transport
        .characteristic_stream(AUDIO_SERVICE_UUID, AUDIO_DATA_CHAR_UUID)
        .await
        .unwrap();
    let second = transport
        .characteristic_stream(AUDIO_SERVICE_UUID, AUDIO_DATA_CHAR_UUID)
        .await
        .unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(transport.stream_count().await, 1);
}

#[tokio::test]
async fn unsolicited_drop_emits_state_event_and_allows_reconnect() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    let mut states = transport.state_events();
    backend.drop_connection(DEVICE);

    let state = timeout(Duration::from_secs(1), states.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(transport.pending_operation_count().await, 0);

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn ping_reflects_link_health() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);

    assert!(!transport.ping().await);

    transport.connect().await.unwrap();
    assert!(transport.ping().await);

    backend.set_rssi_failing(true);
    assert!(!transport.ping().await);
}

#[tokio::test]
async fn dispose_is_terminal_and_idempotent() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    transport.dispose().await;
    transport.dispose().await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    assert!(matches!(
        transport.connect().await,
        Err(TransportError::Disposed)
    ));
    assert!(matches!(
        transport
            .read_characteristic(AUDIO_SERVICE_UUID, AUDIO_CODEC_CHAR_UUID)
            .await,
        Err(TransportError::Disposed)
    ));
}

#[tokio::test]
async fn battery_level_reads_the_standard_service() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    assert_eq!(transport.battery_level().await, Some(87));
}

#[tokio::test]
async fn writes_reach_the_device() {
    let backend = wearable_backend();
    let transport = transport_over(&backend);
    transport.connect().await.unwrap();

    transport
        .write_characteristic(AUDIO_SERVICE_UUID, AUDIO_CODEC_CHAR_UUID, &[20], true)
        .await
        .unwrap();
    assert_eq!(
        backend.written(),
        vec![(AUDIO_CODEC_CHAR_UUID, vec![20])]
    );
}
