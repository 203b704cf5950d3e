use uuid::Uuid;

/// A device seen during a BLE scan.
///
/// Created from an advertisement callback and handed to the scan consumer;
/// not retained by the engine after the scan stops.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Platform identifier for the peripheral.
    /// A UUID string on macOS/Windows, a MAC address on Linux.
    pub id: String,
    /// Advertised local name, or "Unknown" when the advertisement has none.
    pub name: String,
    /// Signal strength in dBm at discovery time.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// Connection state machine of a [`crate::transport::Transport`].
///
/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
/// with `Connecting -> Disconnected` on failure. An unsolicited drop from the
/// platform stack moves `Connected -> Disconnected` directly; it is the only
/// transition not triggered by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A chunk of decoded linear PCM audio (signed 16-bit, mono).
#[derive(Debug, Clone, Default)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Serialize the samples as little-endian bytes, the layout consumed by
    /// recorder collaborators (WAV writers, transcription services).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
