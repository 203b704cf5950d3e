//! Audio streaming pipeline.
//!
//! Glues the transport's audio-data notification stream to the codec bank:
//! strip framing, validate the sequence counter, decode to PCM. Per-packet
//! problems never kill the stream; they surface on a diagnostics channel.

use crate::codec::{new_decoder, AudioCodec};
use crate::error::{DecodeError, SequenceGap, TransportError};
use crate::models::PcmBuffer;
use crate::protocol::{
    parse_audio_packet, PacketSequenceValidator, AUDIO_CODEC_CHAR_UUID, AUDIO_DATA_CHAR_UUID,
    AUDIO_SERVICE_UUID,
};
use crate::transport::Transport;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DIAGNOSTIC_CAPACITY: usize = 64;

/// A non-fatal, per-packet observation from a running audio stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDiagnostic {
    SequenceGap(SequenceGap),
    DecodeFailed(DecodeError),
}

/// A live decoded audio stream.
///
/// Dropping the stream stops the decode task; the GATT subscription stays
/// with the transport session.
pub struct AudioStream {
    codec: AudioCodec,
    pcm_rx: mpsc::UnboundedReceiver<PcmBuffer>,
    diag_rx: mpsc::Receiver<StreamDiagnostic>,
}

impl AudioStream {
    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    pub fn sample_rate(&self) -> u32 {
        self.codec.sample_rate()
    }

    /// Next decoded buffer, or `None` once the session has ended.
    pub async fn next_buffer(&mut self) -> Option<PcmBuffer> {
        self.pcm_rx.recv().await
    }

    /// Drain one queued diagnostic, if any. Diagnostics are dropped rather
    /// than buffered without bound when nobody drains them.
    pub fn try_next_diagnostic(&mut self) -> Option<StreamDiagnostic> {
        self.diag_rx.try_recv().ok()
    }
}

impl Transport {
    /// Read the codec id the firmware was flashed with.
    ///
    /// An empty value is treated like an unknown id: fall back to PCM8 and
    /// keep going.
    pub async fn read_audio_codec(&self) -> Result<AudioCodec, TransportError> {
        let value = self
            .read_characteristic(AUDIO_SERVICE_UUID, AUDIO_CODEC_CHAR_UUID)
            .await?;
        match value.first() {
            Some(&id) => Ok(AudioCodec::from_id(id)),
            None => {
                warn!(device = %self.device_id(), "empty codec value, assuming PCM8");
                Ok(AudioCodec::Pcm8)
            }
        }
    }

    /// Start streaming decoded audio from the device.
    ///
    /// Reads the codec once, builds a fresh decoder and sequence validator,
    /// subscribes to the audio-data characteristic, and spawns the decode
    /// task.
    pub async fn start_audio_stream(&self) -> Result<AudioStream, TransportError> {
        let codec = self.read_audio_codec().await?;
        let mut decoder = new_decoder(codec)
            .map_err(|e| TransportError::ConnectionFailed(format!("codec init: {e}")))?;
        let mut validator = PacketSequenceValidator::new();
        let notifications = self
            .characteristic_stream(AUDIO_SERVICE_UUID, AUDIO_DATA_CHAR_UUID)
            .await?;
        info!(device = %self.device_id(), ?codec, "audio stream started");

        let (pcm_tx, pcm_rx) = mpsc::unbounded_channel();
        let (diag_tx, diag_rx) = mpsc::channel(DIAGNOSTIC_CAPACITY);
        let device = self.device_id().to_string();
        tokio::spawn(async move {
            while let Some(raw) = notifications.recv().await {
                let packet = match parse_audio_packet(&raw) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(device = %device, "malformed audio packet: {e}");
                        let _ = diag_tx.try_send(StreamDiagnostic::DecodeFailed(e));
                        continue;
                    }
                };
                if let Some(gap) = validator.check(packet.sequence) {
                    warn!(
                        device = %device,
                        expected = gap.expected,
                        actual = gap.actual,
                        "audio packet sequence gap"
                    );
                    let _ = diag_tx.try_send(StreamDiagnostic::SequenceGap(gap));
                }
                if packet.payload.is_empty() {
                    // header-only keepalive
                    continue;
                }
                match decoder.decode(packet.payload) {
                    Ok(samples) => {
                        let buffer = PcmBuffer::mono(samples, codec.sample_rate());
                        if pcm_tx.send(buffer).is_err() {
                            // consumer dropped the stream
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(device = %device, "audio frame dropped: {e}");
                        let _ = diag_tx.try_send(StreamDiagnostic::DecodeFailed(e));
                    }
                }
            }
            info!(device = %device, "audio stream ended");
        });

        Ok(AudioStream {
            codec,
            pcm_rx,
            diag_rx,
        })
    }
}
