//! Opus frame decoding via libopus.

use super::{AudioCodec, Decoder};
use crate::error::DecodeError;

/// Largest frame the firmware emits: 60 ms at 16 kHz.
const MAX_FRAME_SAMPLES: usize = 960;

/// Stateful Opus decoder, 16 kHz mono.
///
/// libopus carries predictor state between frames, so one instance must not
/// be shared across streams.
pub struct OpusDecoder {
    inner: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        let inner = opus::Decoder::new(16_000, opus::Channels::Mono)
            .map_err(|e| DecodeError(format!("opus decoder init failed: {e}")))?;
        Ok(Self { inner })
    }
}

impl Decoder for OpusDecoder {
    fn codec(&self) -> AudioCodec {
        AudioCodec::Opus
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError("empty opus payload".into()));
        }
        let mut samples = vec![0i16; MAX_FRAME_SAMPLES];
        let decoded = self
            .inner
            .decode(payload, &mut samples, false)
            .map_err(|e| DecodeError(format!("opus decode failed: {e}")))?;
        samples.truncate(decoded);
        Ok(samples)
    }

    fn reset(&mut self) {
        if let Err(e) = self.inner.reset_state() {
            tracing::warn!("opus decoder reset failed: {e}");
        }
    }
}
