//! Audio codec bank.
//!
//! Maps the one-byte codec id read from the device onto a decoder that turns
//! raw notification payloads into 16-bit linear PCM.

mod mulaw;
mod opus;
mod pcm;

pub use self::mulaw::MulawDecoder;
pub use self::opus::OpusDecoder;
pub use self::pcm::PcmDecoder;

use crate::error::DecodeError;
use tracing::warn;

/// Audio encodings the wearable firmware can be flashed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Uncompressed 16-bit linear PCM at 16 kHz.
    Pcm16,
    /// Uncompressed 8-bit linear PCM at 8 kHz.
    Pcm8,
    /// G.711 mu-law companded, 16 kHz.
    Mulaw16,
    /// G.711 mu-law companded, 8 kHz.
    Mulaw8,
    /// Opus frames, 16 kHz mono.
    Opus,
}

impl AudioCodec {
    /// Map the codec id byte read from the codec characteristic.
    ///
    /// Unknown ids fall back to [`AudioCodec::Pcm8`] so a newer firmware
    /// never bricks the session outright; the mismatch shows up as garbled
    /// audio plus a log line rather than a hard error.
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => AudioCodec::Pcm16,
            1 => AudioCodec::Pcm8,
            10 => AudioCodec::Mulaw16,
            11 => AudioCodec::Mulaw8,
            20 => AudioCodec::Opus,
            other => {
                warn!(codec_id = other, "unknown codec id, falling back to PCM8");
                AudioCodec::Pcm8
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioCodec::Pcm16 | AudioCodec::Mulaw16 | AudioCodec::Opus => 16_000,
            AudioCodec::Pcm8 | AudioCodec::Mulaw8 => 8_000,
        }
    }

    /// Bits per sample on the wire, before expansion to 16-bit PCM.
    pub fn bit_depth(&self) -> u8 {
        match self {
            AudioCodec::Pcm16 => 16,
            _ => 8,
        }
    }
}

/// One audio decoder bound to a single stream.
///
/// Decoders are stateful (Opus carries inter-frame predictor state), so a
/// fresh instance is created per stream and [`reset`](Decoder::reset) after
/// any reconnect.
pub trait Decoder: Send {
    fn codec(&self) -> AudioCodec;

    fn sample_rate(&self) -> u32 {
        self.codec().sample_rate()
    }

    /// Decode one payload (framing header already stripped) into PCM samples.
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, DecodeError>;

    /// Drop any inter-frame state. No-op for the stateless codecs.
    fn reset(&mut self) {}
}

/// Construct the decoder for a codec. Fails only when the underlying Opus
/// decoder cannot be initialized.
pub fn new_decoder(codec: AudioCodec) -> Result<Box<dyn Decoder>, DecodeError> {
    Ok(match codec {
        AudioCodec::Pcm16 | AudioCodec::Pcm8 => Box::new(PcmDecoder::new(codec)),
        AudioCodec::Mulaw16 | AudioCodec::Mulaw8 => Box::new(MulawDecoder::new(codec)),
        AudioCodec::Opus => Box::new(OpusDecoder::new()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_id_mapping() {
        assert_eq!(AudioCodec::from_id(0), AudioCodec::Pcm16);
        assert_eq!(AudioCodec::from_id(1), AudioCodec::Pcm8);
        assert_eq!(AudioCodec::from_id(10), AudioCodec::Mulaw16);
        assert_eq!(AudioCodec::from_id(11), AudioCodec::Mulaw8);
        assert_eq!(AudioCodec::from_id(20), AudioCodec::Opus);
    }

    #[test]
    fn unknown_codec_id_falls_back_to_pcm8() {
        assert_eq!(AudioCodec::from_id(99), AudioCodec::Pcm8);
        assert_eq!(AudioCodec::from_id(2), AudioCodec::Pcm8);
    }

    #[test]
    fn sample_rates() {
        assert_eq!(AudioCodec::Pcm16.sample_rate(), 16_000);
        assert_eq!(AudioCodec::Mulaw16.sample_rate(), 16_000);
        assert_eq!(AudioCodec::Opus.sample_rate(), 16_000);
        assert_eq!(AudioCodec::Pcm8.sample_rate(), 8_000);
        assert_eq!(AudioCodec::Mulaw8.sample_rate(), 8_000);
    }

    #[test]
    fn decoder_bank_covers_every_codec() {
        for codec in [
            AudioCodec::Pcm16,
            AudioCodec::Pcm8,
            AudioCodec::Mulaw16,
            AudioCodec::Mulaw8,
            AudioCodec::Opus,
        ] {
            let decoder = new_decoder(codec).unwrap();
            assert_eq!(decoder.codec(), codec);
            assert_eq!(decoder.sample_rate(), codec.sample_rate());
        }
    }
}
