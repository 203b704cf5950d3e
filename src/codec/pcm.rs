//! Linear PCM payload handling.

use super::{AudioCodec, Decoder};
use crate::error::DecodeError;

/// Decoder for the uncompressed codecs.
///
/// 16-bit payloads are little-endian sample pairs; 8-bit payloads are
/// unsigned samples recentred and scaled up to the full 16-bit range.
pub struct PcmDecoder {
    codec: AudioCodec,
}

impl PcmDecoder {
    pub fn new(codec: AudioCodec) -> Self {
        debug_assert!(matches!(codec, AudioCodec::Pcm16 | AudioCodec::Pcm8));
        Self { codec }
    }
}

impl Decoder for PcmDecoder {
    fn codec(&self) -> AudioCodec {
        self.codec
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError("empty PCM payload".into()));
        }
        match self.codec {
            AudioCodec::Pcm16 => {
                if payload.len() % 2 != 0 {
                    return Err(DecodeError(format!(
                        "odd PCM16 payload length: {} bytes",
                        payload.len()
                    )));
                }
                Ok(payload
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect())
            }
            _ => Ok(payload
                .iter()
                .map(|&b| (b as i16 - 128) * 256)
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_decodes_little_endian_pairs() {
        let mut decoder = PcmDecoder::new(AudioCodec::Pcm16);
        let samples = decoder.decode(&[0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![0, 32767, -32768]);
    }

    #[test]
    fn pcm16_rejects_odd_length() {
        let mut decoder = PcmDecoder::new(AudioCodec::Pcm16);
        assert!(decoder.decode(&[0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn pcm8_recentres_unsigned_samples() {
        let mut decoder = PcmDecoder::new(AudioCodec::Pcm8);
        let samples = decoder.decode(&[128, 0, 255]).unwrap();
        assert_eq!(samples, vec![0, -32768, 32512]);
    }

    #[test]
    fn empty_payload_rejected() {
        let mut decoder = PcmDecoder::new(AudioCodec::Pcm8);
        assert!(decoder.decode(&[]).is_err());
    }
}
