//! G.711 mu-law expansion.

use super::{AudioCodec, Decoder};
use crate::error::DecodeError;

/// Expand one mu-law byte to a linear 16-bit sample.
const fn expand(byte: u8) -> i16 {
    // mu-law bytes are stored bit-inverted on the wire
    let inverted = !byte;
    let sign = inverted & 0x80;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let magnitude = ((((mantissa as i32) << 3) + 0x84) << exponent) - 0x84;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = expand(i as u8);
        i += 1;
    }
    table
}

/// All 256 expansions, computed once at compile time.
static MULAW_TABLE: [i16; 256] = build_table();

/// Table-lookup decoder for the mu-law codecs. Stateless.
pub struct MulawDecoder {
    codec: AudioCodec,
}

impl MulawDecoder {
    pub fn new(codec: AudioCodec) -> Self {
        debug_assert!(matches!(
            codec,
            AudioCodec::Mulaw16 | AudioCodec::Mulaw8
        ));
        Self { codec }
    }
}

impl Decoder for MulawDecoder {
    fn codec(&self) -> AudioCodec {
        self.codec
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError("empty mu-law payload".into()));
        }
        Ok(payload
            .iter()
            .map(|&b| MULAW_TABLE[b as usize])
            .collect())
    }
}
