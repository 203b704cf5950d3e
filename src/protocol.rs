//! Wearable GATT Protocol
//!
//! UUID constants, audio notification framing, and the packet sequence
//! validator for the audio-capture wearable.

use crate::error::{DecodeError, SequenceGap};
use uuid::Uuid;

/// Primary audio service advertised by the device.
pub const AUDIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x19b10000_e8f2_537e_4f6c_d104768a1214);

/// Audio Data Characteristic UUID - framed audio payloads arrive here (notify)
pub const AUDIO_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x19b10001_e8f2_537e_4f6c_d104768a1214);

/// Audio Codec Characteristic UUID - one-byte codec id, read once per session
pub const AUDIO_CODEC_CHAR_UUID: Uuid = Uuid::from_u128(0x19b10002_e8f2_537e_4f6c_d104768a1214);

/// Standard Bluetooth SIG battery service.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Battery level characteristic (one byte, 0-100).
pub const BATTERY_LEVEL_CHAR_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Length of the framing header on every audio notification.
pub const AUDIO_HEADER_LEN: usize = 3;

/// One audio notification with its framing header stripped.
///
/// # Notification layout
///
/// ```text
/// [0]   : Sequence counter, low byte  (u16 little-endian)
/// [1]   : Sequence counter, high byte
/// [2]   : Frame id within the packet group
/// [3..] : Codec-specific payload
/// ```
///
/// Only the sequence counter is interpreted here; the payload is handed to
/// the session codec as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacket<'a> {
    pub sequence: u16,
    pub payload: &'a [u8],
}

/// Split a raw audio notification into sequence counter and payload.
pub fn parse_audio_packet(data: &[u8]) -> Result<AudioPacket<'_>, DecodeError> {
    if data.len() < AUDIO_HEADER_LEN {
        return Err(DecodeError(format!(
            "audio packet shorter than framing header: {} bytes",
            data.len()
        )));
    }
    let sequence = u16::from_le_bytes([data[0], data[1]]);
    Ok(AudioPacket {
        sequence,
        payload: &data[AUDIO_HEADER_LEN..],
    })
}

/// Integrity check on the 16-bit wraparound sequence counter embedded in
/// every audio notification.
///
/// Holds at most the last-seen value. A gap report is non-fatal: the
/// validator re-synchronizes to the received counter so it never latches
/// into a permanently-erroring state.
#[derive(Debug, Default)]
pub struct PacketSequenceValidator {
    last_seen: Option<u16>,
}

impl PacketSequenceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one sequence counter. Returns `Some(gap)` when the value is not
    /// the expected successor of the last accepted one; the first value after
    /// construction or [`reset`](Self::reset) is always accepted.
    pub fn check(&mut self, n: u16) -> Option<SequenceGap> {
        let result = match self.last_seen {
            None => None,
            Some(last) => {
                let expected = last.wrapping_add(1);
                if n == expected {
                    None
                } else {
                    Some(SequenceGap {
                        expected,
                        actual: n,
                    })
                }
            }
        };
        self.last_seen = Some(n);
        result
    }

    /// Forget the stored counter. Called exactly once per new stream.
    pub fn reset(&mut self) {
        self.last_seen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_never_gaps() {
        for n in [0u16, 1, 7, 65535] {
            let mut v = PacketSequenceValidator::new();
            assert_eq!(v.check(n), None);
        }
    }

    #[test]
    fn consecutive_counters_accepted() {
        let mut v = PacketSequenceValidator::new();
        assert_eq!(v.check(10), None);
        assert_eq!(v.check(11), None);
        assert_eq!(v.check(12), None);
    }

    #[test]
    fn wraparound_is_not_a_gap() {
        let mut v = PacketSequenceValidator::new();
        assert_eq!(v.check(65535), None);
        assert_eq!(v.check(0), None);
    }

    #[test]
    fn gap_reported_once_then_resynchronized() {
        let mut v = PacketSequenceValidator::new();
        assert_eq!(v.check(5), None);
        assert_eq!(
            v.check(7),
            Some(SequenceGap {
                expected: 6,
                actual: 7
            })
        );
        // counter re-synchronized to 7
        assert_eq!(v.check(8), None);
    }

    #[test]
    fn reset_clears_stored_counter() {
        let mut v = PacketSequenceValidator::new();
        assert_eq!(v.check(100), None);
        v.reset();
        assert_eq!(v.check(42), None);
    }

    #[test]
    fn parse_strips_three_byte_header() {
        let packet = parse_audio_packet(&[0x34, 0x12, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(packet.sequence, 0x1234);
        assert_eq!(packet.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_allows_empty_payload() {
        let packet = parse_audio_packet(&[0x01, 0x00, 0x00]).unwrap();
        assert_eq!(packet.sequence, 1);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn parse_rejects_truncated_header() {
        assert!(parse_audio_packet(&[0x01, 0x00]).is_err());
        assert!(parse_audio_packet(&[]).is_err());
    }
}
