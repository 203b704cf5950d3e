//! Error types for the transport engine.

use uuid::Uuid;

/// Errors surfaced by the transport, connection manager, and scanner.
///
/// Connection, read, and write failures propagate directly to the caller;
/// the engine performs no automatic retry. `SequenceGap` and decode failures
/// are deliberately *not* part of this enum: they are non-fatal,
/// per-packet observations reported on the audio diagnostics channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("transport disposed")]
    Disposed,
}

/// A malformed or undecodable audio frame.
///
/// Never fatal to the session: the frame is dropped and the stream
/// continues with the next packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audio decode failed: {0}")]
pub struct DecodeError(pub String);

/// A break in the audio packet sequence counter.
///
/// Observational only. The validator re-synchronizes to the received
/// value, so a single lost packet produces exactly one gap report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u16,
    pub actual: u16,
}
