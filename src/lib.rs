//! BLE transport and audio streaming engine for a wearable audio-capture
//! device.
//!
//! Layering, top to bottom:
//!
//! ```text
//! AudioStream        decoded PCM + per-packet diagnostics
//!     |
//! Transport          session state machine, request correlation,
//!     |              notification fan-out
//! ConnectionManager  link lifecycle + GATT discovery
//! DeviceScanner      bounded discovery passes
//!     |
//! BleBackend         platform trait: btleplug for hardware,
//!                    a scripted in-memory backend for tests
//! ```
//!
//! Everything above the [`platform::BleBackend`] trait is
//! platform-independent and fully exercised against the simulated backend.

pub mod audio;
pub mod backend;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod models;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod transport;

pub use audio::{AudioStream, StreamDiagnostic};
pub use codec::AudioCodec;
pub use config::TransportConfig;
pub use connection::ConnectionManager;
pub use error::{DecodeError, SequenceGap, TransportError};
pub use models::{ConnectionState, DeviceDescriptor, PcmBuffer};
pub use scanner::{DeviceScanner, ScanSession};
pub use transport::{NotificationStream, Transport};
