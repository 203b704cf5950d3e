//! Platform backend implementations.

pub mod btle;
pub mod simulated;

pub use btle::BtleBackend;
pub use simulated::SimulatedBackend;
