//! Multi-device BLE IMU connection manager
//!
//! Connects a fixed fleet of IMU peripherals, starts their data streams
//! together and saves every sample line to a per-device file.

pub mod domain;
pub mod infrastructure;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
