//! Bluetooth Module
//!
//! Connects and streams from a fleet of BLE IMU peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   FleetOrchestrator                      │
//! │  (Slots, readiness barrier, streaming, fleet teardown)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ one per slot
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceSession                        │
//! │  (Lifecycle state machine, commands, notify stream)      │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │  Catalog   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - bounded │  │ - roles    │  │ - UUIDs  │
//! │   search  │  │ - notifying│  │ - commands│
//! └─────┬─────┘  └────────────┘  └──────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────┐
//! │   Transport (trait)         │
//! │   SimulatedTransport        │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, characteristic roles and device commands
//! - [`transport`] - Platform BLE capability the sessions drive
//! - [`scanner`] - Bounded, cancellable device search
//! - [`catalog`] - Resolved characteristics and active subscriptions
//! - [`session`] - Per-device connection lifecycle
//! - [`fleet`] - Multi-device coordination
//! - [`simulated`] - In-memory transport for the runner and tests

pub mod catalog;
pub mod fleet;
pub mod poll;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod simulated;
pub mod transport;

pub use fleet::{FleetConfig, FleetOrchestrator};
pub use session::{DeviceSession, SessionConfig};
pub use transport::Transport;
