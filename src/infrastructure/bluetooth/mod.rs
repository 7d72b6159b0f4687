//! Bluetooth Module
//!
//! Provides the BLE telemetry pipeline for the OBD2 reader peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   TelemetrySession                       │
//! │  (façade - the only entry point for collaborators)       │
//! └─────────┬───────────────────────────────┬───────────────┘
//!           │ control requests              │ broadcast
//!           ▼                               ▼
//! ┌───────────────────┐            ┌────────────────┐
//! │ LinkStateMachine  │──events──▶ │ TelemetryStream │
//! │ (driver task)     │            └────────────────┘
//! └───────┬───────────┘
//!         │ RadioCommand / RadioEvent
//!         ▼
//! ┌───────────────────┐            ┌────────────────┐
//! │   Radio backend   │───frames──▶│    Protocol    │
//! │   (btleplug task) │            │ (UUIDs, decode) │
//! └───────────────────┘            └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Device identity constants and the frame decoder
//! - [`stream`] - Broadcast event stream consumed by collaborators
//! - [`transport`] - Command/event seam between machine and backend
//! - [`machine`] - Connect/negotiate/stream state machine with retry
//! - [`btleplug`] - Real radio backend
//! - [`service`] - Session controller façade

pub mod btleplug;
pub mod machine;
pub mod protocol;
pub mod service;
pub mod stream;
pub mod transport;

// Re-export the façade for convenience
pub use service::{SessionError, TelemetrySession};
pub use stream::TelemetryStream;
