//! `obd2-telemetry`: live vehicle telemetry over BLE.
//!
//! Connects to an OBD2 reader peripheral, negotiates the characteristic
//! stream (scan, connect, service discovery, MTU, notifications) and decodes
//! inbound JSON frames into [`TelemetryRecord`]s, all multiplexed onto a
//! single broadcast stream of [`TelemetryEvent`]s.
//!
//! The binary (`src/main.rs`) handles CLI parsing and renders the stream;
//! everything else lives here where it can be tested deterministically with
//! an injected radio transport.

pub mod domain;
pub mod infrastructure;

// Re-export commonly used types at the crate root
pub use domain::models::{ConnectionState, TelemetryEvent, TelemetryRecord};
pub use domain::settings::{LinkSettings, LogSettings, Settings};
pub use infrastructure::bluetooth::protocol::{decode_frame, DecodeError};
pub use infrastructure::bluetooth::{SessionError, TelemetrySession, TelemetryStream};
