use serde::{Deserialize, Serialize};

/// Externally observable state of the BLE link, attached to every
/// [`TelemetryRecord`] and queryable from the link pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection has ever been attempted.
    #[default]
    Uninitialized,
    /// Scanning, connecting or negotiating the characteristic stream.
    CurrentlyInitializing,
    /// The characteristic stream is active and delivering frames.
    Connected,
    /// The link dropped or was closed.
    Disconnected,
}

/// One decoded vehicle telemetry reading.
///
/// All fields come from a single inbound frame; a record is never partially
/// populated. The all-zero record tagged [`ConnectionState::Disconnected`]
/// is the sentinel published when the link drops cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub engine_coolant_temp: f32,
    pub engine_oil_temp: f32,
    pub intake_air_temp: f32,
    pub fuel_temp: f32,

    pub engine_rpm: f32,
    pub load_value: f32,
    pub boost_pressure: f32,
    pub mass_air_flow_rate: f32,
    pub throttle_position: f32,
    pub fuel_pressure: f32,
    pub fuel_consumption: f32,

    pub accelerator_pedal_position: f32,
    pub brake_pedal_position: f32,

    pub vehicle_speed: f32,

    pub connection_state: ConnectionState,
}

impl TelemetryRecord {
    /// The sentinel record published when the link drops cleanly, so
    /// consumers can tell "no data because disconnected" from an error.
    pub fn disconnected() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            ..Self::default()
        }
    }
}

/// Event published on the session's broadcast stream.
///
/// A single stream carries all three kinds so each subscriber observes
/// progress, data and errors in publish order.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Human-readable progress while the link pipeline advances.
    Loading(String),
    /// A decoded reading, or the zeroed disconnect sentinel.
    Success(TelemetryRecord),
    /// A terminal, human-readable failure.
    Error(String),
}
