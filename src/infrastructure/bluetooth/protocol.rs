//! OBD2 Reader Protocol
//!
//! Device identity constants and the telemetry frame decoder for the
//! OBD2 BLE peripheral.

use crate::domain::models::{ConnectionState, TelemetryRecord};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Advertised device name the scanner matches against, exactly.
pub const DEVICE_NAME: &str = "OBD2";

/// OBD2 telemetry service UUID.
pub const OBD2_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Telemetry characteristic UUID - where JSON frames are notified.
pub const OBD2_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Client characteristic configuration descriptor, written by the host
/// stack to enable notifications or indications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// MTU requested after service discovery. 517 bytes lets a full JSON frame
/// fit in a single notification.
pub const REQUESTED_MTU: u16 = 517;

/// Abnormal connect/negotiate failures retried before giving up. The budget
/// counts retries after the first failed attempt, so six attempts happen in
/// total.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 5;

/// Why an inbound frame could not be decoded.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    /// Not a JSON object, a required field is missing, or a field is not a
    /// number. The underlying error names the offending field.
    #[error("malformed telemetry frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Wire shape of one telemetry frame: a JSON object with fourteen numeric
/// fields keyed by their OBD2 parameter names. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "Engine Coolant Temperature")]
    engine_coolant_temp: f32,
    #[serde(rename = "Engine Oil Temperature")]
    engine_oil_temp: f32,
    #[serde(rename = "Intake Air Temperature")]
    intake_air_temp: f32,
    #[serde(rename = "Fuel Temperature")]
    fuel_temp: f32,
    #[serde(rename = "Engine RPM")]
    engine_rpm: f32,
    #[serde(rename = "Calculated Load Value")]
    load_value: f32,
    #[serde(rename = "Boost Pressure")]
    boost_pressure: f32,
    #[serde(rename = "Mass Air Flow Rate")]
    mass_air_flow_rate: f32,
    #[serde(rename = "Throttle Position")]
    throttle_position: f32,
    #[serde(rename = "Fuel Pressure")]
    fuel_pressure: f32,
    #[serde(rename = "Fuel Consumption Rate")]
    fuel_consumption: f32,
    #[serde(rename = "Accelerator Pedal Position")]
    accelerator_pedal_position: f32,
    #[serde(rename = "Brake Pedal Position")]
    brake_pedal_position: f32,
    #[serde(rename = "Vehicle Speed")]
    vehicle_speed: f32,
}

/// Decode one raw characteristic notification into a [`TelemetryRecord`]
/// tagged [`ConnectionState::Connected`].
///
/// Decoding is atomic: the first missing or non-numeric field fails the
/// whole frame and no record is produced.
pub fn decode_frame(raw: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let text = std::str::from_utf8(raw)?;
    let frame: RawFrame = serde_json::from_str(text)?;

    Ok(TelemetryRecord {
        engine_coolant_temp: frame.engine_coolant_temp,
        engine_oil_temp: frame.engine_oil_temp,
        intake_air_temp: frame.intake_air_temp,
        fuel_temp: frame.fuel_temp,
        engine_rpm: frame.engine_rpm,
        load_value: frame.load_value,
        boost_pressure: frame.boost_pressure,
        mass_air_flow_rate: frame.mass_air_flow_rate,
        throttle_position: frame.throttle_position,
        fuel_pressure: frame.fuel_pressure,
        fuel_consumption: frame.fuel_consumption,
        accelerator_pedal_position: frame.accelerator_pedal_position,
        brake_pedal_position: frame.brake_pedal_position,
        vehicle_speed: frame.vehicle_speed,
        connection_state: ConnectionState::Connected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame() -> String {
        r#"{
            "Engine Coolant Temperature": 88.5,
            "Engine Oil Temperature": 95.25,
            "Intake Air Temperature": 31.0,
            "Fuel Temperature": 24.0,
            "Engine RPM": 2450,
            "Calculated Load Value": 42.7,
            "Boost Pressure": 1.35,
            "Mass Air Flow Rate": 18.9,
            "Throttle Position": 33.0,
            "Fuel Pressure": 3.8,
            "Fuel Consumption Rate": 7.2,
            "Accelerator Pedal Position": 35.5,
            "Brake Pedal Position": 0.0,
            "Vehicle Speed": 87.0
        }"#
        .to_string()
    }

    #[test]
    fn decodes_full_frame() {
        let record = decode_frame(full_frame().as_bytes()).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert_eq!(record.engine_coolant_temp, 88.5);
        assert_eq!(record.engine_oil_temp, 95.25);
        assert_eq!(record.intake_air_temp, 31.0);
        assert_eq!(record.fuel_temp, 24.0);
        assert_eq!(record.engine_rpm, 2450.0);
        assert_eq!(record.load_value, 42.7);
        assert_eq!(record.boost_pressure, 1.35);
        assert_eq!(record.mass_air_flow_rate, 18.9);
        assert_eq!(record.throttle_position, 33.0);
        assert_eq!(record.fuel_pressure, 3.8);
        assert_eq!(record.fuel_consumption, 7.2);
        assert_eq!(record.accelerator_pedal_position, 35.5);
        assert_eq!(record.brake_pedal_position, 0.0);
        assert_eq!(record.vehicle_speed, 87.0);
    }

    #[test]
    fn integer_values_decode_as_floats() {
        let record = decode_frame(full_frame().as_bytes()).unwrap();
        assert_eq!(record.engine_rpm, 2450.0);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let frame = full_frame().replacen('{', r#"{"Ambient Temperature": 19.0,"#, 1);
        assert!(decode_frame(frame.as_bytes()).is_ok());
    }

    #[test]
    fn missing_field_fails_and_names_it() {
        let frame = full_frame().replace(r#""Engine RPM": 2450,"#, "");
        let err = decode_frame(frame.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Engine RPM"), "got: {err}");
    }

    #[test]
    fn non_numeric_field_fails() {
        let frame = full_frame().replace("2450", r#""fast""#);
        assert!(decode_frame(frame.as_bytes()).is_err());
    }

    #[test]
    fn non_json_payload_fails() {
        assert!(decode_frame(b"ATZ\r\nOK>").is_err());
    }

    #[test]
    fn non_utf8_payload_fails() {
        let err = decode_frame(&[0xff, 0xfe, 0x80]).unwrap_err();
        assert!(matches!(err, DecodeError::Encoding(_)));
    }

    #[test]
    fn identity_constants_render_canonically() {
        assert_eq!(
            OBD2_SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            OBD2_CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }
}
