//! Canonical telemetry and the wire dialect normalizer
//!
//! Hardware generations report the same OSD content with two field naming
//! conventions: the standard camelCase schema and the newer snake_case schema.
//! Both are decoded into one canonical, flat record:
//! - the dialect is sniffed from a fixed, ordered list of top-level signature
//!   keys that only the snake_case dialect uses
//! - the camelCase decoder rewrites keys to snake_case, then both dialects
//!   deserialize through the same wire schema
//! - every slot is optional, so fields missing from a dialect stay `None`

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::device::{DeviceClass, DeviceSn, ModelKey};

/// Wire field naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// camelCase keys (first and second generation hardware)
    Standard,
    /// snake_case keys (third generation hardware)
    SnakeCase,
}

impl Dialect {
    /// The dialect to retry with after a decode failure
    pub fn fallback(self) -> Self {
        match self {
            Self::Standard => Self::SnakeCase,
            Self::SnakeCase => Self::Standard,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::SnakeCase => f.write_str("snake_case"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to decode {dialect} telemetry: {reason}")]
pub struct DecodeFailure {
    pub dialect: Dialect,
    pub reason: String,
}

impl DecodeFailure {
    fn new(dialect: Dialect, reason: impl Into<String>) -> Self {
        Self {
            dialect,
            reason: reason.into(),
        }
    }
}

/// Top-level keys that only the snake_case dialect sends, checked in order
const DOCK_SIGNATURE: &[&str] = &[
    "network_state",
    "drone_in_dock",
    "environment_temperature",
    "drone_charge_state",
];

const DRONE_SIGNATURE: &[&str] = &[
    "position_state",
    "total_flight_distance",
    "horizontal_speed",
    "vertical_speed",
    "payload_bindings",
];

const REMOTE_CONTROL_SIGNATURE: &[&str] = &["capacity_percent", "wireless_link"];

/// Standard-dialect keys whose snake_case spelling is not a mechanical rename
const STANDARD_ALIASES: &[(&str, &str)] = &[("payloads", "payload_bindings")];

pub fn signature_fields(class: DeviceClass) -> &'static [&'static str] {
    match class {
        DeviceClass::Dock => DOCK_SIGNATURE,
        DeviceClass::Drone => DRONE_SIGNATURE,
        DeviceClass::RemoteControl => REMOTE_CONTROL_SIGNATURE,
    }
}

/// Pick the dialect of a decoded payload by its top-level keys
pub fn detect_dialect(payload: &Value, class: DeviceClass) -> Dialect {
    let Some(object) = payload.as_object() else {
        return Dialect::Standard;
    };
    if signature_fields(class)
        .iter()
        .any(|field| object.contains_key(*field))
    {
        Dialect::SnakeCase
    } else {
        Dialect::Standard
    }
}

/// Guess the telemetry class of a payload when the sender is not yet known
pub fn infer_class(payload: &Value) -> Option<DeviceClass> {
    let object = payload.as_object()?;
    let has = |keys: &[&str]| keys.iter().any(|k| object.contains_key(*k));

    if has(&["drone_in_dock", "droneInDock", "network_state", "networkState", "cover_state", "coverState"]) {
        Some(DeviceClass::Dock)
    } else if has(&["attitude_head", "attitudeHead", "mode_code", "modeCode", "battery"]) {
        Some(DeviceClass::Drone)
    } else if has(&["capacity_percent", "capacityPercent", "wireless_link", "wirelessLink"]) {
        Some(DeviceClass::RemoteControl)
    } else {
        None
    }
}

/// Flat, dialect-independent telemetry snapshot
///
/// Field order is fixed, so serializing the same reading always yields the
/// same bytes regardless of which dialect it was decoded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTelemetry {
    // Position
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub height: Option<f64>,
    pub elevation: Option<f64>,
    pub home_distance: Option<f64>,
    // Attitude and motion
    pub attitude_head: Option<f64>,
    pub attitude_pitch: Option<f64>,
    pub attitude_roll: Option<f64>,
    pub horizontal_speed: Option<f64>,
    pub vertical_speed: Option<f64>,
    // Flight state
    pub mode_code: Option<u32>,
    pub gear: Option<u32>,
    pub height_limit: Option<u32>,
    pub rth_altitude: Option<u32>,
    pub total_flight_distance: Option<f64>,
    pub total_flight_time: Option<f64>,
    pub total_flight_sorties: Option<u32>,
    // Battery
    pub battery_percent: Option<u32>,
    pub battery_remain_flight_time: Option<u32>,
    pub battery_return_home_power: Option<u32>,
    pub battery_landing_power: Option<u32>,
    // GNSS fix
    pub gps_number: Option<u32>,
    pub rtk_number: Option<u32>,
    pub position_fixed: Option<u32>,
    pub position_quality: Option<u32>,
    // Link quality
    pub network_type: Option<u32>,
    pub network_quality: Option<u32>,
    pub network_rate: Option<f64>,
    pub sdr_quality: Option<u32>,
    pub lte_quality: Option<u32>,
    pub link_workmode: Option<u32>,
    // Environment
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<u32>,
    pub environment_temperature: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<u32>,
    pub rainfall: Option<u32>,
    // Dock mechanics
    pub drone_in_dock: Option<bool>,
    pub drone_charge_state: Option<u32>,
    pub drone_charge_percent: Option<u32>,
    pub cover_state: Option<u32>,
    pub putter_state: Option<u32>,
    pub supplement_light_state: Option<bool>,
    pub emergency_stop_state: Option<bool>,
    pub alarm_state: Option<bool>,
    pub drc_state: Option<u32>,
    pub flighttask_step_code: Option<u32>,
    pub job_number: Option<u32>,
    // Power
    pub working_voltage: Option<i64>,
    pub working_current: Option<i64>,
    pub electric_supply_voltage: Option<i64>,
    // Lifetime and identity
    pub acc_time: Option<i64>,
    pub activation_time: Option<i64>,
    pub first_power_on: Option<i64>,
    pub firmware_version: Option<String>,
    pub country: Option<String>,
    pub rid_state: Option<bool>,
    pub payload_count: Option<u32>,
    // Sub-device reported by a dock
    pub sub_device_sn: Option<String>,
    pub sub_device_model_key: Option<String>,
    pub sub_device_online: Option<bool>,
}

/// Sub-device status carried inside a dock's telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct SubDeviceReport {
    pub sn: DeviceSn,
    pub online: bool,
    pub model_key: Option<ModelKey>,
}

macro_rules! overlay_slots {
    ($target:expr, $newer:expr; $($slot:ident),+ $(,)?) => {
        $(
            if $newer.$slot.is_some() {
                $target.$slot = $newer.$slot.clone();
            }
        )+
    };
}

impl CanonicalTelemetry {
    /// Overlay the non-null slots of a newer, possibly partial, report
    pub fn merge(&mut self, newer: &CanonicalTelemetry) {
        overlay_slots!(self, newer;
            latitude, longitude, height, elevation, home_distance,
            attitude_head, attitude_pitch, attitude_roll, horizontal_speed, vertical_speed,
            mode_code, gear, height_limit, rth_altitude,
            total_flight_distance, total_flight_time, total_flight_sorties,
            battery_percent, battery_remain_flight_time, battery_return_home_power, battery_landing_power,
            gps_number, rtk_number, position_fixed, position_quality,
            network_type, network_quality, network_rate, sdr_quality, lte_quality, link_workmode,
            wind_speed, wind_direction, environment_temperature, temperature, humidity, rainfall,
            drone_in_dock, drone_charge_state, drone_charge_percent, cover_state, putter_state,
            supplement_light_state, emergency_stop_state, alarm_state, drc_state,
            flighttask_step_code, job_number,
            working_voltage, working_current, electric_supply_voltage,
            acc_time, activation_time, first_power_on, firmware_version, country, rid_state,
            payload_count, sub_device_sn, sub_device_model_key, sub_device_online,
        );
    }

    pub fn sub_device_report(&self) -> Option<SubDeviceReport> {
        let sn = self.sub_device_sn.as_deref()?.trim();
        if sn.is_empty() {
            return None;
        }
        Some(SubDeviceReport {
            sn: DeviceSn::from(sn),
            online: self.sub_device_online?,
            model_key: self.sub_device_model_key.as_deref().and_then(ModelKey::parse),
        })
    }

    /// Canonical JSON encoding
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Output of the normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub telemetry: CanonicalTelemetry,
    pub dialect: Dialect,
}

/// Normalize raw telemetry bytes, sniffing the dialect
pub fn normalize(raw: &[u8], class: DeviceClass) -> Result<Normalized, DecodeFailure> {
    let payload = parse_payload(raw, Dialect::Standard)?;
    normalize_value(&payload, class)
}

/// Normalize an already parsed payload, sniffing the dialect
pub fn normalize_value(payload: &Value, class: DeviceClass) -> Result<Normalized, DecodeFailure> {
    let dialect = detect_dialect(payload, class);
    decode(payload, dialect).map(|telemetry| Normalized { telemetry, dialect })
}

/// Normalize with an explicitly chosen dialect (used for fallback retries)
pub fn normalize_as(raw: &[u8], dialect: Dialect) -> Result<Normalized, DecodeFailure> {
    let payload = parse_payload(raw, dialect)?;
    decode(&payload, dialect).map(|telemetry| Normalized { telemetry, dialect })
}

fn parse_payload(raw: &[u8], dialect: Dialect) -> Result<Value, DecodeFailure> {
    serde_json::from_slice(raw).map_err(|e| DecodeFailure::new(dialect, e.to_string()))
}

fn decode(payload: &Value, dialect: Dialect) -> Result<CanonicalTelemetry, DecodeFailure> {
    if !payload.is_object() {
        return Err(DecodeFailure::new(dialect, "payload is not a JSON object"));
    }
    let wire = match dialect {
        Dialect::SnakeCase => payload.clone(),
        Dialect::Standard => standard_to_snake(payload),
    };
    let report: WireReport =
        serde_json::from_value(wire).map_err(|e| DecodeFailure::new(dialect, e.to_string()))?;
    Ok(report.into_canonical())
}

/// Rewrite every object key of a standard-dialect payload to snake_case
fn standard_to_snake(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut out = Map::with_capacity(object.len());
            for (key, inner) in object {
                let mut key = camel_to_snake(key);
                if let Some((_, alias)) = STANDARD_ALIASES.iter().find(|(from, _)| *from == key) {
                    key = (*alias).to_string();
                }
                out.insert(key, standard_to_snake(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(standard_to_snake).collect()),
        other => other.clone(),
    }
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Booleans arrive as `true`/`false` or as `0`/`1`
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlagRepr {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<FlagRepr>::deserialize(deserializer)? {
        None => None,
        Some(FlagRepr::Bool(b)) => Some(b),
        Some(FlagRepr::Int(i)) => Some(i != 0),
    })
}

// Wire schema, snake_case keys. Shared by both dialects after key normalization.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireReport {
    latitude: Option<f64>,
    longitude: Option<f64>,
    height: Option<f64>,
    elevation: Option<f64>,
    home_distance: Option<f64>,
    attitude_head: Option<f64>,
    attitude_pitch: Option<f64>,
    attitude_roll: Option<f64>,
    horizontal_speed: Option<f64>,
    vertical_speed: Option<f64>,
    mode_code: Option<u32>,
    gear: Option<u32>,
    height_limit: Option<u32>,
    rth_altitude: Option<u32>,
    total_flight_distance: Option<f64>,
    total_flight_time: Option<f64>,
    total_flight_sorties: Option<u32>,
    battery: Option<WireBattery>,
    capacity_percent: Option<u32>,
    position_state: Option<WirePositionState>,
    network_state: Option<WireNetworkState>,
    wireless_link: Option<WireWirelessLink>,
    wind_speed: Option<f64>,
    wind_direction: Option<u32>,
    environment_temperature: Option<f64>,
    temperature: Option<f64>,
    humidity: Option<u32>,
    rainfall: Option<u32>,
    #[serde(deserialize_with = "flag")]
    drone_in_dock: Option<bool>,
    drone_charge_state: Option<WireChargeState>,
    cover_state: Option<u32>,
    putter_state: Option<u32>,
    #[serde(deserialize_with = "flag")]
    supplement_light_state: Option<bool>,
    #[serde(deserialize_with = "flag")]
    emergency_stop_state: Option<bool>,
    #[serde(deserialize_with = "flag")]
    alarm_state: Option<bool>,
    drc_state: Option<u32>,
    flighttask_step_code: Option<u32>,
    job_number: Option<u32>,
    working_voltage: Option<i64>,
    working_current: Option<i64>,
    electric_supply_voltage: Option<i64>,
    acc_time: Option<i64>,
    activation_time: Option<i64>,
    first_power_on: Option<i64>,
    firmware_version: Option<String>,
    country: Option<String>,
    #[serde(deserialize_with = "flag")]
    rid_state: Option<bool>,
    payload_bindings: Option<Vec<Value>>,
    sub_device: Option<WireSubDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireBattery {
    capacity_percent: Option<u32>,
    remain_flight_time: Option<u32>,
    return_home_power: Option<u32>,
    landing_power: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePositionState {
    gps_number: Option<u32>,
    rtk_number: Option<u32>,
    is_fixed: Option<u32>,
    quality: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireNetworkState {
    #[serde(rename = "type")]
    kind: Option<u32>,
    quality: Option<u32>,
    rate: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireWirelessLink {
    sdr_quality: Option<u32>,
    #[serde(rename = "4g_quality")]
    lte_quality: Option<u32>,
    link_workmode: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireChargeState {
    state: Option<u32>,
    capacity_percent: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSubDevice {
    device_sn: Option<String>,
    device_model_key: Option<String>,
    #[serde(deserialize_with = "flag")]
    device_online_status: Option<bool>,
}

impl WireReport {
    fn into_canonical(self) -> CanonicalTelemetry {
        let battery = self.battery.unwrap_or_default();
        let position = self.position_state.unwrap_or_default();
        let network = self.network_state.unwrap_or_default();
        let link = self.wireless_link.unwrap_or_default();
        let charge = self.drone_charge_state.unwrap_or_default();
        let sub_device = self.sub_device.unwrap_or_default();

        CanonicalTelemetry {
            latitude: self.latitude,
            longitude: self.longitude,
            height: self.height,
            elevation: self.elevation,
            home_distance: self.home_distance,
            attitude_head: self.attitude_head,
            attitude_pitch: self.attitude_pitch,
            attitude_roll: self.attitude_roll,
            horizontal_speed: self.horizontal_speed,
            vertical_speed: self.vertical_speed,
            mode_code: self.mode_code,
            gear: self.gear,
            height_limit: self.height_limit,
            rth_altitude: self.rth_altitude,
            total_flight_distance: self.total_flight_distance,
            total_flight_time: self.total_flight_time,
            total_flight_sorties: self.total_flight_sorties,
            // Remote controllers report their own charge at the top level
            battery_percent: battery.capacity_percent.or(self.capacity_percent),
            battery_remain_flight_time: battery.remain_flight_time,
            battery_return_home_power: battery.return_home_power,
            battery_landing_power: battery.landing_power,
            gps_number: position.gps_number,
            rtk_number: position.rtk_number,
            position_fixed: position.is_fixed,
            position_quality: position.quality,
            network_type: network.kind,
            network_quality: network.quality,
            network_rate: network.rate,
            sdr_quality: link.sdr_quality,
            lte_quality: link.lte_quality,
            link_workmode: link.link_workmode,
            wind_speed: self.wind_speed,
            wind_direction: self.wind_direction,
            environment_temperature: self.environment_temperature,
            temperature: self.temperature,
            humidity: self.humidity,
            rainfall: self.rainfall,
            drone_in_dock: self.drone_in_dock,
            drone_charge_state: charge.state,
            drone_charge_percent: charge.capacity_percent,
            cover_state: self.cover_state,
            putter_state: self.putter_state,
            supplement_light_state: self.supplement_light_state,
            emergency_stop_state: self.emergency_stop_state,
            alarm_state: self.alarm_state,
            drc_state: self.drc_state,
            flighttask_step_code: self.flighttask_step_code,
            job_number: self.job_number,
            working_voltage: self.working_voltage,
            working_current: self.working_current,
            electric_supply_voltage: self.electric_supply_voltage,
            acc_time: self.acc_time,
            activation_time: self.activation_time,
            first_power_on: self.first_power_on,
            firmware_version: self.firmware_version,
            country: self.country,
            rid_state: self.rid_state,
            payload_count: self
                .payload_bindings
                .map(|p| u32::try_from(p.len()).unwrap_or(u32::MAX)),
            sub_device_sn: sub_device.device_sn,
            sub_device_model_key: sub_device.device_model_key,
            sub_device_online: sub_device.device_online_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCK_STANDARD: &str = r#"{
        "networkState": {"type": 2, "quality": 4, "rate": 12.5},
        "droneInDock": 1,
        "droneChargeState": {"state": 0, "capacityPercent": 87},
        "environmentTemperature": 21.5,
        "temperature": 24.0,
        "humidity": 40,
        "rainfall": 0,
        "windSpeed": 3.2,
        "latitude": 22.579,
        "longitude": 113.937,
        "height": 61.2,
        "modeCode": 0,
        "coverState": 0,
        "putterState": 0,
        "emergencyStopState": false,
        "alarmState": 0,
        "drcState": 0,
        "subDevice": {"deviceSn": "1581F6Q8D", "deviceModelKey": "0-91-1", "deviceOnlineStatus": 1},
        "wirelessLink": {"sdrQuality": 5, "4gQuality": 3, "linkWorkmode": 1}
    }"#;

    const DOCK_SNAKE: &str = r#"{
        "network_state": {"type": 2, "quality": 4, "rate": 12.5},
        "drone_in_dock": true,
        "drone_charge_state": {"state": 0, "capacity_percent": 87},
        "environment_temperature": 21.5,
        "temperature": 24.0,
        "humidity": 40,
        "rainfall": 0,
        "wind_speed": 3.2,
        "latitude": 22.579,
        "longitude": 113.937,
        "height": 61.2,
        "mode_code": 0,
        "cover_state": 0,
        "putter_state": 0,
        "emergency_stop_state": 0,
        "alarm_state": false,
        "drc_state": 0,
        "sub_device": {"device_sn": "1581F6Q8D", "device_model_key": "0-91-1", "device_online_status": true},
        "wireless_link": {"sdr_quality": 5, "4g_quality": 3, "link_workmode": 1}
    }"#;

    const DRONE_STANDARD: &str = r#"{
        "attitudeHead": 90.5, "attitudePitch": 0.0, "attitudeRoll": -1.5,
        "horizontalSpeed": 4.2, "verticalSpeed": 0.3,
        "latitude": 22.58, "longitude": 113.94, "height": 120.0, "elevation": 58.8,
        "modeCode": 5, "gear": 1,
        "battery": {"capacityPercent": 76, "remainFlightTime": 1200, "returnHomePower": 20, "landingPower": 10},
        "positionState": {"gpsNumber": 18, "rtkNumber": 30, "isFixed": 2, "quality": 5},
        "totalFlightDistance": 10234.5, "totalFlightTime": 36000,
        "payloads": [{"payloadIndex": "81-0-0"}],
        "firmwareVersion": "10.01.0305"
    }"#;

    const DRONE_SNAKE: &str = r#"{
        "attitude_head": 90.5, "attitude_pitch": 0.0, "attitude_roll": -1.5,
        "horizontal_speed": 4.2, "vertical_speed": 0.3,
        "latitude": 22.58, "longitude": 113.94, "height": 120.0, "elevation": 58.8,
        "mode_code": 5, "gear": 1,
        "battery": {"capacity_percent": 76, "remain_flight_time": 1200, "return_home_power": 20, "landing_power": 10},
        "position_state": {"gps_number": 18, "rtk_number": 30, "is_fixed": 2, "quality": 5},
        "total_flight_distance": 10234.5, "total_flight_time": 36000,
        "payload_bindings": [{"payload_index": "81-0-0"}],
        "firmware_version": "10.01.0305"
    }"#;

    #[test]
    fn test_detects_dialect_by_signature() {
        let standard: Value = serde_json::from_str(DOCK_STANDARD).unwrap();
        let snake: Value = serde_json::from_str(DOCK_SNAKE).unwrap();
        assert_eq!(detect_dialect(&standard, DeviceClass::Dock), Dialect::Standard);
        assert_eq!(detect_dialect(&snake, DeviceClass::Dock), Dialect::SnakeCase);

        // A single signature key is enough
        let partial = serde_json::json!({"latitude": 1.0, "vertical_speed": 0.1});
        assert_eq!(detect_dialect(&partial, DeviceClass::Drone), Dialect::SnakeCase);
    }

    #[test]
    fn test_dock_dialects_are_byte_identical() {
        let a = normalize(DOCK_STANDARD.as_bytes(), DeviceClass::Dock).unwrap();
        let b = normalize(DOCK_SNAKE.as_bytes(), DeviceClass::Dock).unwrap();
        assert_eq!(a.dialect, Dialect::Standard);
        assert_eq!(b.dialect, Dialect::SnakeCase);
        assert_eq!(a.telemetry, b.telemetry);
        assert_eq!(
            serde_json::to_string(&a.telemetry).unwrap(),
            serde_json::to_string(&b.telemetry).unwrap()
        );
        assert_eq!(a.telemetry.drone_in_dock, Some(true));
        assert_eq!(a.telemetry.drone_charge_percent, Some(87));
        assert_eq!(a.telemetry.lte_quality, Some(3));
        assert_eq!(a.telemetry.emergency_stop_state, Some(false));
    }

    #[test]
    fn test_drone_dialects_are_byte_identical() {
        let a = normalize(DRONE_STANDARD.as_bytes(), DeviceClass::Drone).unwrap();
        let b = normalize(DRONE_SNAKE.as_bytes(), DeviceClass::Drone).unwrap();
        assert_eq!(
            serde_json::to_string(&a.telemetry).unwrap(),
            serde_json::to_string(&b.telemetry).unwrap()
        );
        assert_eq!(a.telemetry.battery_percent, Some(76));
        assert_eq!(a.telemetry.gps_number, Some(18));
        assert_eq!(a.telemetry.payload_count, Some(1));
        assert_eq!(a.telemetry.mode_code, Some(5));
    }

    #[test]
    fn test_remote_control_dialects_are_byte_identical() {
        let standard = br#"{
            "capacityPercent": 62,
            "wirelessLink": {"sdrQuality": 4, "4gQuality": 2, "linkWorkmode": 0},
            "latitude": 22.58, "longitude": 113.94, "height": 12.0
        }"#;
        let snake = br#"{
            "capacity_percent": 62,
            "wireless_link": {"sdr_quality": 4, "4g_quality": 2, "link_workmode": 0},
            "latitude": 22.58, "longitude": 113.94, "height": 12.0
        }"#;
        let a = normalize(standard, DeviceClass::RemoteControl).unwrap();
        let b = normalize(snake, DeviceClass::RemoteControl).unwrap();
        assert_eq!(a.dialect, Dialect::Standard);
        assert_eq!(b.dialect, Dialect::SnakeCase);
        assert_eq!(
            serde_json::to_string(&a.telemetry).unwrap(),
            serde_json::to_string(&b.telemetry).unwrap()
        );
        assert_eq!(a.telemetry.battery_percent, Some(62));
        assert_eq!(a.telemetry.sdr_quality, Some(4));
        assert_eq!(a.telemetry.lte_quality, Some(2));
        assert_eq!(a.telemetry.link_workmode, Some(0));
    }

    #[test]
    fn test_missing_fields_stay_null() {
        let rc = normalize(br#"{"latitude": 1.5, "capacityPercent": 55}"#, DeviceClass::RemoteControl).unwrap();
        assert_eq!(rc.dialect, Dialect::Standard);
        assert_eq!(rc.telemetry.battery_percent, Some(55));
        assert_eq!(rc.telemetry.longitude, None);
        assert_eq!(rc.telemetry.sdr_quality, None);
    }

    #[test]
    fn test_malformed_payload_reports_failure() {
        let err = normalize(br#"{"latitude": "north"}"#, DeviceClass::Drone).unwrap_err();
        assert_eq!(err.dialect, Dialect::Standard);

        let err = normalize(b"not json", DeviceClass::Drone).unwrap_err();
        assert!(!err.reason.is_empty());

        let err = normalize(b"[1, 2]", DeviceClass::Dock).unwrap_err();
        assert!(err.reason.contains("object"));
    }

    #[test]
    fn test_fallback_dialect_retry() {
        let raw = br#"{"vertical_speed": "fast"}"#;
        let err = normalize(raw, DeviceClass::Drone).unwrap_err();
        assert_eq!(err.dialect, Dialect::SnakeCase);
        assert!(normalize_as(raw, err.dialect.fallback()).is_err());

        // Sniffed as snake_case, but the nested battery object is camelCase
        let raw = br#"{"vertical_speed": 0.5, "battery": {"capacityPercent": 40}}"#;
        let sniffed = normalize(raw, DeviceClass::Drone).unwrap();
        assert_eq!(sniffed.telemetry.battery_percent, None);
        let retried = normalize_as(raw, Dialect::Standard).unwrap();
        assert_eq!(retried.telemetry.battery_percent, Some(40));
        assert_eq!(retried.telemetry.vertical_speed, Some(0.5));
    }

    #[test]
    fn test_merge_keeps_last_known_slots() {
        let mut cached = normalize(DOCK_STANDARD.as_bytes(), DeviceClass::Dock).unwrap().telemetry;
        let partial = normalize(br#"{"drcState": 2}"#, DeviceClass::Dock).unwrap().telemetry;
        cached.merge(&partial);
        assert_eq!(cached.drc_state, Some(2));
        assert_eq!(cached.humidity, Some(40));
    }

    #[test]
    fn test_merge_covers_every_slot() {
        let full = normalize(DOCK_STANDARD.as_bytes(), DeviceClass::Dock).unwrap().telemetry;
        let mut empty = CanonicalTelemetry::default();
        empty.merge(&full);
        assert_eq!(empty, full);

        let drone = normalize(DRONE_SNAKE.as_bytes(), DeviceClass::Drone).unwrap().telemetry;
        let mut empty = CanonicalTelemetry::default();
        empty.merge(&drone);
        assert_eq!(empty, drone);
    }

    #[test]
    fn test_sub_device_report() {
        let dock = normalize(DOCK_SNAKE.as_bytes(), DeviceClass::Dock).unwrap().telemetry;
        let report = dock.sub_device_report().unwrap();
        assert_eq!(report.sn.as_str(), "1581F6Q8D");
        assert!(report.online);
        assert_eq!(report.model_key.unwrap().to_string(), "0-91-1");

        assert!(CanonicalTelemetry::default().sub_device_report().is_none());
    }

    #[test]
    fn test_infer_class() {
        let dock: Value = serde_json::from_str(DOCK_SNAKE).unwrap();
        let drone: Value = serde_json::from_str(DRONE_STANDARD).unwrap();
        assert_eq!(infer_class(&dock), Some(DeviceClass::Dock));
        assert_eq!(infer_class(&drone), Some(DeviceClass::Drone));
        assert_eq!(infer_class(&serde_json::json!({"capacity_percent": 3})), Some(DeviceClass::RemoteControl));
        assert_eq!(infer_class(&serde_json::json!({"foo": 1})), None);
    }

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake("environmentTemperature"), "environment_temperature");
        assert_eq!(camel_to_snake("4gQuality"), "4g_quality");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }
}
