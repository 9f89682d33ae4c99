//! Device types for tracking docks, remote controls and drones

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier for a device: the serial number it reports on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSn(pub String);

impl DeviceSn {
    pub fn new(sn: impl Into<String>) -> Self {
        Self(sn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for DeviceSn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceSn {
    fn from(sn: &str) -> Self {
        Self(sn.to_string())
    }
}

impl From<String> for DeviceSn {
    fn from(sn: String) -> Self {
        Self(sn)
    }
}

/// Hardware domain of a device. Encoded on the wire as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceDomain {
    /// Aircraft; the only domain that attaches to a gateway as a sub-device
    Drone,
    /// Camera or other payload mounted on a drone
    Payload,
    /// Remote controller, a handheld gateway
    RemoteControl,
    /// Docking station, a fixed gateway
    Dock,
}

impl DeviceDomain {
    pub fn code(self) -> u32 {
        match self {
            Self::Drone => 0,
            Self::Payload => 1,
            Self::RemoteControl => 2,
            Self::Dock => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Drone),
            1 => Some(Self::Payload),
            2 => Some(Self::RemoteControl),
            3 => Some(Self::Dock),
            _ => None,
        }
    }

    /// Docks and remote controllers can host an attached sub-device
    pub fn is_gateway(self) -> bool {
        matches!(self, Self::RemoteControl | Self::Dock)
    }

    pub fn is_sub_device(self) -> bool {
        matches!(self, Self::Drone)
    }
}

impl std::fmt::Display for DeviceDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Drone => "drone",
            Self::Payload => "payload",
            Self::RemoteControl => "remote-control",
            Self::Dock => "dock",
        };
        f.write_str(name)
    }
}

impl Serialize for DeviceDomain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for DeviceDomain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = numeric_code(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown device domain {}", code)))
    }
}

/// Wire codes arrive either as JSON numbers or as numeric strings ("3")
#[derive(Deserialize)]
#[serde(untagged)]
enum NumericRepr {
    Int(u64),
    Text(String),
}

/// Deserialize a numeric code that may be sent as a number or a string
pub fn numeric_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = match NumericRepr::deserialize(deserializer)? {
        NumericRepr::Int(v) => v,
        NumericRepr::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric code {:?}", s)))?,
    };
    u32::try_from(value).map_err(|_| serde::de::Error::custom(format!("code {} out of range", value)))
}

/// Known device type codes for gateway hardware
pub mod codes {
    pub const DOCK: u32 = 1;
    pub const DOCK2: u32 = 2;
    pub const DOCK3: u32 = 3;
    pub const RC: u32 = 56;
    pub const RC_PLUS: u32 = 119;
    pub const RC_PRO: u32 = 144;
    pub const RC_PRO_TWO: u32 = 174;
}

/// Hardware model key: domain, type and subtype, rendered as "domain-type-subtype"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub domain: DeviceDomain,
    pub device_type: u32,
    pub sub_type: u32,
}

impl ModelKey {
    pub fn new(domain: DeviceDomain, device_type: u32, sub_type: u32) -> Self {
        Self {
            domain,
            device_type,
            sub_type,
        }
    }

    /// Parse a "domain-type-subtype" key such as "0-91-1"
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.trim().split('-');
        let domain = DeviceDomain::from_code(parts.next()?.parse().ok()?)?;
        let device_type = parts.next()?.parse().ok()?;
        let sub_type = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(domain, device_type, sub_type))
    }

    /// Which gateway family this model belongs to, if any
    pub fn gateway_kind(&self) -> Option<GatewayKind> {
        match (self.domain, self.device_type) {
            (DeviceDomain::Dock, codes::DOCK) => Some(GatewayKind::Dock),
            (DeviceDomain::Dock, codes::DOCK2) => Some(GatewayKind::Dock2),
            (DeviceDomain::Dock, codes::DOCK3) => Some(GatewayKind::Dock3),
            (DeviceDomain::RemoteControl, codes::RC | codes::RC_PLUS | codes::RC_PRO | codes::RC_PRO_TWO) => {
                Some(GatewayKind::RemoteControl)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain.code(), self.device_type, self.sub_type)
    }
}

/// Gateway hardware families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    RemoteControl,
    Dock,
    Dock2,
    Dock3,
}

/// Telemetry class of a device, used to pick the dialect signature set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Dock,
    Drone,
    RemoteControl,
}

impl DeviceClass {
    /// Payloads do not report their own telemetry stream
    pub fn from_domain(domain: DeviceDomain) -> Option<Self> {
        match domain {
            DeviceDomain::Dock => Some(Self::Dock),
            DeviceDomain::Drone => Some(Self::Drone),
            DeviceDomain::RemoteControl => Some(Self::RemoteControl),
            DeviceDomain::Payload => None,
        }
    }

    pub fn domain(self) -> DeviceDomain {
        match self {
            Self::Dock => DeviceDomain::Dock,
            Self::Drone => DeviceDomain::Drone,
            Self::RemoteControl => DeviceDomain::RemoteControl,
        }
    }
}

/// Logical presence state derived from a stored device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalState {
    /// No record exists yet
    Unknown,
    Offline,
    /// Online but not assigned to a workspace
    OnlineUnbound,
    OnlineBound,
}

impl Default for LogicalState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl LogicalState {
    pub fn is_online(self) -> bool {
        matches!(self, Self::OnlineUnbound | Self::OnlineBound)
    }
}

/// A device known to the presence core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Serial number
    pub sn: DeviceSn,
    /// Hardware domain
    pub domain: DeviceDomain,
    /// Hardware type code
    pub device_type: u32,
    /// Hardware subtype code
    pub sub_type: u32,
    /// Thing-model version reported by the firmware
    pub thing_version: Option<String>,
    /// Firmware version from the device's state reports
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Gateway this device is attached to (sub-devices only)
    pub parent_sn: Option<DeviceSn>,
    /// Sub-device attached to this gateway
    pub child_device_sn: Option<DeviceSn>,
    /// Workspace the device is bound to
    pub workspace_id: Option<String>,
    /// Whether the device is currently online
    pub online: bool,
    /// Whether the device has been bound to a workspace
    pub bound: bool,
    /// Control source index announced with the sub-device (e.g. "A")
    pub control_source: Option<String>,
    /// Last time the device (re)announced itself
    pub login_time: DateTime<Utc>,
}

impl Device {
    /// Create an offline, unbound device with minimal information
    pub fn new(sn: DeviceSn, key: ModelKey, now: DateTime<Utc>) -> Self {
        Self {
            sn,
            domain: key.domain,
            device_type: key.device_type,
            sub_type: key.sub_type,
            thing_version: None,
            firmware_version: None,
            parent_sn: None,
            child_device_sn: None,
            workspace_id: None,
            online: false,
            bound: false,
            control_source: None,
            login_time: now,
        }
    }

    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.domain, self.device_type, self.sub_type)
    }

    pub fn is_gateway(&self) -> bool {
        self.domain.is_gateway()
    }

    /// Workspace id, ignoring blank values
    pub fn workspace(&self) -> Option<&str> {
        self.workspace_id
            .as_deref()
            .filter(|ws| !ws.trim().is_empty())
    }

    pub fn state(&self) -> LogicalState {
        match (self.online, self.workspace().is_some()) {
            (false, _) => LogicalState::Offline,
            (true, false) => LogicalState::OnlineUnbound,
            (true, true) => LogicalState::OnlineBound,
        }
    }

    /// Bind the device to a workspace
    pub fn bind(&mut self, workspace_id: &str) {
        self.workspace_id = Some(workspace_id.to_string());
        self.bound = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drone_key() -> ModelKey {
        ModelKey::new(DeviceDomain::Drone, 91, 1)
    }

    #[test]
    fn test_model_key_round_trip() {
        let key = ModelKey::parse("3-3-0").unwrap();
        assert_eq!(key.domain, DeviceDomain::Dock);
        assert_eq!(key.to_string(), "3-3-0");
        assert_eq!(key.gateway_kind(), Some(GatewayKind::Dock3));
        assert!(ModelKey::parse("3-3").is_none());
        assert!(ModelKey::parse("9-1-0").is_none());
    }

    #[test]
    fn test_domain_accepts_string_codes() {
        let domain: DeviceDomain = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(domain, DeviceDomain::RemoteControl);
        let domain: DeviceDomain = serde_json::from_str("3").unwrap();
        assert_eq!(domain, DeviceDomain::Dock);
        assert!(serde_json::from_str::<DeviceDomain>("7").is_err());
    }

    #[test]
    fn test_rc_family_is_gateway() {
        let key = ModelKey::new(DeviceDomain::RemoteControl, codes::RC_PLUS, 0);
        assert_eq!(key.gateway_kind(), Some(GatewayKind::RemoteControl));
        assert!(drone_key().gateway_kind().is_none());
    }

    #[test]
    fn test_device_state() {
        let mut device = Device::new(DeviceSn::from("1581F5BMD"), drone_key(), Utc::now());
        assert_eq!(device.state(), LogicalState::Offline);
        device.online = true;
        assert_eq!(device.state(), LogicalState::OnlineUnbound);
        device.workspace_id = Some("  ".to_string());
        assert_eq!(device.state(), LogicalState::OnlineUnbound);
        device.bind("ws-1");
        assert_eq!(device.state(), LogicalState::OnlineBound);
        assert!(device.bound);
    }
}
