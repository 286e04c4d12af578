use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// Source reserved for control messages sent by devices to the broker.
pub const SOURCE_DEVICE: &str = "device";
/// Source used for every message the broker itself emits.
pub const SOURCE_SYSTEM: &str = "system";

pub const CONSOLE_NAME: &str = "Admin Console";
pub const DISPLAY_NAME: &str = "Projector";
pub const DEFAULT_HANDHELD_MODEL: &str = "Mobile Device";
pub const CONSOLE_LOST_REASON: &str = "console disconnected unexpectedly";

/// Broker-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Accepts a JSON number or a numeric string; clients built on query
    /// strings tend to send the latter.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_u64().map(Self),
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid session id: {value}")))
    }
}

/// The three participant kinds a connection can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    #[serde(rename = "admin_console")]
    Console,
    #[serde(rename = "projector")]
    Display,
    #[serde(rename = "mobile")]
    Handheld,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Console => "admin_console",
            DeviceRole::Display => "projector",
            DeviceRole::Handheld => "mobile",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "admin_console" => Some(DeviceRole::Console),
            "projector" => Some(DeviceRole::Display),
            "mobile" => Some(DeviceRole::Handheld),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ source, event, payload? }`, the only shape on the wire in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(source: impl Into<String>, event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            source: source.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn system(event: &str, payload: Option<Value>) -> Self {
        Self::new(SOURCE_SYSTEM, event, payload)
    }

    /// Returns `None` for anything that is not JSON or lacks a non-empty
    /// `source` and `event`.
    pub fn parse(text: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        if envelope.source.is_empty() || envelope.event.is_empty() {
            return None;
        }
        Some(envelope)
    }

    pub fn is_from_device(&self) -> bool {
        self.source == SOURCE_DEVICE
    }
}

/// Control events in the reserved `device` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Handshake,
    AppLaunched,
    CurrentAppClosed,
}

impl ControlEvent {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "handshake" => Some(ControlEvent::Handshake),
            "app_launched" => Some(ControlEvent::AppLaunched),
            "current_app_closed" => Some(ControlEvent::CurrentAppClosed),
            _ => None,
        }
    }
}

/// Reasons carried by `access_denied`. The strings are part of the protocol
/// and clients match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidToken,
    MissingAccessToken,
    SessionLimitReached,
    InvalidSession,
    DisplayAlreadyConnected,
    UnknownDeviceType,
    AlreadyAuthorized,
    Unauthorized,
    AppNotLaunched,
    LaunchRequiresConsole,
    CloseRequiresConsole,
    SessionReserved,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::InvalidToken => "Invalid token.",
            DenyReason::MissingAccessToken => "No access token was provided.",
            DenyReason::SessionLimitReached => "Maximum count of sessions has been reached.",
            DenyReason::InvalidSession => "Invalid session identifier.",
            DenyReason::DisplayAlreadyConnected => "Projector already connected.",
            DenyReason::UnknownDeviceType => "Unknown device type.",
            DenyReason::AlreadyAuthorized => "Handshake already performed.",
            DenyReason::Unauthorized => "Unauthorized.",
            DenyReason::AppNotLaunched => "This app is not launched.",
            DenyReason::LaunchRequiresConsole => {
                "Applications can only be launched from the admin console."
            }
            DenyReason::CloseRequiresConsole => {
                "Applications can only be closed from the admin console."
            }
            DenyReason::SessionReserved => "Session is already reserved by different app.",
        }
    }

    /// Short label used for metrics.
    pub fn metric_label(self) -> &'static str {
        match self {
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::MissingAccessToken => "missing_token",
            DenyReason::SessionLimitReached => "session_limit",
            DenyReason::InvalidSession => "invalid_session",
            DenyReason::DisplayAlreadyConnected => "display_taken",
            DenyReason::UnknownDeviceType => "unknown_device_type",
            DenyReason::AlreadyAuthorized => "already_authorized",
            DenyReason::Unauthorized => "unauthorized",
            DenyReason::AppNotLaunched => "app_not_launched",
            DenyReason::LaunchRequiresConsole => "launch_requires_console",
            DenyReason::CloseRequiresConsole => "close_requires_console",
            DenyReason::SessionReserved => "session_reserved",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `device/handshake` message. Unknown or mistyped fields are
/// tolerated and surface as `None`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_session_id")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub device_model: Option<String>,
}

impl HandshakeRequest {
    pub fn from_payload(payload: Option<Value>) -> Self {
        payload
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn role(&self) -> Option<DeviceRole> {
        self.device_type.as_deref().and_then(DeviceRole::from_wire)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn device_model(&self) -> &str {
        self.device_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(DEFAULT_HANDHELD_MODEL)
    }
}

fn lenient_session_id<'de, D>(deserializer: D) -> Result<Option<SessionId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(SessionId::from_value))
}

/// Payload of a `device/app_launched` message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
}

impl LaunchRequest {
    pub fn from_payload(payload: Option<Value>) -> Self {
        payload
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn args(&self) -> Value {
        match &self.args {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(args) => args.clone(),
        }
    }
}

pub fn access_granted(payload: Option<Value>) -> Envelope {
    Envelope::system("access_granted", payload)
}

pub fn access_denied(reason: DenyReason) -> Envelope {
    Envelope::system("access_denied", Some(json!({ "reason": reason.as_str() })))
}

pub fn device_connected(role: DeviceRole, name: Option<&str>) -> Envelope {
    Envelope::system("device_connected", Some(device_payload(role, name)))
}

pub fn device_disconnected(role: DeviceRole, name: Option<&str>) -> Envelope {
    Envelope::system("device_disconnected", Some(device_payload(role, name)))
}

fn device_payload(role: DeviceRole, name: Option<&str>) -> Value {
    let mut payload = Map::new();
    payload.insert("deviceType".into(), Value::from(role.as_str()));
    if let Some(name) = name {
        payload.insert("deviceName".into(), Value::from(name));
    }
    Value::Object(payload)
}

pub fn app_launched(name: &str, args: &Value) -> Envelope {
    Envelope::system("app_launched", Some(json!({ "name": name, "args": args })))
}

pub fn current_app_closed() -> Envelope {
    Envelope::system("current_app_closed", Some(json!({})))
}

pub fn session_terminated(reason: &str) -> Envelope {
    Envelope::system("session_terminated", Some(json!({ "reason": reason })))
}

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Envelope),
    Close,
}
