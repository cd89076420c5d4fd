//! Frame types exchanged with a device over its LAN WebSocket.
//!
//! Every WebSocket text message is one JSON object.  Most carry an `action`
//! key naming the frame type; the device's reply to the handshake does not,
//! and is recognised by its `deviceid` key instead.  The `action` key itself is
//! added and removed by the [codec](super::codec), so the structs here only
//! model the remaining body.
//!
//! ```text
//! client → device   {"action":"userOnline","version":6,"nonce":"…","apikey":"nonce",…}
//! device → client   {"error":0,"apikey":"…","sequence":"1548124045842","deviceid":"100060af40"}
//! device → client   {"action":"update","userAgent":"device","deviceid":"100060af40","params":{"switch":"off"}}
//! client → device   {"action":"update","userAgent":"app","deviceid":"100060af40","params":{"switch":"on"},…}
//! ```

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::device::Params;

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 6;

/// Port devices listen on in LAN mode.
pub const DEFAULT_PORT: u16 = 8081;

/// WebSocket endpoint path on the device.
pub const DEFAULT_ENDPOINT: &str = "/";

/// `controlType` sent with commands when the device never reported one.
pub const DEFAULT_CONTROL_TYPE: u64 = 4;

pub const ACTION_USER_ONLINE: &str = "userOnline";
pub const ACTION_UPDATE: &str = "update";

/// Originator of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgent {
    #[default]
    App,
    Device,
    #[serde(other)]
    Other,
}

/// Session-opening handshake sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineFrame {
    #[serde(default)]
    pub user_agent: UserAgent,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Random 15-digit string.
    #[serde(default)]
    pub nonce: String,
    pub apikey: String,
    /// Unix seconds, sent as a string.
    #[serde(default, deserialize_with = "string_or_number")]
    pub ts: String,
    #[serde(deserialize_with = "string_or_number")]
    pub sequence: String,
    /// The wire key is misspelt by the official app and devices expect it.
    #[serde(rename = "apkVesrion", default, skip_serializing_if = "Option::is_none")]
    pub apk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_version: Option<String>,
}

/// State report (device → client) or state command (client → device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFrame {
    #[serde(default)]
    pub user_agent: UserAgent,
    #[serde(rename = "deviceid")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_apikey: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub sequence: Option<String>,
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<u64>,
    #[serde(
        default,
        deserialize_with = "opt_lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub ts: Option<u64>,
}

impl UpdateFrame {
    /// Builds an outgoing command frame.
    pub fn command(
        device_id: impl Into<String>,
        apikey: impl Into<String>,
        sequence: u64,
        params: Params,
        control_type: u64,
        ts: u64,
    ) -> Self {
        let apikey = apikey.into();
        Self {
            user_agent: UserAgent::App,
            device_id: device_id.into(),
            self_apikey: Some(apikey.clone()),
            apikey: Some(apikey),
            sequence: Some(sequence.to_string()),
            params,
            control_type: Some(control_type),
            ts: Some(ts),
        }
    }
}

/// Keepalive preferences a device may attach to its hello reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloConfig {
    /// `1` when the device wants heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hb: Option<u8>,
    /// Heartbeat interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hb_interval: Option<u64>,
}

impl HelloConfig {
    /// The requested heartbeat interval, unless heartbeats are disabled or
    /// the interval is zero.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        if self.hb == Some(0) {
            return None;
        }
        self.hb_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// The device's reply to the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloFrame {
    #[serde(default)]
    pub error: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub sequence: Option<String>,
    pub deviceid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<HelloConfig>,
}

impl HelloFrame {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.config.as_ref().and_then(HelloConfig::keepalive_interval)
    }
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    UserOnline(UserOnlineFrame),
    Update(UpdateFrame),
    Hello(HelloFrame),
    /// A frame with an `action` this client does not handle.
    Unknown { action: String, body: Value },
}

impl Frame {
    /// Short name for logging.
    pub fn kind(&self) -> &str {
        match self {
            Frame::UserOnline(_) => ACTION_USER_ONLINE,
            Frame::Update(_) => ACTION_UPDATE,
            Frame::Hello(_) => "hello",
            Frame::Unknown { action, .. } => action,
        }
    }

    /// The device the frame refers to, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Frame::Update(update) => Some(&update.device_id),
            Frame::Hello(hello) => Some(&hello.deviceid),
            Frame::Unknown { body, .. } => body.get("deviceid").and_then(Value::as_str),
            Frame::UserOnline(_) => None,
        }
    }
}

// ── serde helpers ────────────────────────────────────────────────────────────

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Devices send sequence numbers and timestamps as strings, some firmware as
/// numbers; both become strings.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, got {n}"))),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected numeric string, got {s:?}"))),
        Some(other) => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}
