//! JSON codec for device frames.
//!
//! Each frame is a single WebSocket text message holding one JSON object.
//! Decoding dispatches on the `action` key:
//!
//! | `action`       | Frame                    |
//! |----------------|--------------------------|
//! | `"userOnline"` | [`Frame::UserOnline`]    |
//! | `"update"`     | [`Frame::Update`]        |
//! | absent         | [`Frame::Hello`] (needs `deviceid`) |
//! | anything else  | [`Frame::Unknown`]       |
//!
//! A frame that fails to decode is reported as a [`ProtocolError`]; callers
//! drop it and keep the connection open.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::frame::{Frame, ACTION_UPDATE, ACTION_USER_ONLINE};

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload is not a JSON object or its body does not fit the frame type.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A field required by the frame type is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field is present but has an unusable value.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A binary message did not contain UTF-8 text.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Serialization of an outgoing frame failed.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Returns `true` for errors caused by inbound data.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ProtocolError::Encode(_))
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one text message into a [`Frame`].
///
/// # Errors
///
/// Returns [`ProtocolError`] if the text is not a JSON object, lacks the
/// fields its frame type requires, or carries invalid values (including a
/// `params` bag holding both `switch` and `switches`).
///
/// # Examples
///
/// ```rust
/// use sonoff_core::{decode_frame, Frame};
///
/// let frame = decode_frame(r#"{"error":0,"deviceid":"100060af40"}"#).unwrap();
/// assert!(matches!(frame, Frame::Hello(_)));
/// ```
pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    let Value::Object(mut body) = value else {
        return Err(ProtocolError::MalformedFrame(
            "frame is not a JSON object".to_string(),
        ));
    };

    let action = match body.remove("action") {
        Some(Value::String(action)) => Some(action),
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "action",
                reason: format!("expected string, got {other}"),
            })
        }
        None => None,
    };

    match action {
        Some(action) if action == ACTION_USER_ONLINE => {
            require(&body, &["apikey", "sequence"])?;
            decode_body(body, ACTION_USER_ONLINE).map(Frame::UserOnline)
        }
        Some(action) if action == ACTION_UPDATE => {
            require(&body, &["deviceid", "params"])?;
            decode_body(body, ACTION_UPDATE).map(Frame::Update)
        }
        Some(action) => Ok(Frame::Unknown {
            action,
            body: Value::Object(body),
        }),
        None if body.contains_key("deviceid") => decode_body(body, "hello").map(Frame::Hello),
        None => Err(ProtocolError::MissingField("action")),
    }
}

/// Decodes a binary WebSocket message.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidUtf8`] for non-UTF-8 payloads, otherwise
/// as [`decode_frame`].
pub fn decode_frame_bytes(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode_frame(text)
}

/// Encodes a [`Frame`] as one JSON text message.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the frame body does not serialize to
/// a JSON object.
///
/// # Examples
///
/// ```rust
/// use sonoff_core::protocol::{decode_frame, encode_frame, Frame, UpdateFrame};
/// use sonoff_core::{Params, SwitchState};
///
/// let frame = Frame::Update(UpdateFrame::command(
///     "100060af40", "nonce", 1, Params::single(SwitchState::On), 4, 0,
/// ));
/// let text = encode_frame(&frame).unwrap();
/// assert_eq!(decode_frame(&text).unwrap(), frame);
/// ```
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    let (action, body) = match frame {
        Frame::UserOnline(f) => (Some(ACTION_USER_ONLINE), to_object(f)?),
        Frame::Update(f) => (Some(ACTION_UPDATE), to_object(f)?),
        Frame::Hello(f) => (None, to_object(f)?),
        Frame::Unknown { action, body } => {
            let mut body = match body {
                Value::Object(map) => map.clone(),
                Value::Null => Map::new(),
                _ => {
                    return Err(ProtocolError::Encode(format!(
                        "body of `{action}` frame is not an object"
                    )))
                }
            };
            body.insert("action".to_string(), Value::String(action.clone()));
            return serialize(body);
        }
    };

    let mut body = body;
    if let Some(action) = action {
        body.insert("action".to_string(), Value::String(action.to_string()));
    }
    serialize(body)
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn require(body: &Map<String, Value>, fields: &[&'static str]) -> Result<(), ProtocolError> {
    match fields.iter().find(|field| !body.contains_key(**field)) {
        Some(field) => Err(ProtocolError::MissingField(field)),
        None => Ok(()),
    }
}

fn decode_body<T: DeserializeOwned>(
    body: Map<String, Value>,
    kind: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(body))
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid {kind} frame: {e}")))
}

fn to_object<T: serde::Serialize>(body: &T) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(body).map_err(|e| ProtocolError::Encode(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::Encode(format!(
            "frame body serialized to non-object {other}"
        ))),
    }
}

fn serialize(body: Map<String, Value>) -> Result<String, ProtocolError> {
    serde_json::to_string(&Value::Object(body)).map_err(|e| ProtocolError::Encode(e.to_string()))
}
