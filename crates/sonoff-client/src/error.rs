//! Error types shared by the client layers.
//!
//! [`TransportError`] describes why a session ended or a write failed; the
//! connection manager recovers from it by reconnecting.  [`CommandError`] is
//! what a caller of
//! [`CommandDispatcher::request_state`](crate::CommandDispatcher::request_state)
//! sees; commands are never retried.

use std::time::Duration;

use sonoff_core::{DeviceId, ProtocolError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the WebSocket failed (refused, unresolvable host, bad upgrade).
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("connecting to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// The established socket failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The device closed the socket or the stream ended.
    #[error("connection closed by device")]
    Closed,

    #[error("no reply to handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no inbound traffic for {0:?}")]
    KeepaliveTimeout(Duration),

    /// The session a write was queued on has been torn down.
    #[error("session ended before the frame was written")]
    SessionGone,

    #[error("failed to encode outgoing frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Errors returned to callers of the command dispatcher.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No session is in the ready state; nothing was sent.
    #[error("not connected to any device")]
    NotConnected,

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// The outlet does not exist, or an outlet was given for a single-switch
    /// device (or omitted for a multi-outlet one).
    #[error("invalid outlet {outlet:?} for device {device_id}")]
    InvalidOutlet {
        device_id: DeviceId,
        outlet: Option<u8>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts_into_command_error() {
        let err: CommandError = TransportError::SessionGone.into();
        assert!(matches!(err, CommandError::Transport(TransportError::SessionGone)));
        assert_eq!(err.to_string(), "session ended before the frame was written");
    }

    #[test]
    fn test_invalid_outlet_message_names_device() {
        let err = CommandError::InvalidOutlet {
            device_id: "100040e943".to_string(),
            outlet: Some(7),
        };
        assert_eq!(err.to_string(), "invalid outlet Some(7) for device 100040e943");
    }
}
