//! Notifications published by the client.

use std::fmt;

use sonoff_core::{entity_id, DeviceId, Params, SwitchState};

/// Lifecycle of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Socket open, `userOnline` sent, waiting for the first frame.
    Handshaking,
    /// Commands may be dispatched.
    Ready,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Change notifications for the entity layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// First hello or update frame from a device in this session.  `params`
    /// is empty when the device was first seen through its hello.
    DeviceSeen { device_id: DeviceId, params: Params },
    /// A device reported a switch state.  Optimistic writes after a command
    /// update the registry without an event; the device's own report follows.
    /// `outlet` is `None` for single-switch devices.
    StateChanged {
        device_id: DeviceId,
        outlet: Option<u8>,
        state: SwitchState,
    },
    AvailabilityChanged { device_id: DeviceId, online: bool },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::DeviceSeen { device_id, .. }
            | DeviceEvent::StateChanged { device_id, .. }
            | DeviceEvent::AvailabilityChanged { device_id, .. } => device_id,
        }
    }

    /// Entity the event applies to (`switch.<id>` or `switch.<id>_<n>`).
    pub fn entity_id(&self) -> String {
        match self {
            DeviceEvent::StateChanged {
                device_id, outlet, ..
            } => entity_id(device_id, *outlet),
            other => entity_id(other.device_id(), None),
        }
    }
}
