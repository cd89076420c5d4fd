//! Command dispatcher: turns "set device X (outlet k) to on/off" into an
//! `update` frame and applies it optimistically.
//!
//! The dispatcher never queues commands.  With no ready session the request
//! fails immediately with [`CommandError::NotConnected`].  Otherwise the
//! frame is handed to the session's writer together with an
//! [`OptimisticUpdate`], and the call waits only for the socket write.  The
//! writer applies the update as soon as the frame is on the wire and before
//! it reconciles the next inbound frame, so readers see the new state before
//! the device confirms it and any later report overwrites it.

use async_trait::async_trait;
use sonoff_core::protocol::frame::DEFAULT_CONTROL_TYPE;
use sonoff_core::protocol::{unix_seconds, UpdateFrame};
use sonoff_core::{Device, DeviceId, DeviceRegistry, Frame, Params, SwitchState, Switching};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::CommandError;
use crate::infrastructure::session::SessionHandle;

/// A switch mutation to apply once its command frame has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticUpdate {
    pub device_id: DeviceId,
    pub outlet: Option<u8>,
    pub state: SwitchState,
}

impl OptimisticUpdate {
    /// Applies the mutation; `false` if the device or outlet no longer fits.
    pub fn apply(&self, registry: &DeviceRegistry) -> bool {
        let applied = match self.outlet {
            Some(index) => registry.set_outlet_state(&self.device_id, index, self.state),
            None => registry.set_switch_state(&self.device_id, self.state),
        };
        if applied {
            info!(device_id = %self.device_id, outlet = ?self.outlet, state = %self.state, "Command written; state applied");
        }
        applied
    }
}

/// Somewhere a command frame can be written.
///
/// Implemented by [`Session`](crate::Session); mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Writes one frame and applies `update` to the session registry right
    /// after the write, ahead of any later inbound frame.  Resolves once the
    /// socket write has completed.
    async fn send_command(&self, frame: Frame, update: OptimisticUpdate) -> Result<(), CommandError>;
}

/// Entry point for callers that want to change a switch.
///
/// Cheap to clone; every clone follows the same connection.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    sessions: watch::Receiver<Option<SessionHandle>>,
    apikey: String,
}

impl CommandDispatcher {
    pub fn new(sessions: watch::Receiver<Option<SessionHandle>>, apikey: impl Into<String>) -> Self {
        Self {
            sessions,
            apikey: apikey.into(),
        }
    }

    /// The current ready session, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.sessions.borrow().clone()
    }

    /// Requests a switch state change.
    ///
    /// `outlet` must be `Some` for multi-outlet devices and `None` for
    /// single-switch devices.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotConnected`] when no session is ready.
    /// - [`CommandError::UnknownDevice`] / [`CommandError::InvalidOutlet`]
    ///   when the request does not fit the registry.
    /// - [`CommandError::Transport`] when the write fails or the session is
    ///   torn down while the frame is in flight.
    pub async fn request_state(
        &self,
        device_id: &str,
        state: SwitchState,
        outlet: Option<u8>,
    ) -> Result<(), CommandError> {
        let session = self.session().ok_or(CommandError::NotConnected)?;
        let sequence = session.next_sequence();
        apply_request(
            session.as_ref(),
            session.registry(),
            sequence,
            &self.apikey,
            device_id,
            state,
            outlet,
        )
        .await
    }
}

/// Validates and sends one state request; the sink applies it optimistically.
///
/// # Errors
///
/// See [`CommandDispatcher::request_state`].  On error the registry is left
/// untouched.
pub async fn apply_request(
    sink: &dyn FrameSink,
    registry: &DeviceRegistry,
    sequence: u64,
    apikey: &str,
    device_id: &str,
    state: SwitchState,
    outlet: Option<u8>,
) -> Result<(), CommandError> {
    let device = registry
        .get(device_id)
        .ok_or_else(|| CommandError::UnknownDevice(device_id.to_string()))?;
    let params = command_params(&device, state, outlet)?;
    let control_type = device.params.control_type().unwrap_or(DEFAULT_CONTROL_TYPE);
    let frame = UpdateFrame::command(
        device_id,
        apikey,
        sequence,
        params,
        control_type,
        unix_seconds(),
    );

    let update = OptimisticUpdate {
        device_id: device_id.to_string(),
        outlet,
        state,
    };

    debug!(device_id, ?outlet, %state, sequence, "Sending state command");
    sink.send_command(Frame::Update(frame), update).await
}

/// Params for a command: the single `switch` value, or the device's full
/// outlet array with only the target outlet changed.
fn command_params(
    device: &Device,
    state: SwitchState,
    outlet: Option<u8>,
) -> Result<Params, CommandError> {
    let invalid = || CommandError::InvalidOutlet {
        device_id: device.id.clone(),
        outlet,
    };
    match (device.params.switching(), outlet) {
        (None | Some(Switching::Single(_)), None) => Ok(Params::single(state)),
        (Some(outlets @ Switching::Multi(_)), Some(index)) => {
            let mut switching = outlets.clone();
            if switching.set_outlet(index, state) {
                Ok(Params::from(switching))
            } else {
                Err(invalid())
            }
        }
        _ => Err(invalid()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
