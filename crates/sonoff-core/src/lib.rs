//! # sonoff-core
//!
//! Shared library for the Sonoff LAN-mode client containing the wire frame
//! codec, the device model and the per-session device registry.
//!
//! This crate has no dependencies on sockets or async runtimes.  Everything
//! here can be exercised with plain values in unit tests.
//!
//! # Architecture overview
//!
//! Sonoff switches running in "LAN mode" expose a WebSocket endpoint on
//! port 8081.  A client opens the socket, announces itself with a
//! `userOnline` frame, and from then on both sides exchange `update` frames
//! carrying the full switch state of a device.
//!
//! - **`protocol`** – The JSON envelope travelling over the socket: frame
//!   types, the encode/decode codec, the outgoing sequence counter and the
//!   handshake builder.
//!
//! - **`domain`** – The device model (single-switch vs. multi-outlet params)
//!   and the [`DeviceRegistry`] that holds the last-known state of every
//!   device seen during a session.

pub mod domain;
pub mod protocol;

pub use domain::device::{
    entity_id, Device, DeviceId, OutletState, Params, ParamsError, SwitchModel, SwitchState,
    Switching, Telemetry,
};
pub use domain::registry::{DeviceRegistry, RegistryError, Report, ReportOutcome};
pub use protocol::codec::{decode_frame, decode_frame_bytes, encode_frame, ProtocolError};
pub use protocol::frame::Frame;
