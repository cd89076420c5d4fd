//! sonoff-client library crate.
//!
//! A long-lived client that keeps a WebSocket session open to each Sonoff
//! switch running in LAN mode, mirrors the switch state reported by the
//! device into a per-session [`DeviceRegistry`](sonoff_core::DeviceRegistry),
//! and sends state-change commands.
//!
//! # Architecture
//!
//! ```text
//! caller ──request_state──▶ [application::dispatcher] ──frame──┐
//!                                                               ▼
//!                          [infrastructure::connection_manager] ◀──▶ device (ws://host:8081/)
//!                                                               │
//!                     [application::reconciler] ◀──decoded frames┘
//!                               │
//!                               ▼
//!                       DeviceEvent broadcast ──▶ subscribers
//! ```
//!
//! - `domain` holds configuration and event types (no I/O).
//! - `application` holds the command dispatcher and the event reconciler.
//!   Both work against the registry and the [`FrameSink`] seam, so they are
//!   tested without sockets.
//! - `infrastructure` owns the socket: connect, handshake, keepalive,
//!   reconnect and the TOML configuration file.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::dispatcher::{CommandDispatcher, FrameSink, OptimisticUpdate};
pub use application::reconciler::EventReconciler;
pub use domain::config::{ClientConfig, ConnectionPolicy, DeviceConfig};
pub use domain::events::{ConnectionState, DeviceEvent};
pub use error::{CommandError, TransportError};
pub use infrastructure::connection_manager::ConnectionManager;
pub use infrastructure::session::{Session, SessionHandle};
