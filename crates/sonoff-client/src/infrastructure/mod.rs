//! Infrastructure layer: everything that touches the network or the file
//! system.
//!
//! - `connection_manager` opens the WebSocket, performs the handshake, runs
//!   keepalive and reconnects.
//! - `session` is the per-connection state handed to the dispatcher.
//! - `config_file` loads the TOML configuration.

pub mod config_file;
pub mod connection_manager;
pub mod session;

pub use config_file::{load_config, ConfigError};
pub use connection_manager::ConnectionManager;
pub use session::{Session, SessionHandle};
