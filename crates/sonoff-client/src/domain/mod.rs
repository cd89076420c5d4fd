//! Domain layer: client configuration and the notifications the client
//! emits.  No I/O happens here.

pub mod config;
pub mod events;

pub use config::{ClientConfig, ConnectionPolicy, DeviceConfig, DEFAULT_API_KEY};
pub use events::{ConnectionState, DeviceEvent};
