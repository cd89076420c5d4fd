//! Domain types: the device model and the session device registry.
//!
//! Nothing in this module performs I/O.  The registry synchronizes with a
//! plain `std::sync::Mutex`, so callers in async code cannot hold its lock
//! across an `.await`.

pub mod device;
pub mod registry;

pub use device::{Device, DeviceId, OutletState, Params, SwitchModel, SwitchState, Switching};
pub use registry::{DeviceRegistry, RegistryError, Report, ReportOutcome};
