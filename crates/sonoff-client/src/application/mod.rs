//! Application layer: the command dispatcher and the event reconciler.
//!
//! Both operate on a [`DeviceRegistry`](sonoff_core::DeviceRegistry) and
//! never touch the socket directly; outbound frames go through the
//! [`FrameSink`](dispatcher::FrameSink) seam.

pub mod dispatcher;
pub mod reconciler;

pub use dispatcher::{apply_request, CommandDispatcher, FrameSink, OptimisticUpdate};
pub use reconciler::EventReconciler;
