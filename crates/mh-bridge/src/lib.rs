//! Event fan-out and cancellation plumbing.
//!
//! The conductor publishes typed progress events here; subscribers (the CLI,
//! tests, future UIs) read them from bounded per-subscriber queues that never
//! block the publisher.

pub mod cancel;
pub mod event_bus;
pub mod protocol;

pub use cancel::CancelToken;
pub use event_bus::EventBus;
pub use protocol::{ConductorEvent, EventKind};
