//! Cancellation substrate shared by the Capture Store's retention task and
//! the Port Session's reconnection state machine.
//!
//! Both observe the same [`ShutdownSignal`] at every step of their loops so
//! that daemon shutdown tears them down within the ~2 second budget the
//! spec's concurrency model requires, without either owning a back-pointer
//! to the coordinator that created them.

pub mod shutdown;

pub use shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
