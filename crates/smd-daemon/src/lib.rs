//! Daemon Coordinator — the background process that owns the Lifecycle
//! Registrar, Capture Store, Command Channel, and (at most one) Port
//! Session, and routes requests between them.

pub mod daemon;

pub use daemon::Daemon;
