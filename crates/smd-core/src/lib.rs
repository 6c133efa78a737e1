//! Core types and durable subsystems for the serial-monitor daemon.
//!
//! - [`types`] — the data model: `CapturedLine`, `Session`, `PortBinding`,
//!   `SingletonState`, and the shared error-kind enum.
//! - [`lockfile`] — the Lifecycle Registrar: host-wide singleton
//!   enforcement via PID + lock files.
//! - [`store`] — the Capture Store: batched, durable, query-safe
//!   persistence with bounded retention.
//! - [`config`] — daemon configuration loaded from `config.toml`.

pub mod config;
pub mod lockfile;
pub mod store;
pub mod types;
