//! Ambient logging for the serial-monitor daemon and its launcher.

pub mod logging;
