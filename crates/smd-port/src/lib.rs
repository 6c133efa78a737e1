//! Port Session — owns the single serial (UART-over-USB) device the daemon
//! talks to: opening it, reading line-delimited text off a dedicated reader
//! thread, idle detection, and the two-stage reconnection state machine.

pub mod session;

pub use session::{
    available_ports, EventRecord, EventSink, LineRecord, LineSink, PortError, PortEvent,
    PortSession, PortSessionConfig,
};
