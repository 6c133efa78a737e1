//! Port Session — open/read/reconnect lifecycle for a single serial device.
//!
//! The reader runs on a dedicated OS thread because `serialport`'s I/O is
//! blocking (mirrors `other_examples`' `armaxri-termiHub` serial backend:
//! a blocking reader thread plus a separately-cloned writer handle so
//! reads and writes never contend on the same lock). The thread holds
//! only the two opaque sink closures the coordinator handed it at
//! construction time — no back-pointer to the coordinator.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use smd_core::types::now_iso8601;
use smd_harness::ShutdownSignal;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PortSessionConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_warning_threshold: Duration,
    pub idle_timeout_threshold: Duration,
    pub rapid_retry_interval: Duration,
    pub rapid_retry_duration: Duration,
    pub slow_retry_interval: Duration,
    pub slow_retry_duration: Duration,
}

impl PortSessionConfig {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
            idle_warning_threshold: Duration::from_secs(30),
            idle_timeout_threshold: Duration::from_secs(300),
            rapid_retry_interval: Duration::from_secs(2),
            rapid_retry_duration: Duration::from_secs(30),
            slow_retry_interval: Duration::from_secs(5),
            slow_retry_duration: Duration::from_secs(600),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The closed set of events ever delivered via `on_event` (spec §4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    ConnectionEstablished,
    ConnectionLost(String),
    PortIdleWarning(u64),
    PortTimeout,
    ConnectionRestored { elapsed_s: u64, attempts: u32 },
    ConnectionFailedPermanent { elapsed_s: u64, attempts: u32 },
    Disconnected,
}

impl std::fmt::Display for PortEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortEvent::ConnectionEstablished => write!(f, "CONNECTION_ESTABLISHED"),
            PortEvent::ConnectionLost(detail) => write!(f, "CONNECTION_LOST:{detail}"),
            PortEvent::PortIdleWarning(secs) => write!(f, "PORT_IDLE_WARNING: {secs}s"),
            PortEvent::PortTimeout => write!(f, "PORT_TIMEOUT"),
            PortEvent::ConnectionRestored { elapsed_s, attempts } => {
                write!(f, "CONNECTION_RESTORED (time={elapsed_s}s, attempts={attempts})")
            }
            PortEvent::ConnectionFailedPermanent { elapsed_s, attempts } => {
                write!(f, "CONNECTION_FAILED_PERMANENT (time={elapsed_s}s, attempts={attempts})")
            }
            PortEvent::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// A line delivered from the device, stamped the instant it was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRecord {
    pub data: String,
    pub timestamp: String,
}

/// An event delivered from the session, stamped the instant it was emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event: PortEvent,
    pub timestamp: String,
}

pub type LineSink = Arc<dyn Fn(LineRecord) + Send + Sync>;
pub type EventSink = Arc<dyn Fn(EventRecord) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("PORT_IN_USE")]
    InUse,
    #[error("PORT_NOT_FOUND")]
    NotFound,
    #[error("PORT_CONNECTION_ERROR:{0}")]
    ConnectionError(String),
    #[error("port is not open")]
    NotOpen,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn classify_open_error(port_name: &str, err: &serialport::Error) -> PortError {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("busy") || lower.contains("in use") || lower.contains("access denied") {
        PortError::InUse
    } else if lower.contains("no such file")
        || lower.contains("not found")
        || matches!(err.kind(), serialport::ErrorKind::NoDevice)
    {
        PortError::NotFound
    } else {
        PortError::ConnectionError(format!("{port_name}: {msg}"))
    }
}

// ---------------------------------------------------------------------------
// PortSession
// ---------------------------------------------------------------------------

/// Owns (at most) one open serial handle and the dedicated reader thread
/// that drains it. Created fresh by the coordinator for every `connect`.
pub struct PortSession {
    config: PortSessionConfig,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    reader_handle: Mutex<Option<Box<dyn SerialPort>>>,
    is_open: AtomicBool,
    echo: AtomicBool,
    stop_flag: Arc<AtomicBool>,
    shutdown: ShutdownSignal,
    on_line: LineSink,
    on_event: EventSink,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PortSession {
    pub fn new(
        config: PortSessionConfig,
        shutdown: ShutdownSignal,
        on_line: LineSink,
        on_event: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            writer: Mutex::new(None),
            reader_handle: Mutex::new(None),
            is_open: AtomicBool::new(false),
            echo: AtomicBool::new(false),
            stop_flag: Arc::new(AtomicBool::new(false)),
            shutdown,
            on_line,
            on_event,
            worker: Mutex::new(None),
        })
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::Relaxed);
    }

    /// Open the device and emit `CONNECTION_ESTABLISHED`.
    pub fn open(&self) -> Result<(), PortError> {
        self.open_device()?;
        self.emit_event(PortEvent::ConnectionEstablished);
        Ok(())
    }

    /// Raw open with no event emission — used both by `open()` and by the
    /// reconnection loop, which emits `CONNECTION_RESTORED` instead.
    fn open_device(&self) -> Result<(), PortError> {
        let mut port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open()
            .map_err(|e| classify_open_error(&self.config.port_name, &e))?;

        port.clear(ClearBuffer::All).ok();

        let reader = port
            .try_clone()
            .map_err(|e| classify_open_error(&self.config.port_name, &e))?;

        *self.writer.lock().unwrap() = Some(port);
        *self.reader_handle.lock().unwrap() = Some(reader);
        self.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the underlying handles. Idempotent.
    pub fn close(&self) {
        *self.writer.lock().unwrap() = None;
        *self.reader_handle.lock().unwrap() = None;
        self.is_open.store(false, Ordering::SeqCst);
    }

    /// Start the dedicated reader worker thread.
    pub fn start_reader(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("smd-port-reader-{}", self.config.port_name))
            .spawn(move || reader_loop(session))
            .expect("spawn reader thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Signal the reader to stop and wait up to 2s for it to join. A
    /// reader that does not join within the budget is abandoned — its OS
    /// handle is already closed, so nothing leaks.
    pub fn stop_reader(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(port = %self.config.port_name, "reader thread did not join within 2s, abandoning");
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    /// Write `bytes` followed by a newline, flushing the OS handle.
    /// Returns success only if both the write and the flush complete.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PortError> {
        let mut guard = self.writer.lock().unwrap();
        let port = guard.as_mut().ok_or(PortError::NotOpen)?;
        // Bump to the write timeout budget for the duration of this call;
        // the reader's 100ms read budget is restored immediately after.
        let _ = port.set_timeout(self.config.write_timeout);
        let result = port.write_all(bytes).and_then(|_| port.write_all(b"\n")).and_then(|_| port.flush());
        let _ = port.set_timeout(self.config.read_timeout);
        result.map_err(PortError::from)
    }

    fn emit_event(&self, event: PortEvent) {
        (self.on_event)(EventRecord { timestamp: now_iso8601(), event });
    }

    fn deliver_line(&self, data: String) {
        if self.echo.load(Ordering::Relaxed) {
            tracing::info!(target: "smd_port::echo", port = %self.config.port_name, "{data}");
        }
        (self.on_line)(LineRecord { timestamp: now_iso8601(), data });
    }

    fn port_is_present(&self) -> bool {
        available_ports()
            .iter()
            .any(|p| p.port_name == self.config.port_name)
    }

    /// Two-stage reconnection: rapid retries for `rapid_retry_duration`,
    /// then slow retries for `slow_retry_duration`, then permanent failure.
    fn run_reconnect(&self) -> ReconnectOutcome {
        let t0 = Instant::now();
        let mut attempts: u32 = 0;

        let rapid_deadline = t0 + self.config.rapid_retry_duration;
        while Instant::now() < rapid_deadline {
            if self.sleep_or_abort(self.config.rapid_retry_interval) {
                return ReconnectOutcome::ShutdownRequested;
            }
            attempts += 1;
            if self.port_is_present() && self.open_device().is_ok() {
                return ReconnectOutcome::Restored {
                    elapsed_s: t0.elapsed().as_secs(),
                    attempts,
                };
            }
        }

        let slow_deadline = t0 + self.config.rapid_retry_duration + self.config.slow_retry_duration;
        while Instant::now() < slow_deadline {
            if self.sleep_or_abort(self.config.slow_retry_interval) {
                return ReconnectOutcome::ShutdownRequested;
            }
            attempts += 1;
            if self.port_is_present() && self.open_device().is_ok() {
                return ReconnectOutcome::Restored {
                    elapsed_s: t0.elapsed().as_secs(),
                    attempts,
                };
            }
        }

        ReconnectOutcome::FailedPermanent {
            elapsed_s: t0.elapsed().as_secs(),
            attempts,
        }
    }

    /// Sleep `dur` in small increments, polling for cancellation.
    /// Returns `true` if shutdown/stop was observed and the caller should
    /// abandon immediately.
    fn sleep_or_abort(&self, dur: Duration) -> bool {
        let step = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::ZERO {
            if self.should_stop() {
                return true;
            }
            let chunk = step.min(remaining);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
        self.should_stop()
    }

    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst) || self.shutdown.is_shutting_down()
    }
}

enum ReconnectOutcome {
    Restored { elapsed_s: u64, attempts: u32 },
    FailedPermanent { elapsed_s: u64, attempts: u32 },
    ShutdownRequested,
}

fn reader_loop(session: Arc<PortSession>) {
    let mut pending: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 4096];
    let mut last_nonempty = Instant::now();
    let mut last_warning: Option<Instant> = None;

    loop {
        if session.should_stop() {
            break;
        }

        let read_result = {
            let mut guard = session.reader_handle.lock().unwrap();
            match guard.as_mut() {
                Some(r) => r.read(&mut read_buf),
                None => break,
            }
        };

        match read_result {
            Ok(0) => {}
            Ok(n) => {
                pending.extend_from_slice(&read_buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    let trimmed = text.trim_end_matches(['\r', '\n']);
                    if !trimmed.is_empty() {
                        last_nonempty = Instant::now();
                        last_warning = None;
                        session.deliver_line(trimmed.to_string());
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                let idle = last_nonempty.elapsed();
                if idle >= session.config.idle_timeout_threshold {
                    session.emit_event(PortEvent::PortTimeout);
                    session.close();
                    match session.run_reconnect() {
                        ReconnectOutcome::Restored { elapsed_s, attempts } => {
                            session.emit_event(PortEvent::ConnectionRestored { elapsed_s, attempts });
                            last_nonempty = Instant::now();
                            last_warning = None;
                        }
                        ReconnectOutcome::FailedPermanent { elapsed_s, attempts } => {
                            session.emit_event(PortEvent::ConnectionFailedPermanent { elapsed_s, attempts });
                            break;
                        }
                        ReconnectOutcome::ShutdownRequested => break,
                    }
                } else if idle >= session.config.idle_warning_threshold
                    && last_warning
                        .map(|w| w.elapsed() >= session.config.idle_warning_threshold)
                        .unwrap_or(true)
                {
                    session.emit_event(PortEvent::PortIdleWarning(idle.as_secs()));
                    last_warning = Some(Instant::now());
                }
            }
            Err(e) => {
                debug!(error = %e, "serial read error, entering reconnection");
                session.emit_event(PortEvent::ConnectionLost(e.to_string()));
                session.close();
                match session.run_reconnect() {
                    ReconnectOutcome::Restored { elapsed_s, attempts } => {
                        session.emit_event(PortEvent::ConnectionRestored { elapsed_s, attempts });
                        last_nonempty = Instant::now();
                        last_warning = None;
                    }
                    ReconnectOutcome::FailedPermanent { elapsed_s, attempts } => {
                        session.emit_event(PortEvent::ConnectionFailedPermanent { elapsed_s, attempts });
                        break;
                    }
                    ReconnectOutcome::ShutdownRequested => break,
                }
            }
        }
    }

    if !session.stop_flag.load(Ordering::SeqCst) {
        // Loop exited on its own (permanent failure or shutdown); a
        // user-initiated stop_reader() already means no DISCONNECTED is
        // owed since the coordinator records its own marker.
        return;
    }
    session.emit_event(PortEvent::Disconnected);
    info!(port = %session.config.port_name, "reader thread stopped");
}

/// Enumerate the host's serial devices.
pub fn available_ports() -> Vec<smd_core::types::PortCandidate> {
    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| {
            let (vendor_id, product_id, manufacturer, description) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    (Some(usb.vid), Some(usb.pid), usb.manufacturer, usb.product)
                }
                _ => (None, None, None, None),
            };
            smd_core::types::PortCandidate {
                port_name: p.port_name,
                vendor_id,
                product_id,
                manufacturer,
                description,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_display_matches_spec_tokens() {
        assert_eq!(PortEvent::ConnectionEstablished.to_string(), "CONNECTION_ESTABLISHED");
        assert_eq!(PortEvent::ConnectionLost("boom".into()).to_string(), "CONNECTION_LOST:boom");
        assert_eq!(PortEvent::PortIdleWarning(45).to_string(), "PORT_IDLE_WARNING: 45s");
        assert_eq!(PortEvent::PortTimeout.to_string(), "PORT_TIMEOUT");
        assert_eq!(
            PortEvent::ConnectionRestored { elapsed_s: 3, attempts: 2 }.to_string(),
            "CONNECTION_RESTORED (time=3s, attempts=2)"
        );
        assert_eq!(
            PortEvent::ConnectionFailedPermanent { elapsed_s: 9, attempts: 5 }.to_string(),
            "CONNECTION_FAILED_PERMANENT (time=9s, attempts=5)"
        );
        assert_eq!(PortEvent::Disconnected.to_string(), "DISCONNECTED");
    }

    #[test]
    fn fresh_session_is_not_open() {
        let session = PortSession::new(
            PortSessionConfig::new("/dev/does-not-exist", 115_200),
            ShutdownSignal::new(),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        );
        assert!(!session.is_open());
    }

    #[test]
    fn open_on_missing_device_reports_not_found_or_error() {
        let session = PortSession::new(
            PortSessionConfig::new("/dev/this-port-does-not-exist-12345", 115_200),
            ShutdownSignal::new(),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        );
        assert!(session.open().is_err());
        assert!(!session.is_open());
    }

    #[test]
    fn write_without_open_fails() {
        let session = PortSession::new(
            PortSessionConfig::new("/dev/does-not-exist", 115_200),
            ShutdownSignal::new(),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        );
        assert!(matches!(session.write(b"hi"), Err(PortError::NotOpen)));
    }
}
