use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical port name used for daemon-internal lifecycle markers.
///
/// Markers (connect/disconnect/idle/reconnect events, startup/shutdown
/// banners) are persisted through the same `captured` table as device
/// output so that `tail`/`recent` return an interleaved, chronological
/// view of "what happened" alongside "what the device said".
pub const SYSTEM_PORT: &str = "SYSTEM";

// ---------------------------------------------------------------------------
// CapturedLine
// ---------------------------------------------------------------------------

/// One persisted row of the capture store.
///
/// `id` is assigned by the store at insert time and is therefore `None`
/// until a row round-trips through `append`/`append_now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedLine {
    pub id: Option<i64>,
    pub timestamp: String,
    pub port: String,
    pub session_id: String,
    pub data: String,
}

impl CapturedLine {
    /// Build a line stamped with the current wall-clock time.
    pub fn new(port: impl Into<String>, session_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: now_iso8601(),
            port: port.into(),
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    /// Build a `SYSTEM`-port marker line (see [`SYSTEM_PORT`]).
    pub fn marker(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self::new(SYSTEM_PORT, session_id, data)
    }

    pub fn is_marker(&self) -> bool {
        self.port == SYSTEM_PORT || self.data.starts_with("===")
    }
}

/// Current time as an ISO-8601 string at second resolution with UTC offset.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One daemon run. Created once at startup, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
}

impl Session {
    /// Generate a fresh `session_<unix-seconds>_<8-hex>` identifier.
    pub fn new() -> Self {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let hex = Uuid::new_v4().simple().to_string();
        Self {
            session_id: format!("session_{epoch}_{}", &hex[..8]),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// PortBinding
// ---------------------------------------------------------------------------

/// The serial device the daemon is currently attached to, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port_name: String,
    pub baud_rate: u32,
    pub connected_at: String,
}

impl PortBinding {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            connected_at: now_iso8601(),
        }
    }
}

// ---------------------------------------------------------------------------
// SingletonState — the on-disk PID record, host-wide
// ---------------------------------------------------------------------------

/// The contents of `daemon.pid`: four newline-separated fields.
///
/// This is a literal wire format, not merely a convenient struct — other
/// processes parse it, so field order and count are part of the contract.
/// A record with fewer than four lines or a non-numeric pid/epoch is
/// treated as absent (spec §4.1 "Failure modes").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonState {
    pub pid: u32,
    pub started_at: u64,
    pub current_port: Option<String>,
    pub session_id: String,
}

const NONE_TOKEN: &str = "NONE";

impl SingletonState {
    pub fn current_port_field(&self) -> &str {
        self.current_port.as_deref().unwrap_or(NONE_TOKEN)
    }

    /// Render the four-line PID record.
    pub fn to_lines(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            self.pid,
            self.started_at,
            self.current_port_field(),
            self.session_id
        )
    }

    /// Parse a PID record, returning `None` for anything truncated or
    /// malformed rather than propagating an error — per contract, a
    /// corrupt record is equivalent to no record at all.
    pub fn from_lines(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let pid: u32 = lines.next()?.trim().parse().ok()?;
        let started_at: u64 = lines.next()?.trim().parse().ok()?;
        let port_field = lines.next()?.trim().to_string();
        let session_id = lines.next()?.trim().to_string();
        if session_id.is_empty() {
            return None;
        }
        let current_port = if port_field == NONE_TOKEN || port_field.is_empty() {
            None
        } else {
            Some(port_field)
        };
        Some(Self {
            pid,
            started_at,
            current_port,
            session_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Error kinds surfaced to clients and recorded as markers (spec §7)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonError {
    #[error("PORT_IN_USE")]
    PortInUse,
    #[error("PORT_NOT_FOUND")]
    PortNotFound,
    #[error("PORT_CONNECTION_FAILED")]
    PortConnectionFailed,
    #[error("PORT_CONNECTION_ERROR:{0}")]
    PortConnectionError(String),
    #[error("DAEMON_NOT_RUNNING")]
    DaemonNotRunning,
    #[error("STARTUP_TIMEOUT")]
    StartupTimeout,
    #[error("UNKNOWN_COMMAND")]
    UnknownCommand,
    #[error("COMMAND_ERROR:{0}")]
    CommandError(String),
    #[error("TIMEOUT")]
    Timeout,
    #[error("NO_PICO_FOUND")]
    NoPicoFound,
    #[error("MULTIPLE_PICOS")]
    MultiplePicos(Vec<PortCandidate>),
    #[error("CONNECTION_LOST:{0}")]
    ConnectionLost(String),
    #[error("CONNECTION_FAILED_PERMANENT (time={elapsed_s}s, attempts={attempts})")]
    ConnectionFailedPermanent { elapsed_s: u64, attempts: u32 },
    #[error("READ_ERROR:{0}")]
    ReadError(String),
    #[error("query must be a pure SELECT statement")]
    QueryNotReadOnly,
}

impl DaemonError {
    /// The bare token form used in markers and `{"error": ...}` responses
    /// (spec §7), without the colon-delimited detail payload.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::PortInUse => "PORT_IN_USE",
            DaemonError::PortNotFound => "PORT_NOT_FOUND",
            DaemonError::PortConnectionFailed => "PORT_CONNECTION_FAILED",
            DaemonError::PortConnectionError(_) => "PORT_CONNECTION_ERROR",
            DaemonError::DaemonNotRunning => "DAEMON_NOT_RUNNING",
            DaemonError::StartupTimeout => "STARTUP_TIMEOUT",
            DaemonError::UnknownCommand => "UNKNOWN_COMMAND",
            DaemonError::CommandError(_) => "COMMAND_ERROR",
            DaemonError::Timeout => "TIMEOUT",
            DaemonError::NoPicoFound => "NO_PICO_FOUND",
            DaemonError::MultiplePicos(_) => "MULTIPLE_PICOS",
            DaemonError::ConnectionLost(_) => "CONNECTION_LOST",
            DaemonError::ConnectionFailedPermanent { .. } => "CONNECTION_FAILED_PERMANENT",
            DaemonError::ReadError(_) => "READ_ERROR",
            DaemonError::QueryNotReadOnly => "QUERY_NOT_READ_ONLY",
        }
    }
}

/// A candidate device surfaced during auto-detection (spec §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortCandidate {
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_record_round_trips() {
        let state = SingletonState {
            pid: 4242,
            started_at: 1_700_000_000,
            current_port: Some("/dev/ttyACM0".into()),
            session_id: "session_1700000000_deadbeef".into(),
        };
        let rendered = state.to_lines();
        let parsed = SingletonState::from_lines(&rendered).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn pid_record_with_none_port_round_trips() {
        let state = SingletonState {
            pid: 1,
            started_at: 0,
            current_port: None,
            session_id: "session_0_00000000".into(),
        };
        assert_eq!(state.to_lines(), "1\n0\nNONE\nsession_0_00000000\n");
        let parsed = SingletonState::from_lines(&state.to_lines()).unwrap();
        assert_eq!(parsed.current_port, None);
    }

    #[test]
    fn truncated_record_is_absent() {
        assert!(SingletonState::from_lines("123\n456\n").is_none());
    }

    #[test]
    fn non_numeric_pid_is_absent() {
        assert!(SingletonState::from_lines("abc\n456\nNONE\nsession_x\n").is_none());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.session_id, b.session_id);
        assert!(a.session_id.starts_with("session_"));
    }

    #[test]
    fn marker_lines_use_system_port() {
        let line = CapturedLine::marker("s1", "DAEMON_STARTED");
        assert_eq!(line.port, SYSTEM_PORT);
        assert!(line.is_marker());
    }
}
