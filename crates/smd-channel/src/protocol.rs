//! Wire types for the Command Channel: one request answered by exactly one
//! response, tagged by command name (mirrors the pack's `BridgeMessage`
//! enum-tagged dispatch, generalized from a websocket frame to a
//! request/response pair).

use serde::{Deserialize, Serialize};

/// A request as it arrives over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Connect {
        #[serde(default)]
        port: Option<String>,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
    },
    Disconnect,
    Write {
        data: String,
    },
    Status,
    SetEcho {
        enabled: bool,
    },
}

fn default_baudrate() -> u32 {
    115_200
}

/// Envelope actually read off the wire: every request carries a timestamp
/// alongside its command-specific fields (spec's "Command payload schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub command: Command,
    pub timestamp: f64,
}

/// The full status object returned by the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub running: bool,
    pub monitoring: bool,
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub session_id: String,
    pub pid: u32,
    pub start_time: u64,
    pub uptime: u64,
    pub lines_captured: Option<u64>,
}

/// A candidate device surfaced by `MULTIPLE_PICOS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub port_name: String,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
}

/// Response envelope. `success`/`message` are always present; the rest are
/// populated according to which command produced this response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baudrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<CandidatePayload>>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn err(code: &str) -> Self {
        Self {
            success: false,
            message: code.to_string(),
            error: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn unknown_command() -> Self {
        Self::err("UNKNOWN_COMMAND")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_without_port_deserializes() {
        let raw = r#"{"command":"connect","timestamp":1.0}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        match req.command {
            Command::Connect { port, baudrate } => {
                assert_eq!(port, None);
                assert_eq!(baudrate, 115_200);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn write_requires_data_field() {
        let raw = r#"{"command":"write","data":"hello","timestamp":2.0}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        match req.command {
            Command::Write { data } => assert_eq!(data, "hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_json_fails_to_parse_as_a_known_variant() {
        let raw = r#"{"command":"frobnicate","timestamp":3.0}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn unknown_command_response_has_expected_shape() {
        let resp = Response::unknown_command();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("UNKNOWN_COMMAND"));
    }
}
