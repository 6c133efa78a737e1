//! Transport seam for the Command Channel, plus the reference file-based
//! implementation (`daemon_command.json` / `daemon_response.json`, grounded
//! on `original_source/daemon/daemon_commands.py`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{Request, Response};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TIMEOUT")]
    Timeout,
}

/// Daemon-side half of the Command Channel: non-blocking poll for a
/// complete request, and a matched reply.
///
/// A Unix-domain-socket transport could implement this trait without
/// touching the coordinator's dispatch logic (no socket transport ships
/// here — only the file-based one below).
pub trait CommandTransport: Send + Sync {
    /// Returns `Some(request)` if a complete request is waiting, consuming
    /// it so a second poll in the same tick sees nothing. Malformed JSON or
    /// an unrecognized `command` value surfaces as `Ok(None)` after the
    /// daemon writes an `UNKNOWN_COMMAND` reply itself, per spec — so this
    /// returns the raw parse outcome and lets the caller decide.
    fn try_receive(&self) -> Result<Option<Request>, ChannelError>;

    /// Deliver `response` to whichever client is waiting on the request
    /// most recently returned by `try_receive`.
    fn reply(&self, response: &Response) -> Result<(), ChannelError>;
}

/// File-polling transport: client writes `daemon_command.json`, daemon
/// polls for it every 100ms, writes `daemon_response.json`, then deletes
/// both files. Exactly one outstanding request is assumed.
pub struct FileTransport {
    command_path: PathBuf,
    response_path: PathBuf,
}

impl FileTransport {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            command_path: dir.join("daemon_command.json"),
            response_path: dir.join("daemon_response.json"),
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn response_path(&self) -> &Path {
        &self.response_path
    }
}

impl CommandTransport for FileTransport {
    fn try_receive(&self) -> Result<Option<Request>, ChannelError> {
        if !self.command_path.exists() {
            return Ok(None);
        }
        let raw = match std::fs::read_to_string(&self.command_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Remove the command file immediately so we never dispatch the same
        // request twice, even if the reply below fails.
        let _ = std::fs::remove_file(&self.command_path);

        match serde_json::from_str::<Request>(&raw) {
            Ok(req) => Ok(Some(req)),
            Err(e) => {
                debug!(error = %e, "unparsable or unknown command, replying UNKNOWN_COMMAND");
                self.reply(&Response::unknown_command())?;
                Ok(None)
            }
        }
    }

    fn reply(&self, response: &Response) -> Result<(), ChannelError> {
        let body = serde_json::to_string(response).expect("Response always serializes");
        let tmp = self.response_path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.response_path)?;
        Ok(())
    }
}

/// Client-side helper: write a request, poll for the response up to a 5
/// second budget, and clean up both files once an answer arrives.
pub struct FileClient {
    command_path: PathBuf,
    response_path: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
}

impl FileClient {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            command_path: dir.join("daemon_command.json"),
            response_path: dir.join("daemon_response.json"),
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }

    pub async fn send(&self, request: &Request) -> Result<Response, ChannelError> {
        let body = serde_json::to_string(request).expect("Request always serializes");
        let tmp = self.command_path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.command_path)?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if let Ok(raw) = std::fs::read_to_string(&self.response_path) {
                let _ = std::fs::remove_file(&self.response_path);
                let _ = std::fs::remove_file(&self.command_path);
                return serde_json::from_str(&raw).map_err(|e| {
                    warn!(error = %e, "daemon sent unparsable response");
                    ChannelError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                });
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = std::fs::remove_file(&self.command_path);
                return Err(ChannelError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn try_receive_on_empty_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path());
        assert!(transport.try_receive().unwrap().is_none());
    }

    #[test]
    fn write_then_receive_round_trips_and_consumes_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path());
        let req = Request {
            command: Command::Status,
            timestamp: 123.0,
        };
        std::fs::write(
            transport.command_path(),
            serde_json::to_string(&req).unwrap(),
        )
        .unwrap();

        let received = transport.try_receive().unwrap().expect("request present");
        assert!(matches!(received.command, Command::Status));
        assert!(!transport.command_path().exists());
        assert!(transport.try_receive().unwrap().is_none());
    }

    #[test]
    fn malformed_command_gets_unknown_command_reply() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path());
        std::fs::write(transport.command_path(), "{not json").unwrap();

        let received = transport.try_receive().unwrap();
        assert!(received.is_none());
        let raw = std::fs::read_to_string(transport.response_path()).unwrap();
        let resp: Response = serde_json::from_str(&raw).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("UNKNOWN_COMMAND"));
    }

    #[test]
    fn reply_writes_response_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path());
        transport.reply(&Response::ok("done")).unwrap();
        let raw = std::fs::read_to_string(transport.response_path()).unwrap();
        let resp: Response = serde_json::from_str(&raw).unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, "done");
    }

    #[tokio::test]
    async fn client_times_out_when_daemon_never_replies() {
        let dir = tempfile::tempdir().unwrap();
        let client = FileClient {
            command_path: dir.path().join("daemon_command.json"),
            response_path: dir.path().join("daemon_response.json"),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        let req = Request {
            command: Command::Status,
            timestamp: 1.0,
        };
        let result = client.send(&req).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
    }

    #[tokio::test]
    async fn client_receives_reply_written_by_transport() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path());
        let client = FileClient::new(dir.path());

        let req = Request {
            command: Command::Status,
            timestamp: 1.0,
        };

        let send_fut = client.send(&req);
        tokio::pin!(send_fut);

        // Poll the client once to let it write the command file, then
        // answer as the daemon would.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        let received = transport.try_receive().unwrap().expect("request written");
        assert!(matches!(received.command, Command::Status));
        transport.reply(&Response::ok("alive")).unwrap();

        let response = send_fut.await.unwrap();
        assert!(response.success);
        assert_eq!(response.message, "alive");
    }
}
