//! Daemon Coordinator — owns the Lifecycle Registrar, Capture Store,
//! Command Channel, and at most one Port Session; routes commands and
//! drives the startup/shutdown sequences (spec §4.5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use smd_channel::{
    CandidatePayload, Command, CommandTransport, FileTransport, Response, StatusPayload,
};
use smd_core::config::Config;
use smd_core::lockfile::{AcquireOutcome, Registrar};
use smd_core::store::CaptureStore;
use smd_core::types::{CapturedLine, DaemonError, PortBinding, Session};
use smd_harness::ShutdownSignal;
use smd_port::{EventRecord, LineRecord, PortEvent, PortSession, PortSessionConfig};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Daemon {
    config: Config,
    registrar: Mutex<Registrar>,
    store: Arc<CaptureStore>,
    transport: FileTransport,
    shutdown: ShutdownSignal,
    session_id: String,
    start_time: u64,
    runtime: Handle,
    port: Mutex<Option<Arc<PortSession>>>,
    binding: Mutex<Option<PortBinding>>,
    echo: AtomicBool,
    running: AtomicBool,
}

impl Daemon {
    /// Startup sequence (spec §4.5):
    /// 1. acquire the Registrar, failing if another daemon is live,
    /// 2. (done by `acquire`) write the PID record with `port = NONE`,
    /// 3. open the Capture Store, which self-heals on corruption,
    /// 4. append a `DAEMON_STARTED` marker,
    /// the caller installs signal handlers and calls `run()` for step 5/6.
    pub async fn start(config: Config, base_dir: PathBuf) -> Result<Arc<Daemon>> {
        let session_id = Session::new().session_id;
        let mut registrar = Registrar::new(&base_dir);
        match registrar
            .acquire(&session_id)
            .context("registrar acquire failed")?
        {
            AcquireOutcome::Acquired => {}
            AcquireOutcome::HeldByLive(state) => {
                anyhow::bail!("daemon already running (pid={})", state.pid);
            }
            AcquireOutcome::StaleRecovered => {
                anyhow::bail!("lost the race to acquire the daemon singleton, try again");
            }
        }

        let store_path = base_dir.join("serial_data.db");
        let shutdown = ShutdownSignal::new();
        let store = CaptureStore::open(
            &store_path,
            config.max_records,
            Duration::from_secs(config.cleanup_interval_secs),
            session_id.clone(),
            shutdown.clone(),
        )
        .await
        .context("failed to open capture store")?;

        store
            .append_now(CapturedLine::marker(&session_id, "DAEMON_STARTED"))
            .await
            .context("failed to append startup marker")?;

        let daemon = Arc::new(Daemon {
            registrar: Mutex::new(registrar),
            transport: FileTransport::new(&base_dir),
            session_id,
            start_time: unix_now(),
            runtime: Handle::current(),
            port: Mutex::new(None),
            binding: Mutex::new(None),
            echo: AtomicBool::new(config.echo),
            running: AtomicBool::new(true),
            config,
            store,
            shutdown,
        });

        // Auto-connect only when a port was explicitly configured and
        // `--no-autoconnect` was not passed (matches the reference daemon:
        // auto-detection is never attempted implicitly at startup).
        if !daemon.config.no_autoconnect {
            if let Some(port) = daemon.config.port.clone() {
                info!(%port, "auto-connecting at startup");
                let baudrate = daemon.config.baudrate;
                let resp = daemon.connect(Some(port.clone()), baudrate).await;
                if !resp.success {
                    warn!(%port, error = ?resp.error, "auto-connect at startup failed, continuing unbound");
                }
            }
        }

        Ok(daemon)
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Signal the main loop to return after its current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.trigger();
    }

    /// Main loop (spec §4.5): every 100ms, poll the Command Channel and
    /// flush the Capture Store. Returns once `running` is cleared.
    pub async fn run(self: &Arc<Self>) {
        info!(session_id = %self.session_id, "daemon entering main loop");
        while self.running.load(Ordering::SeqCst) {
            match self.transport.try_receive() {
                Ok(Some(request)) => {
                    let response = self.dispatch(request.command).await;
                    if let Err(e) = self.transport.reply(&response) {
                        error!(error = %e, "failed to write command response");
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "command channel poll failed"),
            }

            if let Err(e) = self.store.flush().await {
                error!(error = %e, "periodic store flush failed");
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.shutdown_sequence().await;
    }

    /// Dispatch a single command to completion, as the main loop does for
    /// whatever the Command Channel hands it. Exposed so tests (and any
    /// in-process embedder) can drive the coordinator without going through
    /// the file transport.
    pub async fn dispatch(&self, command: Command) -> Response {
        match command {
            Command::Connect { port, baudrate } => self.connect(port, baudrate).await,
            Command::Disconnect => self.disconnect().await,
            Command::Write { data } => self.handle_write(data).await,
            Command::Status => self.handle_status().await,
            Command::SetEcho { enabled } => self.handle_set_echo(enabled).await,
        }
    }

    /// **connect(port, baudrate).** If already bound, disconnect first.
    /// Create a Port Session, register callbacks that forward into the
    /// Capture Store, open, and on success start the reader and update the
    /// PID record's current port. On failure, record `PORT_CONNECTION_FAILED`
    /// and leave the coordinator unbound.
    pub async fn connect(&self, port: Option<String>, baudrate: u32) -> Response {
        if self.binding.lock().unwrap().is_some() {
            self.disconnect().await;
        }

        let port_name = match port {
            Some(p) => p,
            None => match self.auto_detect() {
                Ok(p) => p,
                Err(DaemonError::MultiplePicos(candidates)) => {
                    let mut resp = Response::err("MULTIPLE_PICOS");
                    resp.candidates = Some(
                        candidates
                            .into_iter()
                            .map(|c| CandidatePayload {
                                port_name: c.port_name,
                                manufacturer: c.manufacturer,
                                description: c.description,
                            })
                            .collect(),
                    );
                    return resp;
                }
                Err(e) => return Response::err(e.code()),
            },
        };

        let session = self.build_session(&port_name, baudrate);
        match session.open() {
            Ok(()) => {
                session.set_echo(self.echo.load(Ordering::Relaxed));
                session.start_reader();
                *self.port.lock().unwrap() = Some(session);
                *self.binding.lock().unwrap() = Some(PortBinding::new(&port_name, baudrate));
                if let Err(e) = self
                    .registrar
                    .lock()
                    .unwrap()
                    .update_current_port(Some(&port_name))
                {
                    warn!(error = %e, "failed to update PID record's current port");
                }
                Response {
                    success: true,
                    message: format!("connected to {port_name}"),
                    port: Some(port_name),
                    baudrate: Some(baudrate),
                    ..Default::default()
                }
            }
            Err(e) => {
                if let Err(store_err) = self
                    .store
                    .append_now(CapturedLine::marker(&self.session_id, "PORT_CONNECTION_FAILED"))
                    .await
                {
                    error!(error = %store_err, "failed to record connection-failure marker");
                }
                Response::err(&e.to_string())
            }
        }
    }

    /// **disconnect().** Stop reader, close handle, record
    /// `PORT_DISCONNECTED_BY_USER`, reset the PID record's current port.
    /// Idempotent.
    pub async fn disconnect(&self) -> Response {
        let session = self.port.lock().unwrap().take();
        if let Some(session) = session {
            session.stop_reader();
            session.close();
            *self.binding.lock().unwrap() = None;
            if let Err(e) = self.registrar.lock().unwrap().update_current_port(None) {
                warn!(error = %e, "failed to clear PID record's current port");
            }
            if let Err(e) = self
                .store
                .append_now(CapturedLine::marker(&self.session_id, "PORT_DISCONNECTED_BY_USER"))
                .await
            {
                error!(error = %e, "failed to record disconnect marker");
            }
        }
        Response::ok("disconnected")
    }

    async fn handle_write(&self, data: String) -> Response {
        if data.is_empty() {
            return Response::err("COMMAND_ERROR:data must not be empty");
        }
        let session = self.port.lock().unwrap().clone();
        match session {
            Some(session) if session.is_open() => match session.write(data.as_bytes()) {
                Ok(()) => Response {
                    success: true,
                    message: "written".to_string(),
                    length: Some(data.len()),
                    data: Some(data),
                    ..Default::default()
                },
                Err(e) => Response::err(&e.to_string()),
            },
            _ => Response::err("COMMAND_ERROR:not connected to a port"),
        }
    }

    async fn handle_status(&self) -> Response {
        let binding = self.binding.lock().unwrap().clone();
        let lines_captured = self
            .store
            .count(Some(self.session_id.clone()))
            .await
            .ok()
            .map(|n| n as u64);
        let status = StatusPayload {
            running: self.running.load(Ordering::SeqCst),
            monitoring: binding.is_some(),
            port: binding.as_ref().map(|b| b.port_name.clone()),
            baudrate: binding.as_ref().map(|b| b.baud_rate),
            session_id: self.session_id.clone(),
            pid: std::process::id(),
            start_time: self.start_time,
            uptime: unix_now().saturating_sub(self.start_time),
            lines_captured,
        };
        Response {
            success: true,
            message: "ok".to_string(),
            status: Some(status),
            ..Default::default()
        }
    }

    async fn handle_set_echo(&self, enabled: bool) -> Response {
        self.echo.store(enabled, Ordering::Relaxed);
        if let Some(session) = self.port.lock().unwrap().clone() {
            session.set_echo(enabled);
        }
        Response {
            success: true,
            message: "echo updated".to_string(),
            echo_enabled: Some(enabled),
            ..Default::default()
        }
    }

    /// Enumerate serial devices and select by (in order) vendor/product id
    /// `0x2E8A`/`0x0005`, then manufacturer containing "Raspberry Pi", then
    /// description containing "Pico" or "RP2".
    fn auto_detect(&self) -> Result<String, DaemonError> {
        let candidates = smd_port::available_ports();

        let by_ids: Vec<_> = candidates
            .iter()
            .filter(|c| c.vendor_id == Some(0x2E8A) && c.product_id == Some(0x0005))
            .collect();
        let pool = if !by_ids.is_empty() {
            by_ids
        } else {
            let by_manufacturer: Vec<_> = candidates
                .iter()
                .filter(|c| {
                    c.manufacturer
                        .as_deref()
                        .is_some_and(|m| m.contains("Raspberry Pi"))
                })
                .collect();
            if !by_manufacturer.is_empty() {
                by_manufacturer
            } else {
                candidates
                    .iter()
                    .filter(|c| {
                        c.description
                            .as_deref()
                            .is_some_and(|d| d.contains("Pico") || d.contains("RP2"))
                    })
                    .collect()
            }
        };

        match pool.len() {
            0 => Err(DaemonError::NoPicoFound),
            1 => Ok(pool[0].port_name.clone()),
            _ => Err(DaemonError::MultiplePicos(
                pool.into_iter().cloned().collect(),
            )),
        }
    }

    /// Build a Port Session wired to forward lines/events into the Capture
    /// Store. The sink closures run on the reader's OS thread and bridge
    /// into async store writes via the runtime handle captured at startup.
    fn build_session(&self, port_name: &str, baudrate: u32) -> Arc<PortSession> {
        let mut session_config = PortSessionConfig::new(port_name, baudrate);
        session_config.rapid_retry_duration = Duration::from_secs(self.config.rapid_retry_secs);
        session_config.slow_retry_duration = Duration::from_secs(self.config.slow_retry_secs);

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let handle = self.runtime.clone();
        let port_for_lines = port_name.to_string();
        let on_line = Arc::new(move |rec: LineRecord| {
            let store = store.clone();
            let session_id = session_id.clone();
            let port = port_for_lines.clone();
            handle.spawn(async move {
                let line = CapturedLine {
                    id: None,
                    timestamp: rec.timestamp,
                    port,
                    session_id,
                    data: rec.data,
                };
                if let Err(e) = store.append(line).await {
                    error!(error = %e, "failed to persist captured line");
                }
            });
        });

        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let handle = self.runtime.clone();
        let on_event = Arc::new(move |rec: EventRecord| {
            let store = store.clone();
            let session_id = session_id.clone();
            handle.spawn(async move {
                let line = CapturedLine {
                    id: None,
                    timestamp: rec.timestamp,
                    port: smd_core::types::SYSTEM_PORT.to_string(),
                    session_id,
                    data: rec.event.to_string(),
                };
                if let PortEvent::ConnectionFailedPermanent { .. } = rec.event {
                    warn!("port session gave up reconnecting");
                }
                if let Err(e) = store.append_now(line).await {
                    error!(error = %e, "failed to persist port event");
                }
            });
        });

        PortSession::new(session_config, self.shutdown.clone(), on_line, on_event)
    }

    /// **Shutdown.** Append `DAEMON_STOPPED_CLEAN`, stop the reader, close
    /// the Port Session, close the Capture Store, release the Registrar.
    /// Idempotent.
    async fn shutdown_sequence(&self) {
        info!("daemon shutting down");
        if let Err(e) = self
            .store
            .append_now(CapturedLine::marker(&self.session_id, "DAEMON_STOPPED_CLEAN"))
            .await
        {
            error!(error = %e, "failed to append shutdown marker");
        }

        if let Some(session) = self.port.lock().unwrap().take() {
            session.stop_reader();
            session.close();
        }

        self.store.close().await;
        self.registrar.lock().unwrap().release();
        info!("daemon stopped");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
