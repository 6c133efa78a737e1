//! Serial monitor daemon — owns one UART-over-USB port, captures its
//! line-delimited output durably, and answers commands from `smctl`.

use anyhow::{Context, Result};
use clap::Parser;
use smd_core::config::Config;
use smd_core::lockfile::Registrar;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI surface of the daemon entry point (spec §6) — out-of-core but fixed.
#[derive(Parser, Debug)]
#[command(name = "smd-daemon", version, about)]
struct Args {
    /// Serial port to monitor (optional; auto-detected by `smctl connect` if omitted).
    #[arg(long)]
    port: Option<String>,

    #[arg(long, default_value_t = 115_200)]
    baudrate: u32,

    /// Don't auto-connect to `--port` on startup.
    #[arg(long, default_value_t = false)]
    no_autoconnect: bool,

    #[arg(long = "max-records")]
    max_records: Option<u64>,

    #[arg(long = "cleanup-interval")]
    cleanup_interval: Option<u64>,

    #[arg(long = "rapid-retry")]
    rapid_retry: Option<u64>,

    #[arg(long = "slow-retry")]
    slow_retry: Option<u64>,

    /// Echo captured lines to the daemon log as they arrive.
    #[arg(long, default_value_t = false)]
    echo: bool,
}

impl Args {
    /// Layer CLI flags over the config file over built-in defaults.
    fn apply_to(self, mut config: Config) -> Config {
        if self.port.is_some() {
            config.port = self.port;
        }
        config.baudrate = self.baudrate;
        config.no_autoconnect = config.no_autoconnect || self.no_autoconnect;
        if let Some(v) = self.max_records {
            config.max_records = v;
        }
        if let Some(v) = self.cleanup_interval {
            config.cleanup_interval_secs = v;
        }
        if let Some(v) = self.rapid_retry {
            config.rapid_retry_secs = v;
        }
        if let Some(v) = self.slow_retry {
            config.slow_retry_secs = v;
        }
        config.echo = config.echo || self.echo;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let base_dir = Registrar::default_base_dir();
    std::fs::create_dir_all(&base_dir).context("failed to create ~/.serial-monitor")?;

    let _log_guard = smd_telemetry::logging::init_file_logging(
        "smd-daemon",
        "info",
        base_dir.join("daemon.log"),
    )
    .context("failed to initialize file logging")?;

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config.toml, using defaults");
        Config::default()
    });
    let config = args.apply_to(config);

    info!(pid = std::process::id(), "serial-monitor daemon starting");

    let daemon = match smd_daemon::Daemon::start(config, base_dir).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to start daemon: {e:#}");
            std::process::exit(1);
        }
    };

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("interrupt received, initiating shutdown");
        shutdown.trigger();
    });

    #[cfg(unix)]
    {
        let shutdown = daemon.shutdown_handle();
        tokio::spawn(async move {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            term.recv().await;
            info!("SIGTERM received, initiating shutdown");
            shutdown.trigger();
        });
    }

    {
        let daemon = daemon.clone();
        let mut shutdown_rx = daemon.shutdown_handle().subscribe();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            daemon.stop();
        });
    }

    daemon.run().await;
    Ok(())
}
