#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smd_channel::{Command, FileClient, Request, Response};
use smd_core::lockfile::Registrar;

/// Control client for the serial monitor daemon.
#[derive(Parser)]
#[command(name = "smctl", version, about)]
struct Cli {
    /// Directory holding the daemon's lock, store, and command files.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Emit raw JSON responses instead of a formatted summary.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the daemon as a detached background process.
    Start {
        /// Serial port to monitor.
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        baudrate: Option<u32>,
        #[arg(long, default_value_t = false)]
        no_autoconnect: bool,
    },

    /// Connect the daemon to a serial port (auto-detected if omitted).
    Connect {
        /// Serial port to open; omit to auto-detect a Pico.
        port: Option<String>,
        #[arg(long, default_value_t = 115_200)]
        baudrate: u32,
    },

    /// Disconnect the daemon from its current port.
    Disconnect,

    /// Write a line of text to the connected port.
    Write {
        /// Text to send.
        data: String,
    },

    /// Report the daemon's current status.
    Status,

    /// Toggle echoing of captured lines into the daemon log.
    SetEcho {
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let base_dir = cli.base_dir.unwrap_or_else(Registrar::default_base_dir);

    if let Commands::Start {
        port,
        baudrate,
        no_autoconnect,
    } = &cli.command
    {
        return start_daemon(&base_dir, port.as_deref(), *baudrate, *no_autoconnect);
    }

    let request = match cli.command {
        Commands::Connect { port, baudrate } => Command::Connect { port, baudrate },
        Commands::Disconnect => Command::Disconnect,
        Commands::Write { data } => Command::Write { data },
        Commands::Status => Command::Status,
        Commands::SetEcho { enabled } => Command::SetEcho { enabled },
        Commands::Start { .. } => unreachable!("handled above"),
    };

    let client = FileClient::new(&base_dir);
    let response = client
        .send(&Request {
            command: request,
            timestamp: unix_now_f64(),
        })
        .await
        .context("no response from daemon — is it running? (try `smctl start`)")?;

    print_response(&response, cli.json);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Spawn `smd-daemon` detached from this process's session, so it survives
/// `smctl start` exiting (the daemon is expected to double-fork itself via
/// its own signal handling once running; here we only need it to outlive
/// this short-lived launcher).
fn start_daemon(
    base_dir: &std::path::Path,
    port: Option<&str>,
    baudrate: Option<u32>,
    no_autoconnect: bool,
) -> Result<()> {
    if let Some(state) = Registrar::new(base_dir).inspect() {
        if smd_core::lockfile::is_alive(state.pid) {
            println!("daemon already running (pid={})", state.pid);
            return Ok(());
        }
    }

    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("smd-daemon")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("smd-daemon"));

    let mut cmd = std::process::Command::new(exe);
    if let Some(port) = port {
        cmd.arg("--port").arg(port);
    }
    if let Some(baudrate) = baudrate {
        cmd.arg("--baudrate").arg(baudrate.to_string());
    }
    if no_autoconnect {
        cmd.arg("--no-autoconnect");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("failed to spawn smd-daemon")?;
    println!("daemon starting (pid={})", child.id());
    Ok(())
}

fn print_response(response: &Response, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(response).expect("Response always serializes")
        );
        return;
    }

    if response.success {
        println!("{}", response.message);
    } else {
        eprintln!(
            "error: {}",
            response.error.as_deref().unwrap_or(&response.message)
        );
    }
    if let Some(status) = &response.status {
        println!(
            "running={} monitoring={} port={} baudrate={} session={} pid={} uptime={}s lines={}",
            status.running,
            status.monitoring,
            status.port.as_deref().unwrap_or("-"),
            status
                .baudrate
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.session_id,
            status.pid,
            status.uptime,
            status
                .lines_captured
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    if let Some(candidates) = &response.candidates {
        for c in candidates {
            println!(
                "  {} — {} ({})",
                c.port_name,
                c.manufacturer.as_deref().unwrap_or("unknown"),
                c.description.as_deref().unwrap_or("no description"),
            );
        }
    }
}

fn unix_now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_without_a_port_auto_detects() {
        let cli = Cli::parse_from(["smctl", "connect"]);
        match cli.command {
            Commands::Connect { port, baudrate } => {
                assert_eq!(port, None);
                assert_eq!(baudrate, 115_200);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn connect_with_explicit_port_and_baudrate() {
        let cli = Cli::parse_from(["smctl", "connect", "/dev/ttyACM0", "--baudrate", "9600"]);
        match cli.command {
            Commands::Connect { port, baudrate } => {
                assert_eq!(port.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(baudrate, 9600);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn write_requires_its_data_argument() {
        assert!(Cli::try_parse_from(["smctl", "write"]).is_err());
        let cli = Cli::parse_from(["smctl", "write", "hello world"]);
        match cli.command {
            Commands::Write { data } => assert_eq!(data, "hello world"),
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn start_accepts_port_and_no_autoconnect_flags() {
        let cli = Cli::parse_from(["smctl", "start", "--port", "/dev/ttyACM0", "--no-autoconnect"]);
        match cli.command {
            Commands::Start {
                port,
                baudrate,
                no_autoconnect,
            } => {
                assert_eq!(port.as_deref(), Some("/dev/ttyACM0"));
                assert_eq!(baudrate, None);
                assert!(no_autoconnect);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
