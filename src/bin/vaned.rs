//! Local development/test harness for the `vaned` core. Not part of the
//! mobile FFI surface (§6) — a stand-in for manual testing on a host
//! that can open `/dev/net/tun` itself, the way the teacher's `main.rs`
//! wires a `Cli` into `prism::run`.

use std::os::fd::AsRawFd;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "vaned", version, about = "vaned core development harness")]
struct Cli {
    /// Path to the node configuration JSON (§3).
    #[arg(long, env = "VANED_CONFIG")]
    config: std::path::PathBuf,

    /// Run a TUN-backed core by opening this device path (e.g.
    /// `/dev/net/tun`) instead of the local-only SOCKS/HTTP inbound.
    #[arg(long)]
    tun: Option<std::path::PathBuf>,

    /// MTU for the TUN device, when `--tun` is set.
    #[arg(long, default_value_t = 1500)]
    mtu: i32,

    /// Local SOCKS/HTTP port to bind when not running in TUN mode.
    #[arg(long, default_value_t = 1080)]
    local_port: u16,

    /// Emit structured JSON logs instead of the default human-readable format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logrt = vaned::core::logging::init(cli.json_logs)?;

    let config_json = std::fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("read config {}: {e}", cli.config.display()))?;

    let err = if let Some(tun_path) = &cli.tun {
        let fd = open_tun(tun_path)?;
        vaned::start_vpn(fd, cli.mtu, &config_json)
    } else {
        vaned::start(cli.local_port, &config_json)
    };

    if !err.is_empty() {
        anyhow::bail!("start failed: {err}");
    }

    tracing::info!(running = vaned::is_running(), "vaned: started");

    shutdown_signal().await;
    tracing::info!("vaned: shutting down");
    vaned::stop();
    Ok(())
}

/// Opens a raw TUN device file. This harness does not itself configure
/// IP addresses/routes on the resulting interface — that is the host
/// platform's job in production, and the operator's job here, mirroring
/// the core's contract of never touching interface configuration itself
/// (§4.A).
fn open_tun(path: &std::path::Path) -> anyhow::Result<i32> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("open {}: {e}", path.display()))?;
    let fd = file.as_raw_fd();
    std::mem::forget(file); // ownership transfers to the core; see TunDevice::from_raw_fd
    Ok(fd)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

