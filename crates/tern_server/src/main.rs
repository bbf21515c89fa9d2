//! ternd - the Tern audio server daemon
//!
//! Binds the control socket, brings up the engine thread and the fallback
//! and loopback devices, then parses client IPC until killed. Device
//! enumeration (ALSA cards, USB hotplug) and the Bluetooth bus live in
//! external collaborators that feed the device list; a bare `ternd` still
//! services streams on the fallback devices.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tern_server::Server;

#[derive(Parser, Debug)]
#[command(name = "ternd", about = "Tern audio server", version)]
struct Args {
    /// Control socket path
    #[arg(long, default_value = "/run/tern/ternd.sock")]
    socket: PathBuf,

    /// Log filter, e.g. "info" or "tern_core=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let mut server = Server::new(&args.socket)
        .with_context(|| format!("failed to bind {}", args.socket.display()))?;
    server.run().context("server loop failed")
}
