//! NetProxy host shim
//!
//! Drives the tunnel session core from newline-delimited JSON commands on
//! stdin and writes one JSON reply per line to stdout. Logs go to stderr.
//!
//! ```text
//! $ echo '{"method":"startVpn","proxyHost":"127.0.0.1","proxyPort":9099}' | netproxy-host
//! {"result":true}
//! ```
//!
//! Usage: `netproxy-host [settings.toml]`

use anyhow::{Context, Result};
use netproxy_vpn::simulated::{IdleProcessor, SimulatedPlatform};
use netproxy_vpn::{HostSettings, SessionController, VpnService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const HOST_APP_ID: &str = "com.network.proxy";

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let settings = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => HostSettings::from_toml_file(&path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => HostSettings::default(),
    };

    info!(
        "NetProxy host starting (mtu {}, address {}/{})",
        settings.mtu, settings.virtual_address, settings.virtual_prefix
    );

    let platform = Arc::new(SimulatedPlatform::new(HOST_APP_ID));
    let controller = Arc::new(SessionController::new(
        platform,
        Arc::new(IdleProcessor),
        settings,
    ));
    let service = VpnService::new(controller.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading command")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = service.handle_json(&line).await;
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    // Process teardown stops any running session
    tokio::task::spawn_blocking(move || controller.stop()).await?;

    info!("NetProxy host shutting down");
    Ok(())
}
