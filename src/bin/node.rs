//! Montana Mesh — standalone node binary.
//!
//! Runs a `MeshEngine` in a tight `step()` loop, logging every event at
//! `info` and sleeping for the adaptive interval `step()` returns between
//! iterations.

use std::net::SocketAddrV4;
use std::path::PathBuf;

use clap::Parser;
use montana_mesh::config::{DiscoveryConfig, FileConfig, MeshConfig};
use montana_mesh::{Event, MeshEngine};
use tracing::{error, info, warn};
use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "montana-mesh-node", version, about = "Montana Mesh: LAN peer discovery and channels")]
struct Args {
    /// Config file (TOML). Overrides all other flags when given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP listener bind address.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    listen: SocketAddrV4,

    /// UDP discovery bind address.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    discovery_bind: SocketAddrV4,

    /// Discovery beacon targets, comma-separated (e.g. broadcast addresses).
    #[arg(short, long)]
    targets: Option<String>,

    /// Directory for completed/resumable downloads.
    #[arg(long, default_value = "./downloads")]
    download_dir: PathBuf,

    /// Durable reliable-delivery outbox directory.
    #[arg(long, default_value = "./outbox")]
    outbox_dir: PathBuf,
}

fn build_config(args: &Args) -> montana_mesh::Result<MeshConfig> {
    if let Some(path) = &args.config {
        return MeshConfig::load(path);
    }
    let targets = args
        .targets
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse())
        .collect::<Result<Vec<SocketAddrV4>, _>>()
        .map_err(|e| montana_mesh::MeshError::Configuration(format!("invalid --targets: {e}")))?;

    let config = MeshConfig {
        listener_saddr: args.listen,
        discovery: DiscoveryConfig { bind: args.discovery_bind, targets, ..Default::default() },
        file: FileConfig { download_directory: args.download_dir.clone(), ..Default::default() },
        outbox_directory: args.outbox_dir.clone(),
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("montana_mesh=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let own_uuid = Uuid::new_v4();
    info!("Montana Mesh v{VERSION} starting as {own_uuid}");

    let mut engine = match MeshEngine::new(own_uuid, config) {
        Ok(e) => e,
        Err(e) => {
            error!("failed to start mesh engine: {e}");
            std::process::exit(1);
        }
    };

    if let Ok(addr) = engine.listener_addr() {
        info!("listening on {addr}");
    }

    loop {
        match engine.step() {
            Ok((events, interval)) => {
                for event in events {
                    log_event(&event);
                }
                std::thread::sleep(interval);
            }
            Err(e) => {
                error!("engine step failed: {e}");
                if !e.is_recoverable() {
                    std::process::exit(1);
                }
            }
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::PeerDiscovered { uuid, addr, .. } => info!(%uuid, %addr, "peer discovered"),
        Event::PeerExpired { uuid, addr } => info!(%uuid, %addr, "peer expired"),
        Event::ChannelEstablished { uuid } => info!(%uuid, "channel established"),
        Event::ChannelClosed { uuid } => info!(%uuid, "channel closed"),
        Event::DownloadComplete { uuid, file_id, path } => {
            info!(%uuid, file_id, path = %path.display(), "download complete")
        }
        Event::DownloadInterrupted { uuid, file_id, reason } => {
            warn!(%uuid, file_id, reason, "download interrupted")
        }
        Event::OnError { context, message } => warn!(context, message, "recoverable error"),
        Event::OnFailure { uuid, message } => warn!(?uuid, message, "peer failure"),
        other => tracing::debug!(?other, "event"),
    }
}
