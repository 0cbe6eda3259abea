//! Runs a single mesh peer until interrupted.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use p2p_peer::{Config, PeerHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "p2p-peer", version, about)]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unique peer name. Overrides the configuration file.
    #[arg(long)]
    name: Option<String>,

    /// Port to listen on. Overrides the configuration file.
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind the listener to. Overrides the configuration file.
    #[arg(long)]
    bind_host: Option<String>,

    /// Peer to connect to on startup, as `host:port`. May be repeated.
    #[arg(long = "connect", value_name = "HOST:PORT", value_parser = parse_endpoint)]
    connect: Vec<(String, u16)>,

    /// Minimum number of connections to maintain. Overrides the configuration file.
    #[arg(long)]
    min_connections: Option<usize>,
}

fn parse_endpoint(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {s:?}"))?;
    let port = port
        .parse()
        .map_err(|err| format!("invalid port {port:?}: {err}"))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn build_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if let Some(name) = &args.name {
        config.peer_id = name.as_str().into();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind_host) = &args.bind_host {
        config.bind_host = bind_host.clone();
    }
    if let Some(min) = args.min_connections {
        config.min_active_connections = min;
    }
    if args.config.is_none() && args.name.is_none() {
        return Err("either --name or --config is required".into());
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let peer = PeerHandle::start(config).await?;
    info!(peer = %peer.peer_id(), addr = %peer.local_addr(), "peer started");

    for (host, port) in &args.connect {
        if let Err(err) = peer.connect(host.as_str(), *port).await {
            warn!(%host, port, "initial connection failed: {err}");
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {err}");
    }
    info!("shutting down");
    peer.leave().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
