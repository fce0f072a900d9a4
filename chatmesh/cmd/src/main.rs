//! Mesh chat node binary.
//!
//! A development harness for the protocol core: TCP links stand in for the
//! short-range transport, the console stands in for the UI. Lines typed at
//! stdin are broadcast to the mesh; `/msg <peer-id> <text>` sends privately,
//! `/peers` lists the peer table, `/quit` leaves the mesh.

use anyhow::Result;
use chatmesh_core::{MeshConfig, MeshDelegate, MeshService};
use chatmesh_wire::{ChatMessage, PeerId};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod links;

use config::NodeConfig;
use links::TcpLinks;

/// Peer-to-peer mesh chat node over TCP links
#[derive(Parser, Debug)]
#[command(name = "chatmesh", version, about = "Peer-to-peer mesh chat node")]
struct Args {
    /// Peer id as up to 16 hex digits (random when omitted)
    #[arg(long)]
    peer_id: Option<String>,

    /// Display name announced to peers
    #[arg(long)]
    nickname: Option<String>,

    /// Listen address, e.g. 0.0.0.0:9400
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to address, e.g. 127.0.0.1:9400 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Relay probability, 0.0-1.0
    #[arg(long)]
    relay_probability: Option<f64>,

    /// Fragment sweep interval, e.g. 30s
    #[arg(long, default_value = "30s")]
    sweep_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional YAML config file; CLI flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Prints mesh events to the console log
#[derive(Debug)]
struct ConsoleDelegate;

impl MeshDelegate for ConsoleDelegate {
    fn on_message(&self, message: ChatMessage) {
        let scope = if message.is_private {
            "private"
        } else {
            message.channel.as_deref().unwrap_or("public")
        };
        info!(from = %message.sender, scope, "{}", message.content);
    }

    fn on_peer_connected(&self, peer: PeerId) {
        info!(%peer, "peer joined");
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        info!(%peer, "peer left");
    }

    fn on_peer_list_changed(&self) {}
}

fn build_mesh_config(args: &Args, file: &NodeConfig) -> Result<MeshConfig> {
    let mut config = MeshConfig::default();

    if let Some(hex) = args.peer_id.as_deref().or(file.peer_id.as_deref()) {
        config.peer_id =
            PeerId::parse_hex(hex).map_err(|error| anyhow::anyhow!("bad peer id: {error}"))?;
    }
    if let Some(nickname) = args.nickname.clone().or_else(|| file.nickname.clone()) {
        config.nickname = nickname;
    }
    if let Some(probability) = args.relay_probability.or(file.relay_probability) {
        config.relay_probability = probability;
    }
    config.sweep_interval = args.sweep_interval.into();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let file = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::default(),
    };

    let mesh_config = build_mesh_config(&args, &file)?;
    info!(peer = %mesh_config.peer_id, nickname = %mesh_config.nickname, "starting node");

    let (event_tx, event_rx) = mpsc::channel(256);
    let links = Arc::new(TcpLinks::new(event_tx));

    let service = MeshService::start(
        mesh_config,
        links.clone(),
        Arc::new(ConsoleDelegate),
        event_rx,
    );

    if let Some(addr) = args.listen.or(file.listen) {
        links.listen(addr).await?;
    }
    for addr in args.connect.iter().chain(file.connect.iter()) {
        links.dial(*addr);
    }

    run_console(&service).await;

    service.stop().await.ok();
    // Give the LEAVE broadcast a moment on the wire before sockets drop
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn run_console(service: &MeshService) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(service, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        error!(%error, "stdin read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Returns `false` when the console should exit.
async fn handle_line(service: &MeshService, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if let Some(rest) = line.strip_prefix("/msg ") {
        let Some((peer_hex, text)) = rest.split_once(' ') else {
            warn!("usage: /msg <peer-id> <text>");
            return true;
        };
        match PeerId::parse_hex(peer_hex) {
            Ok(peer) => {
                if let Err(error) = service.send_private(text, peer).await {
                    warn!(%error, "private send failed");
                }
            }
            Err(error) => warn!(%error, "bad peer id"),
        }
        return true;
    }

    match line {
        "/quit" => false,
        "/peers" => {
            match service.peers().await {
                Ok(peers) => {
                    for peer in peers {
                        info!(
                            peer = %peer.peer_id,
                            nickname = peer.nickname.as_deref().unwrap_or("?"),
                            state = ?peer.state,
                            "known peer"
                        );
                    }
                }
                Err(error) => warn!(%error, "peer query failed"),
            }
            true
        }
        _ => {
            if let Err(error) = service.send_broadcast(line, Vec::new(), None).await {
                warn!(%error, "broadcast failed");
            }
            true
        }
    }
}
