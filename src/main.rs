use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use gossip_relay::{config::Config, peer, peer::Role, state::NodeState, wire};
use task_group::TaskGroup;
use tokio::{net::TcpListener, time::sleep};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Gossip relay node for an unobservable overlay network (spec §10.2).
#[derive(Parser, Debug)]
#[clap(name = "gossip-relay", version)]
struct Opts {
    /// Path to the TOML configuration file.
    #[clap(short, long, env = "GOSSIP_CONFIG", default_value = "config.toml")]
    config: String,

    /// Default tracing level used when `RUST_LOG` is unset.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let filter = if std::env::var(EnvFilter::DEFAULT_ENV)
        .unwrap_or_default()
        .is_empty()
    {
        EnvFilter::new(format!("gossip_relay={log_level}"))
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts: Opts = Opts::parse();

    let config = Config::load(&opts.config)
        .with_context(|| format!("loading configuration from {}", opts.config))?;

    init_tracing(&opts.log_level);

    // Config errors are fatal before this point; nothing below binds a
    // socket until these all resolve (spec §7).
    let p2p_addr = config.p2p_addr()?;
    let api_addr = config.api_addr()?;
    let bootstrapper_addr = config.bootstrapper_addr()?;

    let p2p_listener = TcpListener::bind(p2p_addr)
        .await
        .with_context(|| format!("binding peer listener on {p2p_addr}"))?;
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding API listener on {api_addr}"))?;

    info!(%p2p_addr, %api_addr, degree = config.degree, "gossip relay node starting");

    let state = Arc::new(NodeState::new(config, p2p_addr));
    let tasks = Arc::new(TaskGroup::new());

    // One-shot bootstrap dial, initiated before the discovery loop
    // begins (spec §4.6).
    {
        let state = state.clone();
        tasks.spawn(async move {
            peer::dial_peer(state, bootstrapper_addr).await;
        });
    }

    tasks.spawn(discovery_loop(state.clone()));
    tasks.spawn(accept_peers(state.clone(), p2p_listener));
    tasks.spawn(accept_api_clients(state.clone(), api_listener));

    // The accept loops and discovery loop run for the process
    // lifetime; there is nothing left for `main` to do but wait.
    std::future::pending::<()>().await;
    Ok(())
}

async fn accept_peers(state: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                let state = state.clone();
                tokio::spawn(peer::run_peer_session(state, stream, remote_addr, Role::Listener));
            }
            Err(err) => warn!(%err, "failed to accept peer connection"),
        }
    }
}

async fn accept_api_clients(state: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                let state = state.clone();
                tokio::spawn(gossip_relay::api::run_api_session(state, stream, remote_addr));
            }
            Err(err) => warn!(%err, "failed to accept API connection"),
        }
    }
}

/// Periodic peer-discover fan-out (spec §4.6): every
/// `discovery_cooldown` seconds, if the verified set is below
/// `degree`, ask every verified peer for more peers concurrently.
async fn discovery_loop(state: Arc<NodeState>) {
    let cooldown = Duration::from_secs(state.config.discovery_cooldown);
    loop {
        sleep(cooldown).await;
        if state.verified_peer_count() >= state.config.degree {
            continue;
        }
        let peers = state.verified_peers_snapshot();
        info!(count = peers.len(), "discovery round: polling verified peers");
        for peer in peers {
            peer.send(wire::PEER_DISCOVER, Bytes::new());
        }
    }
}
