use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use murmur::{Keypair, NetworkError, Node, NodeConfig, PeerAddress, PeerEvent};

/// Chat over gossip pubsub: stdin lines are published, messages are printed.
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address, e.g. /ip4/0.0.0.0/tcp/4001 or /ip4/0.0.0.0/tcp/4002/ws.
    #[arg(short, long = "listen", value_name = "ADDR", default_value = "/ip4/0.0.0.0/tcp/0")]
    listen: Vec<PeerAddress>,

    /// Bootstrap peer, optionally ending in /p2p/<peer id>.
    #[arg(short, long = "peer", value_name = "ADDR")]
    peer: Vec<PeerAddress>,

    #[arg(short, long, default_value = "chat")]
    topic: String,

    /// Treat every connected peer as an explicit gossip peer.
    #[arg(long)]
    explicit_peers: bool,

    /// Hex-encoded 32-byte Ed25519 secret key for a stable identity.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<String>,
}

fn load_keypair(secret: Option<&str>) -> Result<Keypair> {
    let Some(secret) = secret else {
        return Ok(Keypair::generate());
    };
    let bytes = hex::decode(secret).context("invalid hex secret key")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
    Ok(Keypair::from_secret_key_bytes(&bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = load_keypair(args.secret_key.as_deref())?;
    let config = NodeConfig {
        listen_addrs: args.listen,
        bootstrap: args.peer,
        ..NodeConfig::default()
    };
    let node = Node::new(keypair, config);
    node.start().await.context("failed to start node")?;

    info!("Node identity: {}", node.peer_id());
    for addr in node.listen_addrs().await {
        info!("Listening on {}", addr.with_peer_id(node.peer_id()));
    }

    let mut subscription = node.subscribe(&args.topic).await?;
    let mut events = node.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match node.publish(&args.topic, line.into_bytes()).await {
                    Ok(_) => {}
                    Err(NetworkError::NoPeers) => warn!("no peers subscribed to {} yet", args.topic),
                    Err(e) => warn!(error = %e, "publish failed"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            message = subscription.next() => {
                let Some(message) = message else {
                    break;
                };
                println!("{}: {}", message.source.short(), String::from_utf8_lossy(&message.data));
            }
            event = events.recv() => match event {
                Ok(PeerEvent::Connected { peer, info }) => {
                    info!(peer = %peer.short(), addr = %info.remote_addr, "peer connected");
                    if args.explicit_peers {
                        node.add_explicit_peer(peer).await;
                    }
                }
                Ok(PeerEvent::Disconnected { peer, .. }) => {
                    info!(peer = %peer.short(), "peer disconnected");
                }
                Ok(PeerEvent::Discovered { peer, addrs }) => {
                    debug!(peer = %peer.short(), addrs = addrs.len(), "peer discovered");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    node.stop().await;
    Ok(())
}
