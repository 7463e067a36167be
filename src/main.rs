// gossipfs node - replicate a directory with the peers it can reach

use clap::Parser;
use gossipfs::content::DirectoryBundler;
use gossipfs::sync::{GossipConfig, GossipEngine, Peer, PeerDirectory};
use gossipfs::transport::{TcpTransport, TcpTransportConfig, Transport};
use gossipfs::versions::VersionStore;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Anti-entropy file replication node
#[derive(Parser, Debug)]
#[command(name = "gossipfs", version, about)]
struct Cli {
    /// Port to listen on for peer messages
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Peer directory database
    #[arg(long, default_value = "peers.db")]
    peers: PathBuf,

    /// Version history database
    #[arg(long, default_value = "versions.db")]
    versions: PathBuf,

    /// Directory tree to replicate
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Invite a peer (ip:port) on startup; may be repeated
    #[arg(long = "invite", value_name = "ADDR")]
    invites: Vec<SocketAddr>,

    /// Milliseconds between gossip rounds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "gossipfs=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let versions = VersionStore::load(&cli.versions)?;
    let peers = PeerDirectory::load(&cli.peers)?;
    let bundler = DirectoryBundler::new(&cli.root)?;

    let (transport, inbound) =
        TcpTransport::bind(TcpTransportConfig::new().with_bind_port(cli.port)).await?;
    let listen_port = transport.local_port();

    let config = GossipConfig::new()
        .with_listen_port(listen_port)
        .with_tick_interval(Duration::from_millis(cli.interval_ms));
    let engine = Arc::new(GossipEngine::new(
        config,
        versions,
        peers,
        Arc::new(transport),
        Arc::new(bundler),
    ));

    let files = engine.versions().lock().await.len();
    let known_peers = engine.peers().lock().await.len();
    info!(
        port = listen_port,
        root = %cli.root.display(),
        files,
        peers = known_peers,
        "node ready"
    );

    for addr in cli.invites {
        if let Err(e) = engine.invite(Peer::from(addr)) {
            warn!(%addr, error = %e, "invite failed");
        }
    }

    tokio::select! {
        _ = Arc::clone(&engine).run(inbound) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    engine.versions().lock().await.flush()?;
    engine.peers().lock().await.flush()?;
    Ok(())
}
