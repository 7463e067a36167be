// Gossip Engine - Anti-entropy reconciliation between peers
//
// Two independent sources of work feed the engine:
// - Ticker: every interval, send a connect request to one random peer
// - Inbound: every received frame is handled in its own task
//
// Handlers keep no per-peer session. Each message is handled from its tag
// and the two shared stores, each behind its own lock.

use crate::content::{BundleError, ContentBundler};
use crate::sync::peer::{Peer, PeerDirectory, PeerError};
use crate::sync::protocol::{Envelope, Message, ProtocolError};
use crate::transport::{InboundFrame, Transport};
use crate::versions::{VersionError, VersionStore};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Gossip-related errors
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Version store error: {0}")]
    Versions(#[from] VersionError),

    #[error("Peer directory error: {0}")]
    Peers(#[from] PeerError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),
}

impl GossipError {
    /// Whether the peer sent something this node cannot understand at all
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, GossipError::Protocol(ProtocolError::UnknownTag(_)))
    }
}

/// Configuration for the gossip engine
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Port advertised in every outgoing message
    pub listen_port: u16,
    /// Time between gossip ticks
    pub tick_interval: Duration,
    /// Addresses of this host besides loopback, used to avoid self-connects
    pub local_addresses: Vec<IpAddr>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            tick_interval: Duration::from_millis(1000),
            local_addresses: Vec::new(),
        }
    }
}

impl GossipConfig {
    /// Create a new config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised listening port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Set tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Add an address that belongs to this host
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_addresses.push(addr);
        self
    }
}

/// Statistics about the gossip engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub ticks: u64,
    pub messages_handled: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub protocol_errors: u64,
    pub entries_ingested: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    messages_handled: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    protocol_errors: AtomicU64,
    entries_ingested: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GossipStats {
        GossipStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            entries_ingested: self.entries_ingested.load(Ordering::Relaxed),
        }
    }
}

/// The gossip engine - drives handshakes, membership and version exchange
pub struct GossipEngine {
    config: GossipConfig,
    versions: Arc<Mutex<VersionStore>>,
    peers: Arc<Mutex<PeerDirectory>>,
    transport: Arc<dyn Transport>,
    bundler: Arc<dyn ContentBundler>,
    counters: Arc<Counters>,
}

impl GossipEngine {
    /// Create a new gossip engine owning both stores
    pub fn new(
        config: GossipConfig,
        versions: VersionStore,
        peers: PeerDirectory,
        transport: Arc<dyn Transport>,
        bundler: Arc<dyn ContentBundler>,
    ) -> Self {
        Self {
            config,
            versions: Arc::new(Mutex::new(versions)),
            peers: Arc::new(Mutex::new(peers)),
            transport,
            bundler,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Shared version store, for local filesystem events
    pub fn versions(&self) -> Arc<Mutex<VersionStore>> {
        Arc::clone(&self.versions)
    }

    /// Shared peer directory
    pub fn peers(&self) -> Arc<Mutex<PeerDirectory>> {
        Arc::clone(&self.peers)
    }

    /// Get statistics
    pub fn stats(&self) -> GossipStats {
        self.counters.snapshot()
    }

    /// Whether `peer` names this node's own listener
    pub fn is_self(&self, peer: &Peer) -> bool {
        let ip = peer.ip();
        peer.port() == self.config.listen_port
            && (ip.is_loopback() || ip.is_unspecified() || self.config.local_addresses.contains(&ip))
    }

    // ========================================================================
    // MAIN LOOP
    // ========================================================================

    /// Run the ticker and inbound dispatch until the inbound channel closes
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundFrame>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(port = self.config.listen_port, "gossip engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "gossip tick failed");
                    }
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_frame(&frame.data, frame.from).await {
                            if e.is_protocol_violation() {
                                error!(from = %frame.from, error = %e, "dropping message");
                            } else {
                                warn!(from = %frame.from, error = %e, "message handling failed");
                            }
                        }
                    });
                }
            }
        }

        info!("inbound channel closed, gossip engine stopped");
    }

    /// One gossip round: contact a random peer other than ourselves.
    /// Returns the peer contacted, if any.
    pub async fn tick(&self) -> Result<Option<Peer>, GossipError> {
        Counters::bump(&self.counters.ticks, 1);

        let target = {
            let peers = self.peers.lock().await;
            peers.select_random_excluding(|peer| self.is_self(peer))
        };

        match target {
            Some(peer) => {
                debug!(%peer, "gossip tick");
                self.dispatch(peer, vec![Message::ConnectRequest])?;
                Ok(Some(peer))
            }
            None => Ok(None),
        }
    }

    /// Ask `peer` to connect back to us
    pub fn invite(&self, peer: Peer) -> Result<(), GossipError> {
        self.dispatch(peer, vec![Message::Invitation])
    }

    // ========================================================================
    // MESSAGE PROCESSING
    // ========================================================================

    /// Decode and handle one inbound frame
    pub async fn handle_frame(&self, frame: &[u8], from: SocketAddr) -> Result<(), GossipError> {
        let envelope = Envelope::decode(frame).inspect_err(|_| {
            Counters::bump(&self.counters.protocol_errors, 1);
        })?;

        // Reply to the sender's listener, not the connection's source port
        let peer = Peer::new(from.ip(), envelope.listen_port());
        self.handle_message(peer, envelope.into_message()).await
    }

    /// Handle one decoded message from `peer`
    pub async fn handle_message(&self, peer: Peer, message: Message) -> Result<(), GossipError> {
        Counters::bump(&self.counters.messages_handled, 1);
        debug!(%peer, kind = %message.kind(), "received");

        match message {
            Message::Invitation => self.dispatch(peer, vec![Message::AcceptInvitation]),

            Message::AcceptInvitation => self.dispatch(peer, vec![Message::ConnectRequest]),

            Message::ConnectRequest => {
                let mut outgoing = vec![Message::AcceptConnect];
                outgoing.extend(self.metadata().await);
                self.dispatch(peer, outgoing)
            }

            Message::AcceptConnect => {
                let outgoing = self.metadata().await;
                self.dispatch(peer, outgoing)
            }

            Message::PeerList(list) => {
                let mut peers = self.peers.lock().await;
                peers.add_and_flush(peer)?;
                let added = peers.merge_with(&PeerDirectory::from_peers(list))?;
                if added > 0 {
                    info!(%peer, added, known = peers.len(), "merged peer list");
                }
                Ok(())
            }

            Message::VersionList(files) => {
                let remote = VersionStore::from_files(files);
                let frame = {
                    let versions = self.versions.lock().await;
                    let missing = versions.diff_missing(&remote);
                    if !missing.is_empty() {
                        let entries: usize = missing.iter().map(|item| item.history().len()).sum();
                        info!(%peer, files = missing.len(), entries, "requesting missing versions");
                    }
                    self.encode(Message::FileRequest(missing))?
                };
                self.send_frames(peer, vec![frame], None);
                Ok(())
            }

            Message::FileRequest(request) => {
                let (frame, artifact) = {
                    let versions = self.versions.lock().await;
                    let (payload, artifact) = self.bundler.bundle(&versions, &request)?.into_parts();
                    match self.encode(Message::FileData(payload)) {
                        Ok(frame) => (frame, artifact),
                        Err(e) => {
                            if let Some(path) = artifact {
                                if let Err(cleanup) = std::fs::remove_file(&path) {
                                    warn!(path = %path.display(), error = %cleanup, "failed to remove bundle artifact");
                                }
                            }
                            return Err(e);
                        }
                    }
                };
                self.send_frames(peer, vec![frame], artifact);
                Ok(())
            }

            Message::FileData(payload) => {
                let mut versions = self.versions.lock().await;
                let appended = self.bundler.ingest(&mut versions, &payload)?;
                versions.flush()?;
                Counters::bump(&self.counters.entries_ingested, appended as u64);
                if appended > 0 {
                    info!(%peer, entries = appended, "ingested file data");
                }
                Ok(())
            }
        }
    }

    /// Peer list then version list, each taken under its own lock
    async fn metadata(&self) -> Vec<Message> {
        let peer_list = self.peers.lock().await.snapshot();
        let version_list = self.versions.lock().await.files().to_vec();
        vec![Message::PeerList(peer_list), Message::VersionList(version_list)]
    }

    fn encode(&self, message: Message) -> Result<Vec<u8>, GossipError> {
        Ok(Envelope::new(self.config.listen_port, message).encode()?)
    }

    fn dispatch(&self, peer: Peer, messages: Vec<Message>) -> Result<(), GossipError> {
        let frames = messages
            .into_iter()
            .map(|message| self.encode(message))
            .collect::<Result<Vec<_>, _>>()?;
        self.send_frames(peer, frames, None);
        Ok(())
    }

    /// Send frames in order on a background task, then remove `cleanup`
    /// whether or not the sends succeeded
    fn send_frames(&self, peer: Peer, frames: Vec<Vec<u8>>, cleanup: Option<PathBuf>) {
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            for frame in frames {
                match transport.send(&peer, frame).await {
                    Ok(()) => Counters::bump(&counters.messages_sent, 1),
                    Err(e) => {
                        Counters::bump(&counters.send_failures, 1);
                        warn!(%peer, error = %e, "send failed");
                        break;
                    }
                }
            }

            if let Some(path) = cleanup {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to remove bundle artifact");
                }
            }
        });
    }
}
