// Gossip Tests
// Tests for the handshake state machine, reconciliation, and the gossip loop

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use gossipfs::content::{Bundle, BundleError, ContentBundler, DirectoryBundler};
use gossipfs::sync::{
    Envelope, GossipConfig, GossipEngine, Message, MessageKind, Peer, PeerDirectory,
};
use gossipfs::transport::{InboundFrame, MemoryNetwork};
use gossipfs::versions::{ContentHash, FileItem, VersionStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(secs)
}

fn peer(addr: &str) -> Peer {
    Peer::from(addr.parse::<SocketAddr>().unwrap())
}

async fn next_envelope(rx: &mut mpsc::Receiver<InboundFrame>) -> Envelope {
    let frame = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed");
    Envelope::decode(&frame.data).unwrap()
}

async fn next_kinds(rx: &mut mpsc::Receiver<InboundFrame>, count: usize) -> Vec<MessageKind> {
    let mut kinds = Vec::new();
    for _ in 0..count {
        kinds.push(next_envelope(rx).await.kind());
    }
    kinds
}

/// Bundler that remembers the artifact of the last bundle it produced
struct RecordingBundler {
    inner: DirectoryBundler,
    last_artifact: Mutex<Option<PathBuf>>,
}

impl ContentBundler for RecordingBundler {
    fn bundle(&self, store: &VersionStore, request: &[FileItem]) -> Result<Bundle, BundleError> {
        let bundle = self.inner.bundle(store, request)?;
        *self.last_artifact.lock().unwrap() = bundle.artifact().map(PathBuf::from);
        Ok(bundle)
    }

    fn ingest(&self, store: &mut VersionStore, payload: &[u8]) -> Result<usize, BundleError> {
        self.inner.ingest(store, payload)
    }
}

struct Node {
    engine: Arc<GossipEngine>,
    inbound: mpsc::Receiver<InboundFrame>,
    bundler: DirectoryBundler,
    endpoint: Peer,
    root: TempDir,
}

fn node_with(net: &MemoryNetwork, addr: &str, versions: VersionStore, peers: PeerDirectory) -> Node {
    let endpoint = peer(addr);
    let (transport, inbound) = net.bind(endpoint);
    let root = TempDir::new().unwrap();
    let bundler = DirectoryBundler::new(root.path()).unwrap();

    let config = GossipConfig::new()
        .with_listen_port(endpoint.port())
        .with_local_address(endpoint.ip())
        .with_tick_interval(Duration::from_millis(50));
    let engine = GossipEngine::new(
        config,
        versions,
        peers,
        Arc::new(transport),
        Arc::new(bundler.clone()),
    );

    Node {
        engine: Arc::new(engine),
        inbound,
        bundler,
        endpoint,
        root,
    }
}

fn node(net: &MemoryNetwork, addr: &str) -> Node {
    node_with(net, addr, VersionStore::new(), PeerDirectory::new())
}

// ============================================================================
// HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_invitation_is_accepted() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");
    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    local.engine.handle_message(remote, Message::Invitation).await.unwrap();

    let reply = next_envelope(&mut remote_rx).await;
    assert_eq!(reply.kind(), MessageKind::AcceptInvitation);
    assert_eq!(reply.listen_port(), 9000);
}

#[tokio::test]
async fn test_accepted_invitation_becomes_connect_request() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");
    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    local.engine.handle_message(remote, Message::AcceptInvitation).await.unwrap();

    assert_eq!(next_envelope(&mut remote_rx).await.kind(), MessageKind::ConnectRequest);
}

#[tokio::test]
async fn test_connect_request_sends_accept_then_metadata() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");
    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    local.engine.handle_message(remote, Message::ConnectRequest).await.unwrap();

    assert_eq!(
        next_kinds(&mut remote_rx, 3).await,
        vec![MessageKind::AcceptConnect, MessageKind::PeerList, MessageKind::VersionList]
    );
}

#[tokio::test]
async fn test_accept_connect_sends_metadata_only() {
    let net = MemoryNetwork::new();
    let mut versions = VersionStore::new();
    versions.change("/a.txt", false, ContentHash::of(b"a"), t(0));
    let peers = PeerDirectory::from_peers([peer("10.0.0.9:9000")]);
    let local = node_with(&net, "10.0.0.1:9000", versions, peers);

    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    local.engine.handle_message(remote, Message::AcceptConnect).await.unwrap();

    match next_envelope(&mut remote_rx).await.into_message() {
        Message::PeerList(list) => assert_eq!(list, vec![peer("10.0.0.9:9000")]),
        other => panic!("expected peer list, got {:?}", other.kind()),
    }
    match next_envelope(&mut remote_rx).await.into_message() {
        Message::VersionList(files) => {
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].current_name(), "/a.txt");
        }
        other => panic!("expected version list, got {:?}", other.kind()),
    }
    assert!(timeout(Duration::from_millis(100), remote_rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_reply_goes_to_listen_port_not_source_port() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");
    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    let frame = Envelope::new(9100, Message::Invitation).encode().unwrap();
    let from: SocketAddr = "10.0.0.2:54321".parse().unwrap();
    local.engine.handle_frame(&frame, from).await.unwrap();

    assert_eq!(next_envelope(&mut remote_rx).await.kind(), MessageKind::AcceptInvitation);
}

// ============================================================================
// MEMBERSHIP AND VERSIONS
// ============================================================================

#[tokio::test]
async fn test_peer_list_records_sender_and_merges() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");
    let sender = peer("10.0.0.2:9100");

    let list = vec![peer("10.0.0.3:9000"), peer("10.0.0.1:9000")];
    local.engine.handle_message(sender, Message::PeerList(list)).await.unwrap();

    let peers = local.engine.peers();
    let peers = peers.lock().await;
    assert_eq!(peers.len(), 3);
    assert!(peers.contains(&sender));
    assert!(peers.contains(&peer("10.0.0.3:9000")));
}

#[tokio::test]
async fn test_version_list_requests_missing_entries() {
    let net = MemoryNetwork::new();
    let mut shared = VersionStore::new();
    shared.change("/f", false, ContentHash::of(b"h1"), t(1));

    let local = node_with(
        &net,
        "10.0.0.1:9000",
        VersionStore::from_files(shared.files().to_vec()),
        PeerDirectory::new(),
    );
    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    let mut remote_store = VersionStore::from_files(shared.files().to_vec());
    remote_store.change("/f", false, ContentHash::of(b"h2"), t(2));

    local
        .engine
        .handle_message(remote, Message::VersionList(remote_store.files().to_vec()))
        .await
        .unwrap();

    match next_envelope(&mut remote_rx).await.into_message() {
        Message::FileRequest(items) => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].id(), shared.files()[0].id());
            assert_eq!(items[0].history().len(), 1);
            assert_eq!(items[0].history()[0].hash(), &ContentHash::of(b"h2"));
        }
        other => panic!("expected file request, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_file_request_answered_and_artifact_removed() {
    let net = MemoryNetwork::new();
    let endpoint = peer("10.0.0.1:9000");
    let (transport, _inbound) = net.bind(endpoint);
    let root = TempDir::new().unwrap();
    let inner = DirectoryBundler::new(root.path()).unwrap();

    let mut versions = VersionStore::new();
    let hash = inner.store_blob(b"hello world").unwrap();
    versions.change("/hello.txt", false, hash, t(0));
    let request = VersionStore::new().diff_missing(&versions);

    let bundler = Arc::new(RecordingBundler {
        inner,
        last_artifact: Mutex::new(None),
    });
    let engine = GossipEngine::new(
        GossipConfig::new().with_listen_port(9000),
        versions,
        PeerDirectory::new(),
        Arc::new(transport),
        bundler.clone(),
    );

    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);
    engine.handle_message(remote, Message::FileRequest(request)).await.unwrap();

    let payload = match next_envelope(&mut remote_rx).await.into_message() {
        Message::FileData(payload) => payload,
        other => panic!("expected file data, got {:?}", other.kind()),
    };

    // The payload is usable by a fresh node
    let other_root = TempDir::new().unwrap();
    let other = DirectoryBundler::new(other_root.path()).unwrap();
    let mut other_store = VersionStore::new();
    assert_eq!(other.ingest(&mut other_store, &payload).unwrap(), 2);
    assert_eq!(
        std::fs::read(other_root.path().join("hello.txt")).unwrap(),
        b"hello world"
    );

    let artifact = bundler.last_artifact.lock().unwrap().clone().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while artifact.exists() {
        assert!(Instant::now() < deadline, "bundle artifact was not removed");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_file_data_is_ingested() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");

    let source_root = TempDir::new().unwrap();
    let source = DirectoryBundler::new(source_root.path()).unwrap();
    let mut source_store = VersionStore::new();
    let hash = source.store_blob(b"payload").unwrap();
    source_store.change("/docs/readme.md", false, hash, t(0));

    let request = VersionStore::new().diff_missing(&source_store);
    let bundle = source.bundle(&source_store, &request).unwrap();
    let (payload, artifact) = bundle.into_parts();
    if let Some(path) = artifact {
        std::fs::remove_file(path).unwrap();
    }

    local
        .engine
        .handle_message(peer("10.0.0.2:9100"), Message::FileData(payload))
        .await
        .unwrap();

    let versions = local.engine.versions();
    let versions = versions.lock().await;
    let item = versions.get_by_path("/docs/readme.md").unwrap();
    assert_eq!(item.id(), source_store.files()[0].id());
    assert_eq!(
        std::fs::read(local.root.path().join("docs/readme.md")).unwrap(),
        b"payload"
    );
    assert_eq!(local.engine.stats().entries_ingested, 2);
}

#[tokio::test]
async fn test_unknown_tag_is_fatal_and_changes_nothing() {
    let net = MemoryNetwork::new();
    let mut versions = VersionStore::new();
    versions.change("/a.txt", false, ContentHash::of(b"a"), t(0));
    let peers = PeerDirectory::from_peers([peer("10.0.0.9:9000")]);
    let local = node_with(&net, "10.0.0.1:9000", versions, peers);

    let remote = peer("10.0.0.2:9100");
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    let result = local
        .engine
        .handle_frame(&[0xFF, 0x23, 0x8C, 0x00], "10.0.0.2:50000".parse().unwrap())
        .await;

    let err = result.unwrap_err();
    assert!(err.is_protocol_violation());
    assert_eq!(local.engine.stats().protocol_errors, 1);
    assert_eq!(local.engine.stats().messages_handled, 0);

    assert_eq!(local.engine.peers().lock().await.len(), 1);
    let versions = local.engine.versions();
    let versions = versions.lock().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions.files()[0].history().len(), 2);
    assert!(timeout(Duration::from_millis(100), remote_rx.recv()).await.is_err());
}

// ============================================================================
// GOSSIP TICK
// ============================================================================

#[tokio::test]
async fn test_tick_with_empty_directory_is_noop() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");

    assert_eq!(local.engine.tick().await.unwrap(), None);
    assert_eq!(local.engine.stats().ticks, 1);
    assert_eq!(local.engine.stats().messages_sent, 0);
}

#[tokio::test]
async fn test_tick_with_only_self_is_noop() {
    let net = MemoryNetwork::new();
    let peers = PeerDirectory::from_peers([peer("10.0.0.1:9000"), peer("127.0.0.1:9000")]);
    let local = node_with(&net, "10.0.0.1:9000", VersionStore::new(), peers);

    assert_eq!(local.engine.tick().await.unwrap(), None);
}

#[tokio::test]
async fn test_tick_sends_connect_request() {
    let net = MemoryNetwork::new();
    let remote = peer("10.0.0.2:9100");
    let peers = PeerDirectory::from_peers([remote, peer("10.0.0.1:9000")]);
    let local = node_with(&net, "10.0.0.1:9000", VersionStore::new(), peers);
    let (_remote_transport, mut remote_rx) = net.bind(remote);

    assert_eq!(local.engine.tick().await.unwrap(), Some(remote));

    let envelope = next_envelope(&mut remote_rx).await;
    assert_eq!(envelope.kind(), MessageKind::ConnectRequest);
    assert_eq!(envelope.listen_port(), 9000);
}

#[tokio::test]
async fn test_send_failure_is_counted() {
    let net = MemoryNetwork::new();
    let local = node(&net, "10.0.0.1:9000");

    local.engine.invite(peer("10.0.0.77:9000")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while local.engine.stats().send_failures == 0 {
        assert!(Instant::now() < deadline, "send failure not recorded");
        sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// END TO END
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_converge() {
    let net = MemoryNetwork::new();

    let a = node(&net, "10.0.0.1:9001");
    let b = node(&net, "10.0.0.2:9002");

    {
        let versions = a.engine.versions();
        let mut versions = versions.lock().await;
        let hash = a.bundler.store_blob(b"alpha").unwrap();
        versions.change("/a.txt", false, hash, t(1));
        versions.create("/shared", true, t(1));
    }
    {
        let versions = b.engine.versions();
        let mut versions = versions.lock().await;
        let hash = b.bundler.store_blob(b"beta").unwrap();
        versions.change("/b.txt", false, hash, t(2));
    }

    // Only A knows about B; B learns A through the exchange
    a.engine.invite(b.endpoint).unwrap();

    let Node { engine: a_engine, inbound: a_inbound, root: a_root, .. } = a;
    let Node { engine: b_engine, inbound: b_inbound, root: b_root, .. } = b;
    tokio::spawn(Arc::clone(&a_engine).run(a_inbound));
    tokio::spawn(Arc::clone(&b_engine).run(b_inbound));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let a_live = a_engine.versions().lock().await.live_count();
        let b_live = b_engine.versions().lock().await.live_count();
        let a_has_b = std::fs::read(a_root.path().join("b.txt")).ok();
        let b_has_a = std::fs::read(b_root.path().join("a.txt")).ok();

        if a_live == 3
            && b_live == 3
            && a_has_b.as_deref() == Some(b"beta".as_slice())
            && b_has_a.as_deref() == Some(b"alpha".as_slice())
        {
            break;
        }
        assert!(Instant::now() < deadline, "nodes did not converge");
        sleep(Duration::from_millis(20)).await;
    }

    assert!(b_root.path().join("shared").is_dir());
    assert!(b_engine.peers().lock().await.contains(&peer("10.0.0.1:9001")));

    let a_versions = a_engine.versions();
    let b_versions = b_engine.versions();
    let a_versions = a_versions.lock().await;
    let b_versions = b_versions.lock().await;
    assert!(a_versions.diff_missing(&b_versions).is_empty());
    assert!(b_versions.diff_missing(&a_versions).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_and_rename_reach_peer_that_has_the_file() {
    let net = MemoryNetwork::new();

    let a = node(&net, "10.0.0.1:9001");
    let b = node(&net, "10.0.0.2:9002");

    {
        let versions = a.engine.versions();
        let mut versions = versions.lock().await;
        let hash = a.bundler.store_blob(b"alpha").unwrap();
        versions.change("/a.txt", false, hash, t(1));
        let hash = a.bundler.store_blob(b"bravo").unwrap();
        versions.change("/b.txt", false, hash, t(1));
        std::fs::write(a.root.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(a.root.path().join("b.txt"), b"bravo").unwrap();
    }
    a.engine.invite(b.endpoint).unwrap();

    let Node { engine: a_engine, inbound: a_inbound, root: a_root, .. } = a;
    let Node { engine: b_engine, inbound: b_inbound, root: b_root, .. } = b;
    tokio::spawn(Arc::clone(&a_engine).run(a_inbound));
    tokio::spawn(Arc::clone(&b_engine).run(b_inbound));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let has_a = std::fs::read(b_root.path().join("a.txt")).ok();
        let has_b = std::fs::read(b_root.path().join("b.txt")).ok();
        if has_a.as_deref() == Some(b"alpha".as_slice()) && has_b.as_deref() == Some(b"bravo".as_slice()) {
            break;
        }
        assert!(Instant::now() < deadline, "B did not receive the files");
        sleep(Duration::from_millis(20)).await;
    }

    // B deletes one file and renames the other without touching its content
    {
        let versions = b_engine.versions();
        let mut versions = versions.lock().await;
        versions.delete("/a.txt", t(10)).unwrap();
        versions
            .rename("/c.txt", "/b.txt", ContentHash::of(b"bravo"), t(11))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let indexed = {
            let versions = a_engine.versions();
            let versions = versions.lock().await;
            versions.get_by_path("/a.txt").is_none()
                && versions.get_by_path("/b.txt").is_none()
                && versions.get_by_path("/c.txt").is_some()
        };
        let on_disk = !a_root.path().join("a.txt").exists()
            && !a_root.path().join("b.txt").exists()
            && std::fs::read(a_root.path().join("c.txt")).ok().as_deref() == Some(b"bravo".as_slice());
        if indexed && on_disk {
            break;
        }
        assert!(Instant::now() < deadline, "A did not follow the delete and rename");
        sleep(Duration::from_millis(20)).await;
    }

    let a_versions = a_engine.versions();
    let b_versions = b_engine.versions();
    let a_versions = a_versions.lock().await;
    let b_versions = b_versions.lock().await;
    assert_eq!(a_versions.live_count(), 1);
    assert!(a_versions.diff_missing(&b_versions).is_empty());
    assert!(b_versions.diff_missing(&a_versions).is_empty());
}
