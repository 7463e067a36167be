// Memory Transport Implementation
// In-process delivery between endpoints bound on a shared MemoryNetwork

use crate::sync::Peer;
use crate::transport::{InboundFrame, Transport, TransportError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const INBOUND_CAPACITY: usize = 1000;

/// Routing table shared by all in-process endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<Peer, mpsc::Sender<InboundFrame>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener at `endpoint`, replacing any previous one
    pub fn bind(&self, endpoint: Peer) -> (MemoryTransport, mpsc::Receiver<InboundFrame>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.with_listeners(|listeners| listeners.insert(endpoint, tx));

        let transport = MemoryTransport {
            network: self.clone(),
            local: endpoint,
        };
        (transport, rx)
    }

    /// Remove the listener at `endpoint`; later sends to it fail
    pub fn unbind(&self, endpoint: &Peer) {
        self.with_listeners(|listeners| listeners.remove(endpoint));
    }

    fn route(&self, peer: &Peer) -> Option<mpsc::Sender<InboundFrame>> {
        self.with_listeners(|listeners| listeners.get(peer).cloned())
    }

    fn with_listeners<R>(&self, f: impl FnOnce(&mut HashMap<Peer, mpsc::Sender<InboundFrame>>) -> R) -> R {
        // A poisoned table is still structurally valid
        let mut guard = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// Endpoint on a MemoryNetwork
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Peer,
}

impl MemoryTransport {
    pub fn endpoint(&self) -> Peer {
        self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &Peer, frame: Vec<u8>) -> Result<(), TransportError> {
        let route = self
            .network
            .route(peer)
            .ok_or(TransportError::UnknownPeer(*peer))?;

        // Like a fresh TCP connection, the source port is ephemeral
        let ephemeral = rand::thread_rng().gen_range(49152..=u16::MAX);
        let from = SocketAddr::new(self.local.ip(), ephemeral);

        route
            .send(InboundFrame { data: frame, from })
            .await
            .map_err(|_| TransportError::SendFailed("listener closed".to_string()))
    }

    fn local_port(&self) -> u16 {
        self.local.port()
    }
}
