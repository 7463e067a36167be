// TCP Transport Implementation
// One connection per frame: u32 big-endian length prefix, then the payload

use crate::sync::Peer;
use crate::transport::{InboundFrame, Transport, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

// ============================================================================
// TCP TRANSPORT CONFIG
// ============================================================================

/// Configuration for TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to bind to
    pub bind_address: String,
    /// Port to bind to (0 for random)
    pub bind_port: u16,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Largest accepted frame in bytes
    pub max_frame_len: usize,
    /// Capacity of the inbound frame channel
    pub inbound_capacity: usize,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            connect_timeout_secs: 10,
            max_frame_len: 64 * 1024 * 1024,
            inbound_capacity: 1000,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

// ============================================================================
// TCP TRANSPORT
// ============================================================================

/// TCP transport implementation
pub struct TcpTransport {
    config: TcpTransportConfig,
    local_addr: SocketAddr,
    listener_handle: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind the listener and start accepting frames
    pub async fn bind(
        config: TcpTransportConfig,
    ) -> Result<(Self, mpsc::Receiver<InboundFrame>), TransportError> {
        let bind_addr = format!("{}:{}", config.bind_address, config.bind_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let max_frame_len = config.max_frame_len;

        let listener_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        let inbound_tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_frames(stream, from, max_frame_len, inbound_tx).await {
                                debug!(%from, error = %e, "inbound connection dropped");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "listener stopped");
                        break;
                    }
                }
            }
        });

        debug!(%local_addr, "tcp transport listening");
        Ok((
            Self {
                config,
                local_addr,
                listener_handle,
            },
            inbound_rx,
        ))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.listener_handle.abort();
    }
}

async fn read_frames(
    mut stream: TcpStream,
    from: SocketAddr,
    max_frame_len: usize,
    inbound_tx: mpsc::Sender<InboundFrame>,
) -> Result<(), TransportError> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame_len {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        if inbound_tx.send(InboundFrame { data, from }).await.is_err() {
            // Receiver gone: the engine has shut down
            return Ok(());
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: &Peer, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.config.max_frame_len || frame.len() > u32::MAX as usize {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let mut stream = timeout(connect_timeout, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(self.config.nodelay).ok();

        let len = (frame.len() as u32).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }
}
