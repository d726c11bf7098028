//! # Transport Adapters
//!
//! Raw byte-stream carriers selected by address scheme:
//!
//! | Carrier | Address form | Notes |
//! |---------|--------------|-------|
//! | [`TcpTransport`] | `/ip4/../tcp/N` | `TCP_NODELAY` on every socket |
//! | [`WsTransport`] | `/ip4/../tcp/N/ws` | opening line exchange, then length-framed binary messages |
//! | [`MemoryTransport`] | `/memory/N` | in-process pipes, used by tests and simulations |
//!
//! A transport only moves bytes. Authentication and multiplexing happen above
//! it in [`crate::secure`] and [`crate::mux`]. Dial failures are reported once;
//! retrying is the connection manager's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::address::{Carrier, PeerAddress};
use crate::error::NetworkError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opening line both ends of a framed connection send before any data.
pub const WS_UPGRADE_LINE: &[u8] = b"murmur-ws/1\n";

/// Largest single frame accepted on the framed carrier.
pub const MAX_WS_FRAME: usize = 1024 * 1024;

const WS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);
const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_QUEUE: usize = 64;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> IoStream for T {}

pub type BoxedIo = Box<dyn IoStream>;

/// An unauthenticated duplex byte stream plus the addresses on both ends.
pub struct RawConnection {
    pub io: BoxedIo,
    pub local_addr: PeerAddress,
    pub remote_addr: PeerAddress,
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn can_dial(&self, addr: &PeerAddress) -> bool;

    async fn dial(&self, addr: &PeerAddress) -> Result<RawConnection, NetworkError>;

    async fn listen(&self, addr: &PeerAddress) -> Result<Listener, NetworkError>;
}

/// A bound listener. Dropping it stops accepting and releases the socket.
pub struct Listener {
    local_addr: PeerAddress,
    incoming: mpsc::Receiver<RawConnection>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    fn new(local_addr: PeerAddress, incoming: mpsc::Receiver<RawConnection>, task: Option<JoinHandle<()>>) -> Self {
        Self { local_addr, incoming, task }
    }

    /// Actual bound address (port 0 resolved).
    pub fn local_addr(&self) -> &PeerAddress {
        &self.local_addr
    }

    /// Next inbound connection, `None` once the listener has shut down.
    pub async fn accept(&mut self) -> Option<RawConnection> {
        self.incoming.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Configuration and carrier set
// ============================================================================

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub tcp: bool,
    pub ws: bool,
    pub memory: bool,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            ws: true,
            memory: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Ordered set of carriers; the first whose `can_dial` accepts an address wins.
#[derive(Clone, Default)]
pub struct Transports {
    carriers: Vec<Arc<dyn Transport>>,
    connect_timeout: Option<Duration>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let mut set = Self::new();
        set.connect_timeout = Some(config.connect_timeout);
        if config.tcp {
            set = set.with(TcpTransport);
        }
        if config.ws {
            set = set.with(WsTransport);
        }
        if config.memory {
            set = set.with(MemoryTransport::default());
        }
        set
    }

    pub fn with(mut self, transport: impl Transport) -> Self {
        self.carriers.push(Arc::new(transport));
        self
    }

    pub fn can_dial(&self, addr: &PeerAddress) -> bool {
        self.carriers.iter().any(|t| t.can_dial(addr))
    }

    fn select(&self, addr: &PeerAddress) -> Result<&Arc<dyn Transport>, NetworkError> {
        self.carriers
            .iter()
            .find(|t| t.can_dial(addr))
            .ok_or_else(|| NetworkError::Unreachable(format!("no transport for {}", addr)))
    }

    pub async fn dial(&self, addr: &PeerAddress) -> Result<RawConnection, NetworkError> {
        let transport = self.select(addr)?;
        trace!(addr = %addr, transport = transport.name(), "dialing");
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, transport.dial(addr)).await?,
            None => transport.dial(addr).await,
        }
    }

    pub async fn listen(&self, addr: &PeerAddress) -> Result<Listener, NetworkError> {
        let transport = self
            .carriers
            .iter()
            .find(|t| t.can_dial(addr))
            .ok_or_else(|| NetworkError::InvalidAddress(format!("no transport can listen on {}", addr)))?;
        transport.listen(addr).await
    }
}

fn io_unreachable(addr: &PeerAddress, e: std::io::Error) -> NetworkError {
    NetworkError::Unreachable(format!("{}: {}", addr, e))
}

fn dial_target(addr: &PeerAddress) -> Result<String, NetworkError> {
    addr.dial_target()
        .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

async fn bind_tcp(addr: &PeerAddress) -> Result<(TcpListener, std::net::SocketAddr), NetworkError> {
    let target = dial_target(addr)?;
    let listener = TcpListener::bind(&target)
        .await
        .map_err(|e| NetworkError::InvalidAddress(format!("bind {}: {}", target, e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| NetworkError::InvalidAddress(format!("bind {}: {}", target, e)))?;
    Ok((listener, local))
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_dial(&self, addr: &PeerAddress) -> bool {
        addr.carrier() == Some(Carrier::Tcp)
    }

    async fn dial(&self, addr: &PeerAddress) -> Result<RawConnection, NetworkError> {
        let stream = TcpStream::connect(dial_target(addr)?)
            .await
            .map_err(|e| io_unreachable(addr, e))?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream
            .local_addr()
            .map(PeerAddress::tcp)
            .map_err(|e| io_unreachable(addr, e))?;
        Ok(RawConnection {
            io: Box::new(stream),
            local_addr,
            remote_addr: addr.without_peer_id(),
        })
    }

    async fn listen(&self, addr: &PeerAddress) -> Result<Listener, NetworkError> {
        let (listener, local) = bind_tcp(addr).await?;
        let local_addr = PeerAddress::tcp(local);
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let listen_addr = local_addr.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        let conn = RawConnection {
                            io: Box::new(stream),
                            local_addr: listen_addr.clone(),
                            remote_addr: PeerAddress::tcp(remote),
                        };
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        debug!(addr = %local_addr, "tcp listener bound");
        Ok(Listener::new(local_addr, rx, Some(task)))
    }
}

// ============================================================================
// Framed (WebSocket-style) carrier
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

async fn read_upgrade_line<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(WS_UPGRADE_LINE.len());
    while line.len() < WS_UPGRADE_LINE.len() {
        let byte = reader.read_u8().await?;
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }
    if line != WS_UPGRADE_LINE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected upgrade line",
        ));
    }
    Ok(())
}

async fn ws_upgrade(stream: &mut TcpStream, dialer: bool) -> std::io::Result<()> {
    let exchange = async {
        if dialer {
            stream.write_all(WS_UPGRADE_LINE).await?;
            read_upgrade_line(stream).await
        } else {
            read_upgrade_line(stream).await?;
            stream.write_all(WS_UPGRADE_LINE).await
        }
    };
    tokio::time::timeout(WS_UPGRADE_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upgrade timed out"))?
}

/// Present a framed TCP stream as a plain byte stream.
///
/// Every chunk written by the application becomes one `u32 BE length || payload`
/// frame on the wire; inbound frames are unwrapped back into bytes. Two pump
/// tasks run until either side closes.
fn framed(stream: TcpStream) -> BoxedIo {
    let (app, inner) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut inner_rd, mut inner_wr) = tokio::io::split(inner);
    let (mut tcp_rd, mut tcp_wr) = stream.into_split();

    tokio::spawn(async move {
        let mut buf = vec![0u8; PIPE_CAPACITY];
        loop {
            let n = match inner_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let mut frame = Vec::with_capacity(4 + n);
            frame.extend_from_slice(&(n as u32).to_be_bytes());
            frame.extend_from_slice(&buf[..n]);
            if tcp_wr.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = tcp_wr.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let len = match tcp_rd.read_u32().await {
                Ok(len) => len as usize,
                Err(_) => break,
            };
            if len > MAX_WS_FRAME {
                debug!(len, "oversized frame, dropping framed connection");
                break;
            }
            let mut payload = vec![0u8; len];
            if tcp_rd.read_exact(&mut payload).await.is_err() {
                break;
            }
            if inner_wr.write_all(&payload).await.is_err() {
                break;
            }
        }
        let _ = inner_wr.shutdown().await;
    });

    Box::new(app)
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn can_dial(&self, addr: &PeerAddress) -> bool {
        addr.carrier() == Some(Carrier::Ws)
    }

    async fn dial(&self, addr: &PeerAddress) -> Result<RawConnection, NetworkError> {
        let mut stream = TcpStream::connect(dial_target(addr)?)
            .await
            .map_err(|e| io_unreachable(addr, e))?;
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().map_err(|e| io_unreachable(addr, e))?;
        ws_upgrade(&mut stream, true)
            .await
            .map_err(|e| io_unreachable(addr, e))?;
        Ok(RawConnection {
            io: framed(stream),
            local_addr: PeerAddress::ws(local),
            remote_addr: addr.without_peer_id(),
        })
    }

    async fn listen(&self, addr: &PeerAddress) -> Result<Listener, NetworkError> {
        let (listener, local) = bind_tcp(addr).await?;
        let local_addr = PeerAddress::ws(local);
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let listen_addr = local_addr.clone();

        let task = tokio::spawn(async move {
            loop {
                let (mut stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "ws accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                if tx.is_closed() {
                    break;
                }
                let _ = stream.set_nodelay(true);
                let tx = tx.clone();
                let listen_addr = listen_addr.clone();
                // Upgrade off the accept loop so a silent client cannot stall it.
                tokio::spawn(async move {
                    if let Err(e) = ws_upgrade(&mut stream, false).await {
                        debug!(remote = %remote, error = %e, "ws upgrade failed");
                        return;
                    }
                    let conn = RawConnection {
                        io: framed(stream),
                        local_addr: listen_addr,
                        remote_addr: PeerAddress::ws(remote),
                    };
                    let _ = tx.send(conn).await;
                });
            }
        });

        debug!(addr = %local_addr, "ws listener bound");
        Ok(Listener::new(local_addr, rx, Some(task)))
    }
}

// ============================================================================
// In-memory carrier
// ============================================================================

static GLOBAL_HUB: LazyLock<MemoryHub> = LazyLock::new(MemoryHub::default);

/// Registry of in-process listeners keyed by port.
#[derive(Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<Mutex<HashMap<u64, mpsc::Sender<RawConnection>>>>,
    next_port: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn global() -> Self {
        GLOBAL_HUB.clone()
    }

    fn allocate_port(&self) -> u64 {
        // Ports handed out for `/memory/0` start high to stay clear of fixed test ports.
        (1 << 32) + self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn with_hub(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::with_hub(MemoryHub::global())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn can_dial(&self, addr: &PeerAddress) -> bool {
        addr.carrier() == Some(Carrier::Memory)
    }

    async fn dial(&self, addr: &PeerAddress) -> Result<RawConnection, NetworkError> {
        let port = addr
            .memory_port()
            .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
        let sender = {
            let listeners = self.hub.listeners.lock().await;
            listeners.get(&port).cloned()
        }
        .ok_or_else(|| NetworkError::Unreachable(format!("{}: connection refused", addr)))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let dialer_addr = PeerAddress::memory(self.hub.allocate_port());
        let inbound = RawConnection {
            io: Box::new(remote),
            local_addr: PeerAddress::memory(port),
            remote_addr: dialer_addr.clone(),
        };
        sender
            .send(inbound)
            .await
            .map_err(|_| NetworkError::Unreachable(format!("{}: listener closed", addr)))?;

        Ok(RawConnection {
            io: Box::new(local),
            local_addr: dialer_addr,
            remote_addr: PeerAddress::memory(port),
        })
    }

    async fn listen(&self, addr: &PeerAddress) -> Result<Listener, NetworkError> {
        let requested = addr
            .memory_port()
            .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
        let port = if requested == 0 { self.hub.allocate_port() } else { requested };

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let mut listeners = self.hub.listeners.lock().await;
        // A closed sender means the previous listener was dropped; the port is free again.
        if listeners.get(&port).is_some_and(|existing| !existing.is_closed()) {
            return Err(NetworkError::InvalidAddress(format!("/memory/{} already in use", port)));
        }
        listeners.insert(port, tx);

        Ok(Listener::new(PeerAddress::memory(port), rx, None))
    }
}
