//! # Connection Manager
//!
//! Owns the dial/accept lifecycle and the [`PeerStore`].
//!
//! ```text
//!  dial(peer) ──► addresses by priority ──► Transport ──► Secure ──► Mux ──► Connection
//!                        ▲                                                      │
//!  listener ──► accept ──┴─────────────── Secure (responder) ──► Mux ───────────┤
//!                                                                               ▼
//!                                                    PeerEvent::Connected / route streams
//! ```
//!
//! ## Dial coalescing
//!
//! At most one dial per peer is in flight. Later callers for the same peer are
//! parked on the pending entry and all receive the same result, success or
//! failure. Once a peer has live connections, `dial` returns the oldest one.
//!
//! ## Retries
//!
//! Transient failures (`Unreachable`, `Timeout`) are retried over the address
//! list with exponential backoff up to `max_dial_attempts` rounds. A
//! `HandshakeFailed` ends the dial at once: the claimed identity is not tried
//! again.
//!
//! ## Inbound streams
//!
//! Protocol handlers are registered on a [`ProtocolRouter`] before the manager
//! starts. Streams opened by remotes for a registered protocol are delivered to
//! that protocol's queue as [`InboundStream`]s; unknown protocols are refused
//! at the multiplexer.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::address::PeerAddress;
use crate::error::NetworkError;
use crate::identity::{Keypair, PeerId};
use crate::mux::{self, Connection, ConnectionInfo, Direction, MuxConfig, Stream};
use crate::peer_store::{ConnectionState, MergeOutcome, PeerRecord, PeerStore, DEFAULT_MAX_PEERS};
use crate::secure::{self, Role, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::transport::{Listener, RawConnection, Transports};

pub const DEFAULT_MAX_DIAL_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_PROTOCOL_QUEUE: usize = 64;

const COMMAND_QUEUE: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_dial_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub handshake_timeout: Duration,
    pub max_peers: usize,
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_dial_attempts: DEFAULT_MAX_DIAL_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_peers: DEFAULT_MAX_PEERS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Delay before retry round `attempt + 1`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// First live connection to the peer.
    Connected { peer: PeerId, info: ConnectionInfo },
    /// Last live connection to the peer went away.
    Disconnected { peer: PeerId, info: ConnectionInfo },
    /// New or updated addresses merged into the peer store.
    Discovered { peer: PeerId, addrs: Vec<PeerAddress> },
}

impl PeerEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerEvent::Connected { peer, .. }
            | PeerEvent::Disconnected { peer, .. }
            | PeerEvent::Discovered { peer, .. } => *peer,
        }
    }
}

/// A stream opened by a remote peer for a registered protocol.
#[derive(Debug)]
pub struct InboundStream {
    pub stream: Stream,
    pub connection: ConnectionInfo,
}

/// Protocol handler table, filled before the manager starts.
pub struct ProtocolRouter {
    handlers: HashMap<String, mpsc::Sender<InboundStream>>,
    queue: usize,
}

impl Default for ProtocolRouter {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOL_QUEUE)
    }
}

impl ProtocolRouter {
    pub fn new(queue: usize) -> Self {
        Self { handlers: HashMap::new(), queue: queue.max(1) }
    }

    /// Claim `protocol`. Registering the same id twice replaces the earlier queue.
    pub fn register_protocol(&mut self, protocol: &str) -> mpsc::Receiver<InboundStream> {
        let (tx, rx) = mpsc::channel(self.queue);
        self.handlers.insert(protocol.to_string(), tx);
        rx
    }

    fn supported(&self) -> Arc<HashSet<String>> {
        Arc::new(self.handlers.keys().cloned().collect())
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<PeerEvent>,
    local_peer: PeerId,
}

impl ConnectionManager {
    pub fn spawn(
        keypair: Keypair,
        transports: Transports,
        config: ConnectionConfig,
        mux_config: MuxConfig,
        router: ProtocolRouter,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (listen_tx, listen_rx) = watch::channel(Vec::new());
        let local_peer = keypair.peer_id();
        let capacity = NonZeroUsize::new(config.max_peers).unwrap_or(NonZeroUsize::MIN);

        let ctx = DialContext {
            keypair,
            transports,
            handshake_timeout: config.handshake_timeout,
            mux: mux_config,
            supported: router.supported(),
            listen_addrs: listen_rx,
        };
        let actor = ConnectionActor {
            ctx,
            config,
            store: PeerStore::new(local_peer, capacity),
            connections: HashMap::new(),
            pending_dials: HashMap::new(),
            handlers: Arc::new(router.handlers),
            listen_tx,
            events: events.clone(),
            cmd_tx: cmd_tx.clone(),
            tasks: JoinSet::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self { cmd_tx, events, local_peer }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Connection to `peer`, dialing known addresses if none is live.
    pub async fn dial(&self, peer: PeerId) -> Result<Connection, NetworkError> {
        if peer == self.local_peer {
            return Err(NetworkError::Rejected("cannot dial self".into()));
        }
        self.request(|reply| Command::Dial { peer, reply }).await?
    }

    /// Dial an address. A `/p2p/` suffix pins the expected identity.
    pub async fn dial_address(&self, addr: PeerAddress) -> Result<Connection, NetworkError> {
        if addr.peer_id() == Some(self.local_peer) {
            return Err(NetworkError::Rejected("cannot dial self".into()));
        }
        self.request(|reply| Command::DialAddress { addr, reply }).await?
    }

    pub async fn add_addresses(
        &self,
        peer: PeerId,
        addrs: Vec<PeerAddress>,
    ) -> Result<MergeOutcome, NetworkError> {
        self.request(|reply| Command::AddAddresses { peer, addrs, reply }).await
    }

    /// Bind a listener. Returns the actual bound address.
    pub async fn listen(&self, addr: PeerAddress) -> Result<PeerAddress, NetworkError> {
        self.request(|reply| Command::Listen { addr, reply }).await?
    }

    pub async fn listen_addrs(&self) -> Vec<PeerAddress> {
        self.request(Command::ListenAddrs).await.unwrap_or_default()
    }

    /// Oldest live connection to `peer`, without dialing.
    pub async fn connection(&self, peer: PeerId) -> Option<Connection> {
        self.request(|reply| Command::GetConnection { peer, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(Command::ConnectedPeers).await.unwrap_or_default()
    }

    pub async fn peer_record(&self, peer: PeerId) -> Option<PeerRecord> {
        self.request(|reply| Command::GetPeerRecord { peer, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn disconnect(&self, peer: PeerId) {
        let _ = self.request(|reply| Command::Disconnect { peer, reply }).await;
    }

    /// Independent stream of peer events starting now.
    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Close every connection and listener. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

// ============================================================================
// Dialing
// ============================================================================

/// A freshly negotiated connection on its way to the actor.
///
/// If it is dropped before registration (actor gone, task aborted) the
/// connection is closed rather than left running unowned.
struct Established {
    connection: Option<Connection>,
    incoming: Option<mpsc::Receiver<Stream>>,
    dialed: Option<PeerAddress>,
}

impl Drop for Established {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

#[derive(Clone)]
struct DialContext {
    keypair: Keypair,
    transports: Transports,
    handshake_timeout: Duration,
    mux: MuxConfig,
    supported: Arc<HashSet<String>>,
    listen_addrs: watch::Receiver<Vec<PeerAddress>>,
}

impl DialContext {
    async fn dial_once(
        &self,
        addr: &PeerAddress,
        expected: Option<PeerId>,
    ) -> Result<Established, NetworkError> {
        let raw = self.transports.dial(addr).await?;
        self.upgrade(raw, Role::Initiator, expected, Some(addr.clone())).await
    }

    async fn upgrade(
        &self,
        raw: RawConnection,
        role: Role,
        expected: Option<PeerId>,
        dialed: Option<PeerAddress>,
    ) -> Result<Established, NetworkError> {
        let listen = self.listen_addrs.borrow().clone();
        let channel = secure::upgrade(
            raw.io,
            &self.keypair,
            role,
            expected,
            &listen,
            self.handshake_timeout,
        )
        .await?;
        let direction = match role {
            Role::Initiator => Direction::Outbound,
            Role::Responder => Direction::Inbound,
        };
        let (connection, incoming) = mux::spawn(
            channel,
            raw.remote_addr,
            direction,
            self.mux.clone(),
            self.supported.clone(),
        );
        Ok(Established {
            connection: Some(connection),
            incoming: Some(incoming),
            dialed,
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

struct DialReport {
    /// Per-address outcome, in attempt order.
    outcomes: Vec<(PeerAddress, bool)>,
    result: Result<Established, NetworkError>,
}

async fn dial_with_retries(
    ctx: DialContext,
    expected: Option<PeerId>,
    addrs: Vec<PeerAddress>,
    policy: RetryPolicy,
) -> DialReport {
    let mut outcomes = Vec::new();
    let mut candidates = addrs;
    let mut last_err = NetworkError::NoAddressKnown;

    for attempt in 0..policy.max_attempts.max(1) {
        let mut retry = Vec::new();
        for addr in candidates {
            match ctx.dial_once(&addr, expected).await {
                Ok(established) => {
                    outcomes.push((addr, true));
                    return DialReport { outcomes, result: Ok(established) };
                }
                Err(NetworkError::HandshakeFailed(reason)) => {
                    debug!(addr = %addr, reason = %reason, "handshake failed, not retrying");
                    outcomes.push((addr, false));
                    return DialReport {
                        outcomes,
                        result: Err(NetworkError::HandshakeFailed(reason)),
                    };
                }
                Err(e) => {
                    trace!(addr = %addr, attempt, error = %e, "dial attempt failed");
                    outcomes.push((addr.clone(), false));
                    if e.is_transient() {
                        retry.push(addr);
                    }
                    last_err = e;
                }
            }
        }
        if retry.is_empty() || attempt + 1 >= policy.max_attempts {
            break;
        }
        tokio::time::sleep(backoff_delay(attempt, policy.base, policy.max)).await;
        candidates = retry;
    }

    DialReport { outcomes, result: Err(last_err) }
}

async fn accept_loop(mut listener: Listener, ctx: DialContext, cmd_tx: mpsc::Sender<Command>) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            raw = listener.accept() => {
                let Some(raw) = raw else { break };
                let ctx = ctx.clone();
                let cmd_tx = cmd_tx.clone();
                handshakes.spawn(async move {
                    let remote = raw.remote_addr.clone();
                    match ctx.upgrade(raw, Role::Responder, None, None).await {
                        Ok(established) => {
                            let _ = cmd_tx.send(Command::Inbound(established)).await;
                        }
                        Err(e) => debug!(remote = %remote, error = %e, "inbound handshake failed"),
                    }
                });
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
    debug!(addr = %listener.local_addr(), "listener closed");
}

async fn route_streams(
    mut incoming: mpsc::Receiver<Stream>,
    handlers: Arc<HashMap<String, mpsc::Sender<InboundStream>>>,
    info: ConnectionInfo,
) {
    while let Some(stream) = incoming.recv().await {
        let Some(handler) = handlers.get(stream.protocol()) else {
            continue;
        };
        let inbound = InboundStream { stream, connection: info.clone() };
        if let Err(e) = handler.try_send(inbound) {
            // Dropping the stream resets it; a busy handler never stalls the connection.
            debug!(
                peer = %info.remote_peer.short(),
                error = %e,
                "protocol handler busy, refusing stream"
            );
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum DialKey {
    Peer(PeerId),
    Address(PeerAddress),
}

type DialReply = oneshot::Sender<Result<Connection, NetworkError>>;

enum Command {
    Dial { peer: PeerId, reply: DialReply },
    DialAddress { addr: PeerAddress, reply: DialReply },
    DialFinished { key: DialKey, report: DialReport },
    Inbound(Established),
    ConnectionClosed { peer: PeerId, id: u64 },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<PeerAddress>,
        reply: oneshot::Sender<MergeOutcome>,
    },
    Listen {
        addr: PeerAddress,
        reply: oneshot::Sender<Result<PeerAddress, NetworkError>>,
    },
    ListenAddrs(oneshot::Sender<Vec<PeerAddress>>),
    GetConnection {
        peer: PeerId,
        reply: oneshot::Sender<Option<Connection>>,
    },
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    GetPeerRecord {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerRecord>>,
    },
    Disconnect { peer: PeerId, reply: oneshot::Sender<()> },
    Shutdown(oneshot::Sender<()>),
}

struct ConnectionActor {
    ctx: DialContext,
    config: ConnectionConfig,
    store: PeerStore,
    /// Live connections per peer, oldest first.
    connections: HashMap<PeerId, Vec<Connection>>,
    pending_dials: HashMap<DialKey, Vec<DialReply>>,
    handlers: Arc<HashMap<String, mpsc::Sender<InboundStream>>>,
    listen_tx: watch::Sender<Vec<PeerAddress>>,
    events: broadcast::Sender<PeerEvent>,
    cmd_tx: mpsc::Sender<Command>,
    tasks: JoinSet<()>,
}

impl ConnectionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }
        debug!("connection manager stopped");
        // Late callers get NotRunning from the closed channel.
        cmd_rx.close();
        while let Some(cmd) = cmd_rx.recv().await {
            if let Command::Shutdown(reply) = cmd {
                let _ = reply.send(());
            }
        }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_dial_attempts,
            base: self.config.backoff_base,
            max: self.config.backoff_max,
        }
    }

    fn oldest_live(&self, peer: &PeerId) -> Option<Connection> {
        self.connections
            .get(peer)?
            .iter()
            .find(|c| !c.is_closed())
            .cloned()
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { peer, reply } => self.handle_dial(peer, reply),
            Command::DialAddress { addr, reply } => self.handle_dial_address(addr, reply),
            Command::DialFinished { key, report } => self.handle_dial_finished(key, report),
            Command::Inbound(established) => {
                self.register(established);
            }
            Command::ConnectionClosed { peer, id } => self.handle_connection_closed(peer, id),
            Command::AddAddresses { peer, addrs, reply } => {
                let outcome = self.store.merge(peer, &addrs);
                if outcome != MergeOutcome::Unchanged {
                    let _ = self.events.send(PeerEvent::Discovered { peer, addrs });
                }
                let _ = reply.send(outcome);
            }
            Command::Listen { addr, reply } => {
                let _ = reply.send(self.handle_listen(addr).await);
            }
            Command::ListenAddrs(reply) => {
                let _ = reply.send(self.listen_tx.borrow().clone());
            }
            Command::GetConnection { peer, reply } => {
                let _ = reply.send(self.oldest_live(&peer));
            }
            Command::ConnectedPeers(reply) => {
                let peers = self
                    .connections
                    .iter()
                    .filter(|(_, conns)| conns.iter().any(|c| !c.is_closed()))
                    .map(|(peer, _)| *peer)
                    .collect();
                let _ = reply.send(peers);
            }
            Command::GetPeerRecord { peer, reply } => {
                let _ = reply.send(self.store.get(&peer).cloned());
            }
            Command::Disconnect { peer, reply } => {
                if let Some(conns) = self.connections.get(&peer) {
                    for conn in conns {
                        conn.close();
                    }
                }
                let _ = reply.send(());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn handle_dial(&mut self, peer: PeerId, reply: DialReply) {
        if let Some(conn) = self.oldest_live(&peer) {
            let _ = reply.send(Ok(conn));
            return;
        }
        let key = DialKey::Peer(peer);
        if let Some(waiters) = self.pending_dials.get_mut(&key) {
            trace!(peer = %peer.short(), "joining in-flight dial");
            waiters.push(reply);
            return;
        }
        let addrs: Vec<PeerAddress> = self
            .store
            .addresses_by_priority(&peer)
            .into_iter()
            .filter(|a| self.ctx.transports.can_dial(a))
            .collect();
        if addrs.is_empty() {
            let _ = reply.send(Err(NetworkError::NoAddressKnown));
            return;
        }

        self.pending_dials.insert(key.clone(), vec![reply]);
        self.store.set_state(peer, ConnectionState::Connecting);
        self.spawn_dial(key, Some(peer), addrs);
    }

    fn handle_dial_address(&mut self, addr: PeerAddress, reply: DialReply) {
        if let Some(peer) = addr.peer_id() {
            self.store.merge(peer, std::slice::from_ref(&addr));
            self.handle_dial(peer, reply);
            return;
        }
        if !self.ctx.transports.can_dial(&addr) {
            let _ = reply.send(Err(NetworkError::Unreachable(format!("no transport for {}", addr))));
            return;
        }
        let key = DialKey::Address(addr.clone());
        if let Some(waiters) = self.pending_dials.get_mut(&key) {
            waiters.push(reply);
            return;
        }
        self.pending_dials.insert(key.clone(), vec![reply]);
        self.spawn_dial(key, None, vec![addr]);
    }

    fn spawn_dial(&mut self, key: DialKey, expected: Option<PeerId>, addrs: Vec<PeerAddress>) {
        let ctx = self.ctx.clone();
        let cmd_tx = self.cmd_tx.clone();
        let policy = self.policy();
        self.tasks.spawn(async move {
            let report = dial_with_retries(ctx, expected, addrs, policy).await;
            let _ = cmd_tx.send(Command::DialFinished { key, report }).await;
        });
    }

    fn handle_dial_finished(&mut self, key: DialKey, report: DialReport) {
        let waiters = self.pending_dials.remove(&key).unwrap_or_default();

        if let DialKey::Peer(peer) = &key {
            for (addr, ok) in &report.outcomes {
                if !ok {
                    self.store.record_failure(*peer, addr);
                }
            }
        }

        let result = match report.result {
            Ok(established) => self
                .register(established)
                .and_then(|peer| self.oldest_live(&peer))
                .ok_or(NetworkError::ConnectionClosed),
            Err(e) => {
                if let DialKey::Peer(peer) = &key {
                    if self.oldest_live(peer).is_none() {
                        self.store.set_state(*peer, ConnectionState::Disconnected);
                    }
                    debug!(peer = %peer.short(), error = %e, "dial failed");
                }
                Err(e)
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Track a new connection and start routing its streams. Returns the remote peer.
    fn register(&mut self, mut established: Established) -> Option<PeerId> {
        let connection = established.connection.take()?;
        let incoming = established.incoming.take()?;
        let info = connection.info().clone();
        let peer = info.remote_peer;

        self.store.merge(peer, &info.remote_listen_addrs);
        if let Some(addr) = &established.dialed {
            self.store.record_success(peer, addr);
        }
        self.store.set_state(peer, ConnectionState::Connected);

        let conns = self.connections.entry(peer).or_default();
        let first = conns.is_empty();
        conns.push(connection.clone());
        conns.sort_by_key(|c| c.id());

        self.tasks
            .spawn(route_streams(incoming, self.handlers.clone(), info.clone()));
        let cmd_tx = self.cmd_tx.clone();
        let id = info.id;
        self.tasks.spawn(async move {
            connection.closed().await;
            let _ = cmd_tx.send(Command::ConnectionClosed { peer, id }).await;
        });

        if first {
            info!(
                peer = %peer.short(),
                addr = %info.remote_addr,
                direction = ?info.direction,
                "peer connected"
            );
            let _ = self.events.send(PeerEvent::Connected { peer, info });
        } else {
            debug!(peer = %peer.short(), id, "additional connection to peer");
        }
        Some(peer)
    }

    fn handle_connection_closed(&mut self, peer: PeerId, id: u64) {
        let Some(conns) = self.connections.get_mut(&peer) else {
            return;
        };
        let Some(pos) = conns.iter().position(|c| c.id() == id) else {
            return;
        };
        let closed = conns.remove(pos);
        if conns.is_empty() {
            self.connections.remove(&peer);
            self.store.set_state(peer, ConnectionState::Disconnected);
            info!(peer = %peer.short(), "peer disconnected");
            let _ = self.events.send(PeerEvent::Disconnected {
                peer,
                info: closed.info().clone(),
            });
        }
    }

    async fn handle_listen(&mut self, addr: PeerAddress) -> Result<PeerAddress, NetworkError> {
        let listener = self.ctx.transports.listen(&addr).await?;
        let local = listener.local_addr().clone();
        self.listen_tx.send_modify(|addrs| addrs.push(local.clone()));
        self.tasks
            .spawn(accept_loop(listener, self.ctx.clone(), self.cmd_tx.clone()));
        info!(addr = %local, "listening");
        Ok(local)
    }

    async fn shutdown(&mut self) {
        for (_, waiters) in self.pending_dials.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(NetworkError::NotRunning));
            }
        }
        // Listeners, dial tasks, stream routers and close watchers.
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        let connections: Vec<(PeerId, Vec<Connection>)> = self.connections.drain().collect();
        for conn in connections.iter().flat_map(|(_, conns)| conns) {
            conn.close();
        }
        let all_closed = async {
            for conn in connections.iter().flat_map(|(_, conns)| conns) {
                conn.closed().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, all_closed).await.is_err() {
            warn!("connections did not close within the shutdown grace period");
        }
        for (peer, conns) in connections {
            self.store.set_state(peer, ConnectionState::Disconnected);
            if let Some(last) = conns.last() {
                let _ = self.events.send(PeerEvent::Disconnected {
                    peer,
                    info: last.info().clone(),
                });
            }
        }
        self.listen_tx.send_replace(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    struct TestPeer {
        manager: ConnectionManager,
        addr: PeerAddress,
        queues: HashMap<String, mpsc::Receiver<InboundStream>>,
    }

    async fn peer_on(hub: &MemoryHub, protocols: &[&str], config: ConnectionConfig) -> TestPeer {
        let mut router = ProtocolRouter::default();
        let queues = protocols
            .iter()
            .map(|p| (p.to_string(), router.register_protocol(p)))
            .collect();
        let transports = Transports::new().with(MemoryTransport::with_hub(hub.clone()));
        let manager = ConnectionManager::spawn(
            Keypair::generate(),
            transports,
            config,
            MuxConfig::default(),
            router,
        );
        let addr = manager.listen(PeerAddress::memory(0)).await.unwrap();
        TestPeer { manager, addr, queues }
    }

    async fn peer(hub: &MemoryHub) -> TestPeer {
        peer_on(hub, &["/echo/1"], ConnectionConfig::default()).await
    }

    async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(40, base, max), max);
    }

    #[tokio::test]
    async fn dial_by_address_connects_both_sides() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;
        let mut a_events = a.manager.events();
        let mut b_events = b.manager.events();

        let conn = a.manager.dial_address(b.addr.clone()).await.unwrap();
        assert_eq!(conn.remote_peer(), b.manager.local_peer());
        assert_eq!(conn.direction(), Direction::Outbound);

        match next_event(&mut a_events).await {
            PeerEvent::Connected { peer, .. } => assert_eq!(peer, b.manager.local_peer()),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut b_events).await {
            PeerEvent::Connected { peer, info } => {
                assert_eq!(peer, a.manager.local_peer());
                assert_eq!(info.direction, Direction::Inbound);
                // Listen addresses travel in the handshake.
                assert_eq!(info.remote_listen_addrs, vec![a.addr.clone()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.manager.connected_peers().await, vec![b.manager.local_peer()]);
    }

    #[tokio::test]
    async fn concurrent_dials_share_one_connection() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;
        let target = b.manager.local_peer();
        a.manager.add_addresses(target, vec![b.addr.clone()]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = a.manager.clone();
            handles.push(tokio::spawn(async move { manager.dial(target).await }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(a.manager.connected_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_has_no_address() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let stranger = Keypair::generate().peer_id();
        assert_eq!(a.manager.dial(stranger).await.unwrap_err(), NetworkError::NoAddressKnown);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_addresses_are_retried_with_backoff() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let ghost = Keypair::generate().peer_id();
        let dead = PeerAddress::memory(77);
        a.manager.add_addresses(ghost, vec![dead.clone()]).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = a.manager.dial(ghost).await.unwrap_err();
        assert!(matches!(err, NetworkError::Unreachable(_)));
        // Two backoff sleeps between three rounds: 100ms + 200ms.
        assert!(started.elapsed() >= Duration::from_millis(300));

        let record = a.manager.peer_record(ghost).await.unwrap();
        assert_eq!(record.addrs[0].failures, DEFAULT_MAX_DIAL_ATTEMPTS);
        assert_eq!(record.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wrong_identity_fails_handshake_without_retry() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;
        let imposter_claim = Keypair::generate().peer_id();
        a.manager
            .add_addresses(imposter_claim, vec![b.addr.clone()])
            .await
            .unwrap();

        let err = a.manager.dial(imposter_claim).await.unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeFailed(_)));
        let record = a.manager.peer_record(imposter_claim).await.unwrap();
        assert_eq!(record.addrs[0].failures, 1);
        assert!(a.manager.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn inbound_streams_reach_registered_handler() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let mut b = peer(&hub).await;

        let conn = a.manager.dial_address(b.addr.clone()).await.unwrap();
        let mut stream = conn.open_stream("/echo/1").await.unwrap();
        stream.write_message(b"hi").await.unwrap();

        let queue = b.queues.get_mut("/echo/1").unwrap();
        let mut inbound = queue.recv().await.unwrap();
        assert_eq!(inbound.connection.remote_peer, a.manager.local_peer());
        assert_eq!(inbound.stream.read_message().await.unwrap().unwrap(), b"hi");

        let err = conn.open_stream("/other/1").await.unwrap_err();
        assert!(matches!(err, NetworkError::ProtocolNotSupported(_)));
    }

    #[tokio::test]
    async fn disconnect_emits_event_on_both_sides() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;
        let conn = a.manager.dial_address(b.addr.clone()).await.unwrap();
        let mut a_events = a.manager.events();
        let mut b_events = b.manager.events();

        a.manager.disconnect(b.manager.local_peer()).await;
        conn.closed().await;

        assert!(matches!(next_event(&mut a_events).await, PeerEvent::Disconnected { .. }));
        assert!(matches!(next_event(&mut b_events).await, PeerEvent::Disconnected { .. }));
        assert!(a.manager.connection(b.manager.local_peer()).await.is_none());
    }

    #[tokio::test]
    async fn add_addresses_reports_discovery() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let mut events = a.manager.events();
        let other = Keypair::generate().peer_id();

        let outcome = a.manager.add_addresses(other, vec![PeerAddress::memory(5)]).await.unwrap();
        assert_eq!(outcome, MergeOutcome::New);
        assert!(matches!(next_event(&mut events).await, PeerEvent::Discovered { .. }));

        let outcome = a.manager.add_addresses(other, vec![PeerAddress::memory(5)]).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_final() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;
        let conn = a.manager.dial_address(b.addr.clone()).await.unwrap();

        a.manager.shutdown().await;
        a.manager.shutdown().await;
        assert!(conn.is_closed());
        assert_eq!(
            a.manager.dial(b.manager.local_peer()).await.unwrap_err(),
            NetworkError::NotRunning
        );
        // The listener is gone too.
        let err = b.manager.dial_address(a.addr.clone()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
