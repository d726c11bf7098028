//! # Stream Multiplexer
//!
//! Splits one [`SecureChannel`] into many independent, flow-controlled streams.
//!
//! ## Frame layout
//!
//! Each multiplexer frame travels as exactly one secure-channel frame:
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────┬─────────────┐
//! │ stream_id u32│ kind u8 │ length u32   │ payload     │
//! └──────────────┴─────────┴──────────────┴─────────────┘
//! ```
//!
//! | Kind | Payload |
//! |------|---------|
//! | `Open` | protocol id (UTF-8) |
//! | `Accept` | empty |
//! | `Data` | stream bytes |
//! | `WindowUpdate` | `u32 BE` credit |
//! | `Close` | empty, half close of the sender's side |
//! | `Reset` | empty, abort in both directions |
//! | `GoAway` | empty, connection is closing |
//!
//! ## Tasks
//!
//! Per connection there is one actor owning the stream table, one reader task
//! decoding inbound frames, and one writer task draining the outbound frame
//! queue into the secure channel. Streams send `Data`/`Close` frames straight to
//! the writer queue and bookkeeping to the actor, so per-stream byte order is
//! the queue order.
//!
//! ## Flow control
//!
//! The send window of a stream is a semaphore holding one permit per byte the
//! remote still accepts. Readers hand credit back once they have consumed half
//! a window. Closing the connection closes every semaphore and drops every
//! inbound queue, so pending reads and writes fail with
//! [`NetworkError::ConnectionClosed`] immediately.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::messages::MAX_DESERIALIZE_SIZE;
use crate::secure::{SecureChannel, SecureReader, SecureWriter, MAX_FRAME_PLAINTEXT};

pub const DEFAULT_WINDOW: u32 = 256 * 1024;
pub const DEFAULT_MAX_STREAMS: usize = 512;
pub const DEFAULT_ACCEPT_QUEUE: usize = 32;
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub const HEADER_LEN: usize = 9;
pub const MAX_PROTOCOL_LEN: usize = 256;

/// Largest payload of a single `Data` frame.
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Largest message accepted by [`Stream::read_message`].
pub const MAX_MESSAGE_SIZE: usize = MAX_DESERIALIZE_SIZE as usize;

// A full data frame must fit in one secure-channel frame.
const _: () = assert!(HEADER_LEN + MAX_DATA_CHUNK <= MAX_FRAME_PLAINTEXT);

const OUTBOUND_QUEUE: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Initial per-stream receive window in bytes.
    pub window: u32,
    pub max_streams: usize,
    /// Close a connection that has had no open streams for this long.
    pub idle_timeout: Option<Duration>,
    pub accept_queue: usize,
    /// How long `open_stream` waits for the remote to accept or refuse.
    pub open_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_streams: DEFAULT_MAX_STREAMS,
            idle_timeout: None,
            accept_queue: DEFAULT_ACCEPT_QUEUE,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 0,
    Accept = 1,
    Data = 2,
    WindowUpdate = 3,
    Close = 4,
    Reset = 5,
    GoAway = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FrameKind::Open,
            1 => FrameKind::Accept,
            2 => FrameKind::Data,
            3 => FrameKind::WindowUpdate,
            4 => FrameKind::Close,
            5 => FrameKind::Reset,
            6 => FrameKind::GoAway,
            other => bail!("unknown frame kind {}", other),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    fn control(stream_id: u32, kind: FrameKind) -> Self {
        Self { stream_id, kind, payload: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("frame shorter than header ({} bytes)", bytes.len());
        }
        let stream_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let kind = FrameKind::try_from(bytes[4])?;
        let len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != len {
            bail!("frame length {} does not match payload {}", len, payload.len());
        }
        Ok(Self { stream_id, kind, payload: payload.to_vec() })
    }
}

// ============================================================================
// Connection handle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Metadata of a live connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Process-wide increasing id; a later connection always has a larger id.
    pub id: u64,
    pub remote_peer: PeerId,
    pub remote_addr: PeerAddress,
    pub remote_listen_addrs: Vec<PeerAddress>,
    pub direction: Direction,
    pub opened_at: Instant,
}

/// Cheap-to-clone handle on a multiplexed connection.
///
/// Dropping handles does not close the connection; the owner calls [`Connection::close`].
#[derive(Clone)]
pub struct Connection {
    info: Arc<ConnectionInfo>,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    closed_rx: watch::Receiver<bool>,
    open_timeout: Duration,
}

impl Connection {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.info.remote_peer
    }

    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    /// Open a stream speaking `protocol`. Fails with `ProtocolNotSupported` if
    /// the remote has no handler for it, and with `Timeout` if it neither
    /// accepts nor refuses within `open_timeout`.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, NetworkError> {
        if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
            return Err(NetworkError::Rejected(format!("invalid protocol id {:?}", protocol)));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::Open { protocol: protocol.to_string(), reply: tx })
            .map_err(|_| NetworkError::ConnectionClosed)?;
        match tokio::time::timeout(self.open_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| NetworkError::ConnectionClosed)?,
            Err(_) => {
                debug!(
                    peer = %self.info.remote_peer.short(),
                    protocol = %protocol,
                    "stream open timed out"
                );
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Close the connection and abort every stream on it.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(MuxCommand::Shutdown { notify_remote: true });
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.cmd_tx.is_closed()
    }

    /// Resolves once the connection is fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.info.id)
            .field("remote_peer", &self.info.remote_peer)
            .field("direction", &self.info.direction)
            .finish()
    }
}

/// Start the multiplexer on an established secure channel.
///
/// Returns the connection handle and the sequence of streams opened by the
/// remote. Inbound `Open` frames for protocols outside `supported` are reset.
pub fn spawn(
    channel: SecureChannel,
    remote_addr: PeerAddress,
    direction: Direction,
    config: MuxConfig,
    supported: Arc<HashSet<String>>,
) -> (Connection, mpsc::Receiver<Stream>) {
    let info = Arc::new(ConnectionInfo {
        id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        remote_peer: channel.remote_peer(),
        remote_addr,
        remote_listen_addrs: channel.remote_listen_addrs().to_vec(),
        direction,
        opened_at: Instant::now(),
    });

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (closed_tx, closed_rx) = watch::channel(false);
    let (incoming_tx, incoming_rx) = mpsc::channel(config.accept_queue.max(1));
    let open_timeout = config.open_timeout;

    let (stop_tx, stop_rx) = oneshot::channel();

    let (reader, writer) = channel.into_split();
    let reader_task = tokio::spawn(read_loop(reader, cmd_tx.clone()));
    let writer_task = tokio::spawn(write_loop(writer, frame_rx, stop_rx, cmd_tx.clone()));

    let actor = MuxActor {
        info: info.clone(),
        config,
        supported,
        streams: HashMap::new(),
        next_stream_id: match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        },
        cmd_tx: cmd_tx.clone(),
        frame_tx,
        incoming_tx,
        idle_since: Some(tokio::time::Instant::now()),
        conn_closed: Arc::new(AtomicBool::new(false)),
    };
    tokio::spawn(actor.run(cmd_rx, reader_task, (writer_task, stop_tx), closed_tx));

    (Connection { info, cmd_tx, closed_rx, open_timeout }, incoming_rx)
}

async fn read_loop(mut reader: SecureReader, cmd_tx: mpsc::UnboundedSender<MuxCommand>) {
    loop {
        let bytes = match reader.read_frame().await {
            Ok(bytes) => bytes,
            Err(_) => break,
        };
        match Frame::decode(&bytes) {
            Ok(frame) => {
                if cmd_tx.send(MuxCommand::Inbound(frame)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "malformed mux frame");
                break;
            }
        }
    }
    let _ = cmd_tx.send(MuxCommand::Shutdown { notify_remote: false });
}

async fn write_loop(
    mut writer: SecureWriter,
    mut frame_rx: mpsc::Receiver<Frame>,
    mut stop_rx: oneshot::Receiver<()>,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
) {
    loop {
        tokio::select! {
            biased;
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if writer.write_frame(&frame.encode()).await.is_err() {
                    let _ = cmd_tx.send(MuxCommand::Shutdown { notify_remote: false });
                    break;
                }
            }
            _ = &mut stop_rx => {
                // Flush what is already queued (GoAway last), then stop.
                frame_rx.close();
                while let Some(frame) = frame_rx.recv().await {
                    if writer.write_frame(&frame.encode()).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.shutdown().await;
}

// ============================================================================
// Actor
// ============================================================================

enum MuxCommand {
    Open {
        protocol: String,
        reply: oneshot::Sender<Result<Stream, NetworkError>>,
    },
    Inbound(Frame),
    Credit { stream_id: u32, amount: u32 },
    LocalClose { stream_id: u32 },
    LocalReset { stream_id: u32 },
    Shutdown { notify_remote: bool },
}

struct StreamSlot {
    protocol: String,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    send_window: Arc<Semaphore>,
    /// Bytes received and not yet credited back.
    recv_outstanding: u32,
    local_closed: bool,
    remote_closed: bool,
    /// Handle waiting for `Accept`, present only on locally opened streams.
    pending: Option<(Stream, oneshot::Sender<Result<Stream, NetworkError>>)>,
}

struct MuxActor {
    info: Arc<ConnectionInfo>,
    config: MuxConfig,
    supported: Arc<HashSet<String>>,
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    frame_tx: mpsc::Sender<Frame>,
    incoming_tx: mpsc::Sender<Stream>,
    idle_since: Option<tokio::time::Instant>,
    conn_closed: Arc<AtomicBool>,
}

impl MuxActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<MuxCommand>,
        reader_task: JoinHandle<()>,
        (writer_task, stop_tx): (JoinHandle<()>, oneshot::Sender<()>),
        closed_tx: watch::Sender<bool>,
    ) {
        let mut notify_remote = false;
        loop {
            let idle_deadline = match (self.config.idle_timeout, self.idle_since) {
                (Some(timeout), Some(since)) => Some(since + timeout),
                _ => None,
            };
            let idle = async {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(MuxCommand::Shutdown { notify_remote: notify }) => {
                            notify_remote = notify;
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                _ = idle => {
                    debug!(peer = %self.info.remote_peer.short(), "closing idle connection");
                    notify_remote = true;
                    break;
                }
            }
            self.idle_since = match (self.streams.is_empty(), self.idle_since) {
                (true, None) => Some(tokio::time::Instant::now()),
                (true, since) => since,
                (false, _) => None,
            };
        }

        self.shutdown(notify_remote).await;
        reader_task.abort();
        let _ = stop_tx.send(());
        let writer_abort = writer_task.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, writer_task).await.is_err() {
            writer_abort.abort();
        }
        let _ = closed_tx.send(true);
        trace!(peer = %self.info.remote_peer.short(), id = self.info.id, "connection closed");
    }

    async fn shutdown(&mut self, notify_remote: bool) {
        self.conn_closed.store(true, Ordering::Release);
        for (_, slot) in self.streams.drain() {
            slot.send_window.close();
            let _ = slot.inbound_tx.send(Inbound::Closed);
            if let Some((_, reply)) = slot.pending {
                let _ = reply.send(Err(NetworkError::ConnectionClosed));
            }
        }
        if notify_remote {
            let _ = self.frame_tx.try_send(Frame::control(0, FrameKind::GoAway));
        }
    }

    async fn send_frame(&self, frame: Frame) {
        if self.frame_tx.send(frame).await.is_err() {
            let _ = self.cmd_tx.send(MuxCommand::Shutdown { notify_remote: false });
        }
    }

    fn new_stream(&self, stream_id: u32, protocol: &str) -> (Stream, StreamSlot) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(Semaphore::new(self.config.window as usize));
        let stream = Stream {
            id: stream_id,
            protocol: protocol.to_string(),
            remote_peer: self.info.remote_peer,
            window: self.config.window,
            inbound_rx,
            read_buf: Vec::new(),
            read_pos: 0,
            consumed: 0,
            read_state: ReadState::Open,
            write_closed: false,
            send_window: send_window.clone(),
            conn_closed: self.conn_closed.clone(),
            frame_tx: self.frame_tx.clone(),
            cmd_tx: self.cmd_tx.clone(),
        };
        let slot = StreamSlot {
            protocol: protocol.to_string(),
            inbound_tx,
            send_window,
            recv_outstanding: 0,
            local_closed: false,
            remote_closed: false,
            pending: None,
        };
        (stream, slot)
    }

    fn maybe_remove(&mut self, stream_id: u32) {
        if self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.local_closed && s.remote_closed)
        {
            self.streams.remove(&stream_id);
        }
    }

    async fn reset_stream(&mut self, stream_id: u32, notify_remote: bool) {
        if let Some(slot) = self.streams.remove(&stream_id) {
            slot.send_window.close();
            let _ = slot.inbound_tx.send(Inbound::Reset);
            if let Some((_, reply)) = slot.pending {
                let _ = reply.send(Err(NetworkError::ProtocolNotSupported(slot.protocol.clone())));
            }
        }
        if notify_remote {
            self.send_frame(Frame::control(stream_id, FrameKind::Reset)).await;
        }
    }

    async fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Open { protocol, reply } => {
                if self.streams.len() >= self.config.max_streams {
                    let _ = reply.send(Err(NetworkError::Rejected("too many streams".into())));
                    return;
                }
                let stream_id = self.next_stream_id;
                self.next_stream_id = self.next_stream_id.wrapping_add(2);
                let (stream, mut slot) = self.new_stream(stream_id, &protocol);
                slot.pending = Some((stream, reply));
                self.streams.insert(stream_id, slot);
                self.send_frame(Frame {
                    stream_id,
                    kind: FrameKind::Open,
                    payload: protocol.into_bytes(),
                })
                .await;
            }
            MuxCommand::Inbound(frame) => self.handle_frame(frame).await,
            MuxCommand::Credit { stream_id, amount } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.recv_outstanding = slot.recv_outstanding.saturating_sub(amount);
                    if !slot.remote_closed {
                        self.send_frame(Frame {
                            stream_id,
                            kind: FrameKind::WindowUpdate,
                            payload: amount.to_be_bytes().to_vec(),
                        })
                        .await;
                    }
                }
            }
            MuxCommand::LocalClose { stream_id } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.local_closed = true;
                    self.maybe_remove(stream_id);
                }
            }
            MuxCommand::LocalReset { stream_id } => {
                if self.streams.contains_key(&stream_id) {
                    self.reset_stream(stream_id, true).await;
                }
            }
            MuxCommand::Shutdown { .. } => {}
        }
    }

    fn is_remote_initiated(&self, stream_id: u32) -> bool {
        // Our ids share parity with next_stream_id.
        (stream_id % 2) != (self.next_stream_id % 2)
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.kind {
            FrameKind::Open => self.handle_open(stream_id, frame.payload).await,
            FrameKind::Accept => {
                let accepted = match self.streams.get_mut(&stream_id) {
                    Some(slot) => slot.pending.take(),
                    None => None,
                };
                if let Some((stream, reply)) = accepted {
                    if let Err(Ok(stream)) = reply.send(Ok(stream)) {
                        // Opener gave up; dropping the stream resets it.
                        drop(stream);
                    }
                }
            }
            FrameKind::Data => {
                let window = self.config.window;
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    trace!(stream_id, "data for unknown stream");
                    return;
                };
                if slot.remote_closed {
                    return;
                }
                let len = frame.payload.len() as u32;
                slot.recv_outstanding = slot.recv_outstanding.saturating_add(len);
                if slot.recv_outstanding > window {
                    debug!(
                        peer = %self.info.remote_peer.short(),
                        stream_id,
                        "remote exceeded stream window"
                    );
                    self.reset_stream(stream_id, true).await;
                    return;
                }
                let _ = slot.inbound_tx.send(Inbound::Data(frame.payload));
            }
            FrameKind::WindowUpdate => {
                let credit = match parse_window_update(&frame.payload) {
                    Ok(credit) => credit as usize,
                    Err(e) => {
                        trace!(stream_id, error = %e, "ignoring malformed window update");
                        return;
                    }
                };
                if let Some(slot) = self.streams.get(&stream_id) {
                    let available = slot.send_window.available_permits();
                    // Never hold more credit than one full window.
                    let grant = credit.min((self.config.window as usize).saturating_sub(available));
                    slot.send_window.add_permits(grant);
                }
            }
            FrameKind::Close => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.remote_closed = true;
                    let _ = slot.inbound_tx.send(Inbound::Fin);
                    self.maybe_remove(stream_id);
                }
            }
            FrameKind::Reset => self.reset_stream(stream_id, false).await,
            FrameKind::GoAway => {
                let _ = self.cmd_tx.send(MuxCommand::Shutdown { notify_remote: false });
            }
        }
    }

    async fn handle_open(&mut self, stream_id: u32, payload: Vec<u8>) {
        let protocol = match String::from_utf8(payload) {
            Ok(p) if !p.is_empty() && p.len() <= MAX_PROTOCOL_LEN => p,
            _ => {
                self.send_frame(Frame::control(stream_id, FrameKind::Reset)).await;
                return;
            }
        };
        if !self.is_remote_initiated(stream_id)
            || self.streams.contains_key(&stream_id)
            || self.streams.len() >= self.config.max_streams
            || !self.supported.contains(&protocol)
        {
            trace!(stream_id, protocol = %protocol, "refusing inbound stream");
            self.send_frame(Frame::control(stream_id, FrameKind::Reset)).await;
            return;
        }

        let (stream, slot) = self.new_stream(stream_id, &protocol);
        self.streams.insert(stream_id, slot);
        self.send_frame(Frame::control(stream_id, FrameKind::Accept)).await;
        if self.incoming_tx.try_send(stream).is_err() {
            debug!(stream_id, protocol = %protocol, "inbound stream queue full");
            self.reset_stream(stream_id, true).await;
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

enum Inbound {
    Data(Vec<u8>),
    Fin,
    Reset,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    Open,
    Finished,
    Reset,
    Closed,
}

/// One logical duplex channel inside a [`Connection`].
///
/// Dropping a stream that was not closed in both directions resets it.
pub struct Stream {
    id: u32,
    protocol: String,
    remote_peer: PeerId,
    window: u32,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    read_buf: Vec<u8>,
    read_pos: usize,
    consumed: u32,
    read_state: ReadState,
    write_closed: bool,
    send_window: Arc<Semaphore>,
    conn_closed: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<Frame>,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), NetworkError> {
        if self.write_closed {
            return Err(NetworkError::Rejected("stream closed for writing".into()));
        }
        while !data.is_empty() {
            // At most half a window per frame, so outstanding uncredited bytes never starve us.
            let n = data.len().min(MAX_DATA_CHUNK).min((self.window as usize / 2).max(1));
            let permits = self
                .send_window
                .acquire_many(n as u32)
                .await
                .map_err(|_| self.write_error())?;
            permits.forget();
            let frame = Frame {
                stream_id: self.id,
                kind: FrameKind::Data,
                payload: data[..n].to_vec(),
            };
            self.frame_tx
                .send(frame)
                .await
                .map_err(|_| NetworkError::ConnectionClosed)?;
            data = &data[n..];
        }
        Ok(())
    }

    fn write_error(&self) -> NetworkError {
        if self.conn_closed.load(Ordering::Acquire) || self.frame_tx.is_closed() {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::Rejected("stream reset".into())
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.read_pos >= self.read_buf.len() {
            match self.read_state {
                ReadState::Finished => return Ok(0),
                ReadState::Reset => return Err(NetworkError::Rejected("stream reset".into())),
                ReadState::Closed => return Err(NetworkError::ConnectionClosed),
                ReadState::Open => {}
            }
            match self.inbound_rx.recv().await {
                Some(Inbound::Data(bytes)) => {
                    self.read_buf = bytes;
                    self.read_pos = 0;
                }
                Some(Inbound::Fin) => self.read_state = ReadState::Finished,
                Some(Inbound::Reset) => self.read_state = ReadState::Reset,
                Some(Inbound::Closed) | None => self.read_state = ReadState::Closed,
            }
        }

        let available = &self.read_buf[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        self.return_credit(n as u32);
        Ok(n)
    }

    fn return_credit(&mut self, n: u32) {
        self.consumed = self.consumed.saturating_add(n);
        if self.consumed >= self.window / 2 {
            let amount = std::mem::take(&mut self.consumed);
            let _ = self.cmd_tx.send(MuxCommand::Credit { stream_id: self.id, amount });
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), NetworkError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(NetworkError::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Write one length-prefixed message.
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::Rejected(format!(
                "message of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        self.write(&framed).await
    }

    /// Read one length-prefixed message, `None` if the remote closed cleanly first.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        let mut len_buf = [0u8; 4];
        let first = self.read(&mut len_buf).await?;
        if first == 0 {
            return Ok(None);
        }
        self.read_exact(&mut len_buf[first..]).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(NetworkError::Rejected(format!("message of {} bytes exceeds limit", len)));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    /// Half close: no more writes from this side, reads continue.
    pub async fn close(&mut self) -> Result<(), NetworkError> {
        if self.write_closed {
            return Ok(());
        }
        self.write_closed = true;
        self.frame_tx
            .send(Frame::control(self.id, FrameKind::Close))
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;
        let _ = self.cmd_tx.send(MuxCommand::LocalClose { stream_id: self.id });
        Ok(())
    }

    /// Abort the stream in both directions.
    pub fn reset(mut self) {
        self.send_reset();
    }

    fn send_reset(&mut self) {
        self.write_closed = true;
        self.read_state = ReadState::Reset;
        let _ = self.cmd_tx.send(MuxCommand::LocalReset { stream_id: self.id });
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let fully_closed = self.write_closed && self.read_state != ReadState::Open;
        if !fully_closed {
            self.send_reset();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

/// Decode the `u32 BE` credit carried by a `WindowUpdate` frame.
pub fn parse_window_update(payload: &[u8]) -> anyhow::Result<u32> {
    let bytes: [u8; 4] = payload.try_into().context("window update must be 4 bytes")?;
    Ok(u32::from_be_bytes(bytes))
}
