//! # RPC Layer
//!
//! Stream-backed implementation of the protocol traits, plus the inbound
//! servers that answer them.
//!
//! ## Architecture
//!
//! - [`NetworkRpc`]: client side; resolves a peer to a live connection
//!   through the [`ConnectionManager`] and speaks one protocol per stream
//! - [`serve_dht`] / [`serve_gossip`]: server side; consume the inbound
//!   streams the connection manager routes for each protocol id
//!
//! ## Stream Usage
//!
//! | Protocol | Pattern |
//! |----------|---------|
//! | DHT | One stream per request: write request, half close, read response |
//! | GossipSub | One long-lived outbound stream per peer, one message per frame |
//!
//! The sender of a DHT request is taken from the authenticated connection,
//! never from the message body, and its advertised listen addresses come from
//! the secure handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::connection::{ConnectionManager, InboundStream};
use crate::dht::{DhtNode, Key};
use crate::gossipsub::GossipSub;
use crate::identity::{Contact, PeerId};
use crate::messages::{
    self, deserialize_bounded, DhtRequest, DhtResponse, GossipSubRequest, GOSSIPSUB_PROTOCOL,
    KAD_PROTOCOL,
};
use crate::mux::Stream;
use crate::protocols::{DhtRpc, GossipRpc};

/// Default bound on one request/response exchange, dial included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum contacts accepted from a single find_node/get_providers response.
/// SECURITY: Limits routing table pollution from a single response.
const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// How long a server waits for the request after a stream opens.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound DHT requests handled at once; further streams wait in the queue.
const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Inbound gossip streams served at once.
const MAX_GOSSIP_STREAMS: usize = 1024;

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct NetworkRpc {
    manager: ConnectionManager,
    request_timeout: Duration,
    gossip_streams: Arc<Mutex<HashMap<PeerId, Arc<Mutex<Stream>>>>>,
}

impl NetworkRpc {
    pub fn new(manager: ConnectionManager, request_timeout: Duration) -> Self {
        Self {
            manager,
            request_timeout,
            gossip_streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Drop the cached gossip stream to `peer`.
    pub async fn forget(&self, peer: &PeerId) {
        self.gossip_streams.lock().await.remove(peer);
    }

    async fn rpc(&self, to: &Contact, request: DhtRequest) -> Result<DhtResponse> {
        if !to.addrs.is_empty() {
            self.manager.add_addresses(to.peer_id, to.addrs.clone()).await?;
        }

        let exchange = async {
            let connection = self.manager.dial(to.peer_id).await?;
            let mut stream = connection.open_stream(KAD_PROTOCOL).await?;
            let bytes = messages::serialize(&request).context("failed to encode dht request")?;
            stream.write_message(&bytes).await?;
            stream.close().await?;
            let reply = stream
                .read_message()
                .await?
                .context("peer closed the stream without a response")?;
            let response: DhtResponse =
                deserialize_bounded(&reply).context("failed to decode dht response")?;
            Ok::<_, anyhow::Error>(response)
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(DhtResponse::Error { message })) => bail!("remote error: {}", message),
            Ok(result) => result,
            Err(_) => Err(crate::error::NetworkError::Timeout.into()),
        }
    }

    async fn gossip_stream(&self, to: &PeerId) -> Result<Arc<Mutex<Stream>>> {
        if let Some(stream) = self.gossip_streams.lock().await.get(to) {
            return Ok(stream.clone());
        }
        let connection = self.manager.dial(*to).await?;
        let stream = Arc::new(Mutex::new(connection.open_stream(GOSSIPSUB_PROTOCOL).await?));
        self.gossip_streams.lock().await.insert(*to, stream.clone());
        trace!(peer = %to.short(), "opened gossip stream");
        Ok(stream)
    }
}

#[async_trait]
impl DhtRpc for NetworkRpc {
    async fn find_node(&self, to: &Contact, target: PeerId) -> Result<Vec<Contact>> {
        match self.rpc(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(mut nodes) => {
                nodes.truncate(MAX_CONTACTS_PER_RESPONSE);
                Ok(nodes)
            }
            other => bail!("unexpected response to find_node: {:?}", other),
        }
    }

    async fn get_providers(&self, to: &Contact, key: Key) -> Result<(Vec<Contact>, Vec<Contact>)> {
        match self.rpc(to, DhtRequest::GetProviders { key }).await? {
            DhtResponse::Providers { mut providers, mut closer } => {
                providers.truncate(MAX_CONTACTS_PER_RESPONSE);
                closer.truncate(MAX_CONTACTS_PER_RESPONSE);
                Ok((providers, closer))
            }
            other => bail!("unexpected response to get_providers: {:?}", other),
        }
    }

    async fn add_provider(&self, to: &Contact, key: Key, provider: Contact) -> Result<()> {
        match self.rpc(to, DhtRequest::AddProvider { key, provider }).await? {
            DhtResponse::Ack => Ok(()),
            other => bail!("unexpected response to add_provider: {:?}", other),
        }
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        match self.rpc(to, DhtRequest::Ping).await? {
            DhtResponse::Pong => Ok(()),
            other => bail!("unexpected response to ping: {:?}", other),
        }
    }
}

#[async_trait]
impl GossipRpc for NetworkRpc {
    async fn send_gossip(&self, to: &PeerId, message: GossipSubRequest) -> Result<()> {
        let bytes = messages::serialize(&message).context("failed to encode gossip message")?;

        // A cached stream may belong to a connection that has since closed;
        // retry once on a fresh one.
        let stream = self.gossip_stream(to).await?;
        let first = stream.lock().await.write_message(&bytes).await;
        let Err(e) = first else {
            return Ok(());
        };
        self.forget(to).await;
        trace!(peer = %to.short(), error = %e, "gossip stream failed, reopening");

        let stream = self.gossip_stream(to).await?;
        let result = stream.lock().await.write_message(&bytes).await;
        if result.is_err() {
            self.forget(to).await;
        }
        Ok(result?)
    }
}

// ============================================================================
// Servers
// ============================================================================

/// Answer DHT requests arriving on `inbound` until the router closes it.
pub async fn serve_dht<N: DhtRpc>(dht: DhtNode<N>, mut inbound: mpsc::Receiver<InboundStream>) {
    let mut tasks = JoinSet::new();
    while let Some(InboundStream { stream, connection }) = inbound.recv().await {
        while tasks.len() >= MAX_CONCURRENT_REQUESTS {
            tasks.join_next().await;
        }
        while tasks.try_join_next().is_some() {}

        let dht = dht.clone();
        let from = Contact::new(connection.remote_peer, connection.remote_listen_addrs);
        tasks.spawn(async move {
            let peer = from.peer_id;
            if let Err(e) = handle_dht_stream(&dht, from, stream).await {
                debug!(peer = %peer.short(), error = %e, "dht request failed");
            }
        });
    }
    debug!("dht server stopped");
}

async fn handle_dht_stream<N: DhtRpc>(dht: &DhtNode<N>, from: Contact, mut stream: Stream) -> Result<()> {
    let bytes = tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read_message())
        .await
        .context("timed out waiting for request")??
        .context("stream closed before the request")?;
    let request: DhtRequest = deserialize_bounded(&bytes).context("failed to decode dht request")?;
    trace!(peer = %from.peer_id.short(), request = ?request, "dht request");

    let response = dht.handle_request(from, request).await;
    let bytes = messages::serialize(&response).context("failed to encode dht response")?;
    stream.write_message(&bytes).await?;
    stream.close().await?;
    Ok(())
}

/// Feed gossip from every inbound stream into `gossipsub`, in stream order.
pub async fn serve_gossip<N: GossipRpc>(gossipsub: GossipSub<N>, mut inbound: mpsc::Receiver<InboundStream>) {
    let mut tasks = JoinSet::new();
    while let Some(InboundStream { stream, connection }) = inbound.recv().await {
        while tasks.try_join_next().is_some() {}
        if tasks.len() >= MAX_GOSSIP_STREAMS {
            debug!(peer = %connection.remote_peer.short(), "too many gossip streams, refusing");
            stream.reset();
            continue;
        }
        let gossipsub = gossipsub.clone();
        tasks.spawn(read_gossip_stream(gossipsub, connection.remote_peer, stream));
    }
    debug!("gossip server stopped");
}

async fn read_gossip_stream<N: GossipRpc>(gossipsub: GossipSub<N>, from: PeerId, mut stream: Stream) {
    loop {
        let bytes = match stream.read_message().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                trace!(peer = %from.short(), error = %e, "gossip stream ended");
                break;
            }
        };
        match deserialize_bounded::<GossipSubRequest>(&bytes) {
            Ok(message) => gossipsub.handle_message(from, message).await,
            Err(e) => {
                debug!(peer = %from.short(), error = %e, "malformed gossip message, dropping stream");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PeerAddress;
    use crate::connection::{ConnectionConfig, ProtocolRouter};
    use crate::dht::DhtConfig;
    use crate::error::NetworkError;
    use crate::gossipsub::GossipSubConfig;
    use crate::identity::Keypair;
    use crate::mux::MuxConfig;
    use crate::transport::{MemoryHub, MemoryTransport, Transports};
    use tokio::time::timeout;

    struct Peer {
        manager: ConnectionManager,
        rpc: NetworkRpc,
        keypair: Keypair,
        addr: PeerAddress,
        router_rx: (mpsc::Receiver<InboundStream>, mpsc::Receiver<InboundStream>),
    }

    async fn peer(hub: &MemoryHub) -> Peer {
        let keypair = Keypair::generate();
        let mut router = ProtocolRouter::default();
        let kad = router.register_protocol(KAD_PROTOCOL);
        let gossip = router.register_protocol(GOSSIPSUB_PROTOCOL);
        let transports = Transports::new().with(MemoryTransport::with_hub(hub.clone()));
        let manager = ConnectionManager::spawn(
            keypair.clone(),
            transports,
            ConnectionConfig::default(),
            MuxConfig::default(),
            router,
        );
        let addr = manager.listen(PeerAddress::memory(0)).await.unwrap();
        let rpc = NetworkRpc::new(manager.clone(), DEFAULT_REQUEST_TIMEOUT);
        Peer { manager, rpc, keypair, addr, router_rx: (kad, gossip) }
    }

    #[tokio::test]
    async fn dht_requests_cross_a_real_connection() {
        let hub = MemoryHub::default();
        let client = peer(&hub).await;
        let server = peer(&hub).await;
        let Peer { rpc: server_rpc, router_rx: (kad_rx, _gossip_rx), .. } = server;

        let server_contact = Contact::new(server.keypair.peer_id(), vec![server.addr.clone()]);
        let dht = DhtNode::new(server_contact.clone(), server_rpc, DhtConfig::default());
        tokio::spawn(serve_dht(dht.clone(), kad_rx));

        client.rpc.ping(&server_contact).await.unwrap();

        // The server learned the client from the authenticated connection.
        let nodes = client
            .rpc
            .find_node(&server_contact, client.keypair.peer_id())
            .await
            .unwrap();
        assert!(nodes.iter().any(|c| c.peer_id == client.keypair.peer_id()));

        let key = crate::dht::content_key(b"file");
        let me = Contact::new(client.keypair.peer_id(), vec![client.addr.clone()]);
        client.rpc.add_provider(&server_contact, key, me.clone()).await.unwrap();
        let (providers, _) = client.rpc.get_providers(&server_contact, key).await.unwrap();
        assert_eq!(providers, vec![me]);
    }

    #[tokio::test]
    async fn dht_request_to_unserved_protocol_fails() {
        let hub = MemoryHub::default();
        let client = peer(&hub).await;
        let server = peer(&hub).await;
        let contact = Contact::new(server.keypair.peer_id(), vec![server.addr.clone()]);
        // Registered but nobody serves it: the request times out.
        let rpc = NetworkRpc::new(client.manager.clone(), Duration::from_millis(200));
        let err = rpc.ping(&contact).await.unwrap_err();
        assert_eq!(err.downcast_ref::<NetworkError>(), Some(&NetworkError::Timeout));
    }

    #[tokio::test]
    async fn gossip_flows_over_persistent_stream() {
        let hub = MemoryHub::default();
        let a = peer(&hub).await;
        let b = peer(&hub).await;

        let gossip_b = GossipSub::spawn(b.keypair.clone(), Arc::new(b.rpc.clone()), GossipSubConfig::default());
        let Peer { router_rx: (_kad, gossip_rx), .. } = b;
        tokio::spawn(serve_gossip(gossip_b.clone(), gossip_rx));
        let _sub = gossip_b.subscribe("news").await.unwrap();

        a.manager.dial_address(b.addr.clone()).await.unwrap();
        a.rpc
            .send_gossip(&b.keypair.peer_id(), GossipSubRequest::Subscribe { topic: "news".into() })
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            while gossip_b.topic_peers("news").await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(gossip_b.topic_peers("news").await, vec![a.keypair.peer_id()]);

        // The stream survives a reconnect.
        let connection = a.manager.connection(b.keypair.peer_id()).await.unwrap();
        a.manager.disconnect(b.keypair.peer_id()).await;
        connection.closed().await;
        a.rpc
            .send_gossip(&b.keypair.peer_id(), GossipSubRequest::Unsubscribe { topic: "news".into() })
            .await
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while !gossip_b.topic_peers("news").await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
