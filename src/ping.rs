//! # Ping
//!
//! Liveness probe over `/murmur/ping/1.0.0`: the dialer writes 32 random
//! bytes, the listener echoes them, and the round trip time is the result.
//!
//! [`keepalive`] pings every connected peer periodically and closes a
//! connection after `max_failures` consecutive failed probes.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::{ConnectionManager, InboundStream};
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::messages::PING_PROTOCOL;
use crate::mux::{Connection, Stream};

pub const PING_SIZE: usize = 32;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct PingConfig {
    /// Time between keepalive rounds. Zero disables keepalive.
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed probes before the connection is closed.
    pub max_failures: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_PING_TIMEOUT,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

/// Round trip time of one ping on `connection`.
pub async fn ping(connection: &Connection, timeout: Duration) -> Result<Duration, NetworkError> {
    let mut payload = [0u8; PING_SIZE];
    getrandom::getrandom(&mut payload)
        .map_err(|e| NetworkError::Rejected(format!("random source failed: {}", e)))?;

    let exchange = async {
        let start = Instant::now();
        let mut stream = connection.open_stream(PING_PROTOCOL).await?;
        stream.write(&payload).await?;
        let mut echo = [0u8; PING_SIZE];
        stream.read_exact(&mut echo).await?;
        let rtt = start.elapsed();
        let _ = stream.close().await;
        if echo != payload {
            return Err(NetworkError::Rejected("ping payload mismatch".into()));
        }
        Ok(rtt)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetworkError::Timeout)?
}

/// Echo pings on every stream from `inbound`.
pub async fn serve_ping(mut inbound: mpsc::Receiver<InboundStream>) {
    let mut tasks = JoinSet::new();
    while let Some(InboundStream { stream, .. }) = inbound.recv().await {
        while tasks.try_join_next().is_some() {}
        tasks.spawn(echo(stream));
    }
}

async fn echo(mut stream: Stream) {
    let mut buf = [0u8; PING_SIZE];
    while stream.read_exact(&mut buf).await.is_ok() {
        if stream.write(&buf).await.is_err() {
            return;
        }
    }
    let _ = stream.close().await;
}

/// Ping connected peers forever, closing connections that stop answering.
pub async fn keepalive(manager: ConnectionManager, config: PingConfig) {
    if config.interval.is_zero() {
        return;
    }
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    let mut failures: HashMap<PeerId, u32> = HashMap::new();
    loop {
        interval.tick().await;

        let peers = manager.connected_peers().await;
        failures.retain(|peer, _| peers.contains(peer));

        let mut probes = JoinSet::new();
        for peer in peers {
            let Some(connection) = manager.connection(peer).await else {
                continue;
            };
            let timeout = config.timeout;
            probes.spawn(async move {
                let result = ping(&connection, timeout).await;
                (peer, connection, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((peer, connection, result)) = joined else {
                continue;
            };
            match result {
                Ok(rtt) => {
                    failures.remove(&peer);
                    trace!(peer = %peer.short(), rtt_ms = rtt.as_millis() as u64, "keepalive ping");
                }
                Err(e) => {
                    let count = failures.entry(peer).or_insert(0);
                    *count += 1;
                    debug!(peer = %peer.short(), failures = *count, error = %e, "keepalive ping failed");
                    if *count >= config.max_failures {
                        debug!(peer = %peer.short(), "closing unresponsive connection");
                        connection.close();
                        failures.remove(&peer);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PeerAddress;
    use crate::connection::{ConnectionConfig, PeerEvent, ProtocolRouter};
    use crate::identity::Keypair;
    use crate::mux::MuxConfig;
    use crate::transport::{MemoryHub, MemoryTransport, Transports};
    use tokio::time::timeout;

    fn manager(hub: &MemoryHub, router: ProtocolRouter) -> ConnectionManager {
        ConnectionManager::spawn(
            Keypair::generate(),
            Transports::new().with(MemoryTransport::with_hub(hub.clone())),
            ConnectionConfig::default(),
            MuxConfig::default(),
            router,
        )
    }

    #[tokio::test]
    async fn ping_measures_round_trip() {
        let hub = MemoryHub::default();
        let mut router = ProtocolRouter::default();
        let inbound = router.register_protocol(PING_PROTOCOL);
        let server = manager(&hub, router);
        tokio::spawn(serve_ping(inbound));
        let addr = server.listen(PeerAddress::memory(0)).await.unwrap();

        let client = manager(&hub, ProtocolRouter::default());
        let connection = client.dial_address(addr).await.unwrap();
        for _ in 0..3 {
            let rtt = ping(&connection, Duration::from_secs(5)).await.unwrap();
            assert!(rtt < Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn ping_without_handler_is_unsupported() {
        let hub = MemoryHub::default();
        let server = manager(&hub, ProtocolRouter::default());
        let addr = server.listen(PeerAddress::memory(0)).await.unwrap();

        let client = manager(&hub, ProtocolRouter::default());
        let connection = client.dial_address(addr).await.unwrap();
        assert!(matches!(
            ping(&connection, Duration::from_secs(5)).await,
            Err(NetworkError::ProtocolNotSupported(_))
        ));
    }

    #[tokio::test]
    async fn keepalive_closes_silent_connection() {
        let hub = MemoryHub::default();
        let mut router = ProtocolRouter::default();
        // Accepted but never answered.
        let _silent = router.register_protocol(PING_PROTOCOL);
        let server = manager(&hub, router);
        let addr = server.listen(PeerAddress::memory(0)).await.unwrap();

        let client = manager(&hub, ProtocolRouter::default());
        let mut events = client.events();
        client.dial_address(addr).await.unwrap();

        tokio::spawn(keepalive(
            client.clone(),
            PingConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(50),
                max_failures: 2,
            },
        ));

        let disconnected = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::Disconnected { peer, .. }) => return peer,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {:?}", e),
                }
            }
        })
        .await
        .expect("connection was not closed");
        assert_eq!(disconnected, server.local_peer());
        assert!(client.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn keepalive_keeps_healthy_connection() {
        let hub = MemoryHub::default();
        let mut router = ProtocolRouter::default();
        let inbound = router.register_protocol(PING_PROTOCOL);
        let server = manager(&hub, router);
        tokio::spawn(serve_ping(inbound));
        let addr = server.listen(PeerAddress::memory(0)).await.unwrap();

        let client = manager(&hub, ProtocolRouter::default());
        client.dial_address(addr).await.unwrap();
        tokio::spawn(keepalive(
            client.clone(),
            PingConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(2),
                max_failures: 1,
            },
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.connected_peers().await, vec![server.local_peer()]);
    }
}
