//! # Secure Channel
//!
//! Upgrades a raw transport connection into an authenticated, encrypted duplex
//! channel bound to the remote [`PeerId`].
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!     │── Hello{proto, id_i, eph_i, addrs} ──────►│
//!     │◄────── Hello{proto, id_r, eph_r, addrs} ──│
//!     │── Auth{sig_i(domain‖transcript‖"i")} ────►│  verify
//!     │◄──────── Auth{sig_r(domain‖transcript‖"r")}│
//! verify
//! ```
//!
//! `transcript = blake3(hello_i ‖ hello_r)`. Each side signs the transcript with
//! its identity key, which proves possession of the key behind its PeerId and
//! binds the ephemeral X25519 keys to it. Traffic keys come from the X25519
//! shared secret and the transcript, one key per direction.
//!
//! ## Framing
//!
//! After the handshake every frame is `u32 BE length ‖ ChaCha20-Poly1305 ciphertext`
//! with a per-direction 64-bit counter nonce. An authentication failure or a
//! nonce counter overflow ends the channel.

use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::address::PeerAddress;
use crate::crypto::{
    derive_session_keys, sign_with_domain, transcript_hash, verify_with_domain,
    HANDSHAKE_SIGNATURE_DOMAIN,
};
use crate::error::NetworkError;
use crate::identity::{Keypair, PeerId};
use crate::messages::{deserialize_bounded, serialize};
use crate::transport::BoxedIo;

pub const SECURE_PROTOCOL: &str = "/murmur/secure/1.0.0";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a handshake message.
pub const MAX_HANDSHAKE_FRAME: usize = 64 * 1024;

/// Largest plaintext sealed into one frame; larger writes are split.
pub const MAX_FRAME_PLAINTEXT: usize = 64 * 1024;

const TAG_LEN: usize = 16;
const MAX_FRAME_CIPHERTEXT: usize = MAX_FRAME_PLAINTEXT + TAG_LEN;
const MAX_ADVERTISED_ADDRS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }

    fn other(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    protocol: String,
    peer_id: PeerId,
    ephemeral: [u8; 32],
    listen_addrs: Vec<PeerAddress>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Auth {
    signature: Vec<u8>,
}

fn failed(reason: impl Into<String>) -> NetworkError {
    NetworkError::HandshakeFailed(reason.into())
}

async fn write_handshake_frame(io: &mut BoxedIo, bytes: &[u8]) -> Result<(), NetworkError> {
    if bytes.len() > MAX_HANDSHAKE_FRAME {
        return Err(failed("handshake message too large"));
    }
    io.write_u32(bytes.len() as u32)
        .await
        .map_err(|e| failed(format!("write: {}", e)))?;
    io.write_all(bytes)
        .await
        .map_err(|e| failed(format!("write: {}", e)))?;
    io.flush().await.map_err(|e| failed(format!("flush: {}", e)))
}

async fn read_handshake_frame(io: &mut BoxedIo) -> Result<Vec<u8>, NetworkError> {
    let len = io
        .read_u32()
        .await
        .map_err(|e| failed(format!("read: {}", e)))? as usize;
    if len > MAX_HANDSHAKE_FRAME {
        return Err(failed(format!("handshake message of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)
        .await
        .map_err(|e| failed(format!("read: {}", e)))?;
    Ok(buf)
}

fn auth_payload(transcript: &[u8; 32], role: Role) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 9);
    payload.extend_from_slice(transcript);
    payload.extend_from_slice(role.label());
    payload
}

/// Result of a successful upgrade, ready to be split for concurrent use.
pub struct SecureChannel {
    reader: SecureReader,
    writer: SecureWriter,
    remote_peer: PeerId,
    remote_listen_addrs: Vec<PeerAddress>,
    channel_binding: [u8; 32],
}

impl SecureChannel {
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Addresses the remote says it listens on. Advisory.
    pub fn remote_listen_addrs(&self) -> &[PeerAddress] {
        &self.remote_listen_addrs
    }

    /// Value both ends derive identically for this session.
    pub fn channel_binding(&self) -> [u8; 32] {
        self.channel_binding
    }

    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

/// Run the handshake under `timeout`.
///
/// When `expected` is set and the remote authenticates as a different peer the
/// connection is dropped with [`NetworkError::HandshakeFailed`].
pub async fn upgrade(
    io: BoxedIo,
    keypair: &Keypair,
    role: Role,
    expected: Option<PeerId>,
    listen_addrs: &[PeerAddress],
    timeout: Duration,
) -> Result<SecureChannel, NetworkError> {
    match tokio::time::timeout(timeout, handshake(io, keypair, role, expected, listen_addrs)).await {
        Ok(result) => result,
        Err(_) => Err(failed("handshake timed out")),
    }
}

async fn handshake(
    mut io: BoxedIo,
    keypair: &Keypair,
    role: Role,
    expected: Option<PeerId>,
    listen_addrs: &[PeerAddress],
) -> Result<SecureChannel, NetworkError> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = PublicKey::from(&secret);

    let local_hello = Hello {
        protocol: SECURE_PROTOCOL.to_string(),
        peer_id: keypair.peer_id(),
        ephemeral: ephemeral.to_bytes(),
        listen_addrs: listen_addrs.iter().take(MAX_ADVERTISED_ADDRS).cloned().collect(),
    };
    let local_bytes = serialize(&local_hello).map_err(|e| failed(format!("encode hello: {}", e)))?;

    let remote_bytes = match role {
        Role::Initiator => {
            write_handshake_frame(&mut io, &local_bytes).await?;
            read_handshake_frame(&mut io).await?
        }
        Role::Responder => {
            let remote = read_handshake_frame(&mut io).await?;
            write_handshake_frame(&mut io, &local_bytes).await?;
            remote
        }
    };
    let remote_hello: Hello =
        deserialize_bounded(&remote_bytes).map_err(|e| failed(format!("decode hello: {}", e)))?;

    if remote_hello.protocol != SECURE_PROTOCOL {
        return Err(failed(format!("unsupported protocol {}", remote_hello.protocol)));
    }
    let remote_peer = remote_hello.peer_id;
    if !remote_peer.is_valid() {
        return Err(failed("remote peer id is not a valid public key"));
    }
    if remote_peer == keypair.peer_id() {
        return Err(failed("connected to self"));
    }
    if let Some(expected) = expected {
        if expected != remote_peer {
            debug!(
                expected = %expected.short(),
                actual = %remote_peer.short(),
                "remote identity mismatch"
            );
            return Err(failed("remote identity does not match the dialed peer"));
        }
    }

    let transcript = match role {
        Role::Initiator => transcript_hash(&local_bytes, &remote_bytes),
        Role::Responder => transcript_hash(&remote_bytes, &local_bytes),
    };

    let local_auth = Auth {
        signature: sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &auth_payload(&transcript, role)),
    };
    let local_auth_bytes = serialize(&local_auth).map_err(|e| failed(format!("encode auth: {}", e)))?;

    let remote_auth_bytes = match role {
        Role::Initiator => {
            write_handshake_frame(&mut io, &local_auth_bytes).await?;
            read_handshake_frame(&mut io).await?
        }
        Role::Responder => {
            let remote = read_handshake_frame(&mut io).await?;
            verify_auth(&remote_peer, &remote, &transcript, role.other())?;
            write_handshake_frame(&mut io, &local_auth_bytes).await?;
            remote
        }
    };
    if role == Role::Initiator {
        verify_auth(&remote_peer, &remote_auth_bytes, &transcript, role.other())?;
    }

    let shared = secret.diffie_hellman(&PublicKey::from(remote_hello.ephemeral));
    if !shared.was_contributory() {
        return Err(failed("non-contributory key exchange"));
    }
    let keys = derive_session_keys(shared.as_bytes(), &transcript, role == Role::Initiator);

    let send_cipher = ChaCha20Poly1305::new_from_slice(keys.send.as_slice())
        .map_err(|_| failed("invalid send key"))?;
    let recv_cipher = ChaCha20Poly1305::new_from_slice(keys.recv.as_slice())
        .map_err(|_| failed("invalid receive key"))?;

    trace!(peer = %remote_peer.short(), ?role, "secure channel established");

    let (rd, wr) = tokio::io::split(io);
    Ok(SecureChannel {
        reader: SecureReader { io: rd, cipher: recv_cipher, counter: 0 },
        writer: SecureWriter { io: wr, cipher: send_cipher, counter: 0 },
        remote_peer,
        remote_listen_addrs: remote_hello
            .listen_addrs
            .into_iter()
            .take(MAX_ADVERTISED_ADDRS)
            .collect(),
        channel_binding: keys.binding,
    })
}

fn verify_auth(
    remote: &PeerId,
    bytes: &[u8],
    transcript: &[u8; 32],
    remote_role: Role,
) -> Result<(), NetworkError> {
    let auth: Auth = deserialize_bounded(bytes).map_err(|e| failed(format!("decode auth: {}", e)))?;
    verify_with_domain(
        remote,
        HANDSHAKE_SIGNATURE_DOMAIN,
        &auth_payload(transcript, remote_role),
        &auth.signature,
    )
    .map_err(|e| failed(format!("transcript signature: {}", e)))
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&nonce)
}

pub struct SecureReader {
    io: ReadHalf<BoxedIo>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SecureReader {
    /// Next decrypted frame. Any failure means the channel is unusable.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, NetworkError> {
        let len = self
            .io
            .read_u32()
            .await
            .map_err(|_| NetworkError::ConnectionClosed)? as usize;
        if len < TAG_LEN || len > MAX_FRAME_CIPHERTEXT {
            debug!(len, "secure frame length out of range");
            return Err(NetworkError::ConnectionClosed);
        }
        let mut ciphertext = vec![0u8; len];
        self.io
            .read_exact(&mut ciphertext)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;

        if self.counter == u64::MAX {
            return Err(NetworkError::ConnectionClosed);
        }
        let nonce = nonce_for(self.counter);
        self.counter += 1;
        self.cipher
            .decrypt(&nonce, ciphertext.as_slice())
            .map_err(|_| {
                debug!("secure frame failed authentication");
                NetworkError::ConnectionClosed
            })
    }
}

pub struct SecureWriter {
    io: WriteHalf<BoxedIo>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SecureWriter {
    /// Encrypt and send `data`, split across frames when larger than one frame.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        for chunk in data.chunks(MAX_FRAME_PLAINTEXT) {
            if self.counter == u64::MAX {
                return Err(NetworkError::ConnectionClosed);
            }
            let nonce = nonce_for(self.counter);
            self.counter += 1;
            let ciphertext = self
                .cipher
                .encrypt(&nonce, chunk)
                .map_err(|_| NetworkError::ConnectionClosed)?;
            self.io
                .write_u32(ciphertext.len() as u32)
                .await
                .map_err(|_| NetworkError::ConnectionClosed)?;
            self.io
                .write_all(&ciphertext)
                .await
                .map_err(|_| NetworkError::ConnectionClosed)?;
        }
        self.io.flush().await.map_err(|_| NetworkError::ConnectionClosed)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}
