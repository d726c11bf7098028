//! # Cryptographic Helpers
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Session keys**: BLAKE3 key derivation for the secure channel
//!
//! Identity is the 32-byte Ed25519 public key, so verifying a signature only
//! needs the claimed [`PeerId`]. Every signed structure uses its own domain
//! prefix so a signature produced for one protocol never verifies in another.

use ed25519_dalek::{Signature, VerifyingKey};
use zeroize::Zeroizing;

use crate::identity::{Keypair, PeerId};

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Prefix for gossip message signatures (strict validation mode).
pub const GOSSIPSUB_SIGNATURE_DOMAIN: &[u8] = b"murmur-gossipsub-v1:";

/// Prefix for the handshake transcript signature.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"murmur-handshake-v1:";

const INITIATOR_KEY_CONTEXT: &str = "murmur secure 1.0.0 initiator to responder";
const RESPONDER_KEY_CONTEXT: &str = "murmur secure 1.0.0 responder to initiator";
const BINDING_CONTEXT: &str = "murmur secure 1.0.0 channel binding";

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`] for `signer`.
pub fn verify_with_domain(
    signer: &PeerId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::try_from(signer.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Session Key Derivation
// ============================================================================

/// Directional keys for one side of a secure channel.
///
/// `send` on the initiator equals `recv` on the responder and vice versa.
/// `binding` is identical on both ends and lets upper layers tie data to this
/// exact session.
pub struct SessionKeys {
    pub send: Zeroizing<[u8; 32]>,
    pub recv: Zeroizing<[u8; 32]>,
    pub binding: [u8; 32],
}

pub fn derive_session_keys(shared: &[u8; 32], transcript: &[u8; 32], initiator: bool) -> SessionKeys {
    let mut material = Zeroizing::new([0u8; 64]);
    material[..32].copy_from_slice(shared);
    material[32..].copy_from_slice(transcript);

    let i2r = Zeroizing::new(blake3::derive_key(INITIATOR_KEY_CONTEXT, material.as_slice()));
    let r2i = Zeroizing::new(blake3::derive_key(RESPONDER_KEY_CONTEXT, material.as_slice()));
    let binding = blake3::derive_key(BINDING_CONTEXT, material.as_slice());

    if initiator {
        SessionKeys { send: i2r, recv: r2i, binding }
    } else {
        SessionKeys { send: r2i, recv: i2r, binding }
    }
}

/// Hash of both hellos in initiator-then-responder order.
pub fn transcript_hash(initiator_hello: &[u8], responder_hello: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(initiator_hello.len() as u32).to_be_bytes());
    hasher.update(initiator_hello);
    hasher.update(&(responder_hello.len() as u32).to_be_bytes());
    hasher.update(responder_hello);
    *hasher.finalize().as_bytes()
}
