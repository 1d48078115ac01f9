//! Static identity and ephemeral key exchange primitives.
//!
//! Provides type-safe wrappers around ed25519 signing and X25519 key
//! agreement with automatic zeroization of secret material on drop.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublic, SharedSecret as DalekShared};
use zeroize::Zeroizing;

use crate::crypto::{PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::error::{Error, Result};

/// Long-lived signing identity of one proxy endpoint.
///
/// Holds our ed25519 signing key and the verifying key we expect the peer
/// to sign with. Immutable after load; share it behind an `Arc`.
pub struct Identity {
    signing_key: SigningKey,
    peer_key: VerifyingKey,
}

impl Identity {
    /// Build an identity from an own signing key and the peer's verifying key.
    pub fn new(signing_key: SigningKey, peer_key: VerifyingKey) -> Self {
        Self {
            signing_key,
            peer_key,
        }
    }

    /// Build an identity where both endpoints share one key pair.
    pub fn shared(signing_key: SigningKey) -> Self {
        let peer_key = signing_key.verifying_key();
        Self::new(signing_key, peer_key)
    }

    /// Load an identity from base64 key material.
    ///
    /// `private_b64` is either a 32-byte seed or a 64-byte `seed || public`
    /// key pair. `public_b64` is the peer's 32-byte verifying key.
    pub fn load(private_b64: &str, public_b64: &str) -> Result<Self> {
        if private_b64.trim().is_empty() {
            return Err(Error::key_format("private key is empty"));
        }
        if public_b64.trim().is_empty() {
            return Err(Error::key_format("public key is empty"));
        }

        let private = Zeroizing::new(
            STANDARD
                .decode(private_b64.trim())
                .map_err(|e| Error::key_format(format!("private key is not base64: {}", e)))?,
        );
        let signing_key = match private.len() {
            32 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&private);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut pair = Zeroizing::new([0u8; 64]);
                pair.copy_from_slice(&private);
                SigningKey::from_keypair_bytes(&pair)
                    .map_err(|_| Error::key_format("private key pair halves do not match"))?
            }
            n => {
                return Err(Error::key_format(format!(
                    "private key must be 32 or 64 bytes, got {}",
                    n
                )))
            }
        };

        let public = STANDARD
            .decode(public_b64.trim())
            .map_err(|e| Error::key_format(format!("public key is not base64: {}", e)))?;
        let public: [u8; PUBLIC_KEY_SIZE] = public
            .try_into()
            .map_err(|_| Error::key_format("public key must be 32 bytes"))?;
        let peer_key = VerifyingKey::from_bytes(&public)
            .map_err(|_| Error::key_format("public key is not a valid ed25519 point"))?;

        Ok(Self::new(signing_key, peer_key))
    }

    /// Generate a fresh random signing key.
    pub fn generate_signing_key() -> SigningKey {
        SigningKey::generate(&mut rand_core::OsRng)
    }

    /// Our own verifying key.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The verifying key expected from the peer.
    pub fn peer_key(&self) -> &VerifyingKey {
        &self.peer_key
    }

    /// Sign a message with our static key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a peer signature, failing with `AuthenticationFailed`.
    pub fn verify_peer(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<()> {
        let signature = Signature::from_bytes(signature);
        self.peer_key
            .verify_strict(message, &signature)
            .map_err(|_| Error::AuthenticationFailed)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .field("peer_key", &hex::encode(self.peer_key.as_bytes()))
            .finish()
    }
}

/// An X25519 public key.
///
/// Safe to share publicly. Used for key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(DalekPublic);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(DalekPublic::from(bytes))
    }

    /// Get the raw bytes of this public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// A single-use X25519 key pair.
///
/// Generated fresh for each handshake attempt and consumed by the
/// Diffie-Hellman step, which gives forward secrecy. The private scalar is
/// clamped by x25519-dalek and zeroized on drop.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey(DalekPublic::from(&secret));
        Self { secret, public }
    }

    /// The public half, sent to the peer.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Perform X25519 key agreement, consuming the private half.
    ///
    /// Fails with `InvalidPeerKey` when the peer key is a low-order point,
    /// which would force an all-zero shared secret.
    pub fn derive_shared_secret(self, peer: &PublicKey) -> Result<SharedSecret> {
        let shared = self.secret.diffie_hellman(&peer.0);
        if !shared.was_contributory() {
            return Err(Error::InvalidPeerKey);
        }
        Ok(SharedSecret(shared))
    }
}

/// The result of an X25519 Diffie-Hellman key exchange.
///
/// Automatically zeroized when dropped.
pub struct SharedSecret(DalekShared);

impl SharedSecret {
    /// Get the raw shared secret bytes.
    ///
    /// # Security
    ///
    /// This should be fed into a KDF (like HKDF) before use as a key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}
