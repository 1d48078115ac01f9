//! Cryptographic primitives for veil.
//!
//! This module provides:
//! - ed25519 static identities and X25519 ephemeral key exchange
//! - ChaCha20-Poly1305 / AES-256-GCM AEAD and the framed block cipher
//! - HKDF key schedule and HMAC resumption tags
//! - Length-prefixed transcript hashing
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
mod block;
pub mod kdf;
mod keys;
pub mod random;
pub mod transcript;

pub use aead::{Aead, AeadKey, CipherKind, Nonce};
pub use block::BlockCipher;
pub use kdf::{Hkdf, ResumptionPsk, SessionKeys};
pub use keys::{EphemeralKeyPair, Identity, PublicKey, SharedSecret};
pub use random::SecureRandom;
pub use transcript::{Transcript, TranscriptHash};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of X25519 and ed25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;
