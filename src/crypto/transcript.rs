//! Length-prefixed SHA-256 transcript hashing.
//!
//! Each item is absorbed as `len(u32 BE) || bytes`, so no two different
//! item sequences can produce the same hash input.

use sha2::{Digest, Sha256};

/// Size of a transcript hash in bytes
pub const HASH_SIZE: usize = 32;

/// Incremental transcript builder.
#[derive(Clone, Default)]
pub struct Transcript {
    hasher: Sha256,
}

impl Transcript {
    /// Start an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one length-prefixed item.
    pub fn append(&mut self, item: &[u8]) -> &mut Self {
        self.hasher.update((item.len() as u32).to_be_bytes());
        self.hasher.update(item);
        self
    }

    /// Finish and return the digest.
    pub fn finish(self) -> TranscriptHash {
        TranscriptHash(self.hasher.finalize().into())
    }
}

/// SHA-256 digest committing both parties to one exchange.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TranscriptHash([u8; HASH_SIZE]);

impl TranscriptHash {
    /// Hash a fixed sequence of items.
    pub fn of(items: &[&[u8]]) -> Self {
        let mut transcript = Transcript::new();
        for item in items {
            transcript.append(item);
        }
        transcript.finish()
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for TranscriptHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TranscriptHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TranscriptHash({})", hex::encode(&self.0[..8]))
    }
}
