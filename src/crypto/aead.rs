//! Authenticated Encryption with Associated Data (AEAD).
//!
//! ChaCha20-Poly1305 is the default cipher: fast in software and
//! constant-time. AES-256-GCM is available for deployments that pin it.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// AEAD algorithm selection. Both ends of a tunnel must agree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 (RFC 8439)
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// AES-256 in Galois/Counter Mode
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// A nonce (number used once) for AEAD operations.
///
/// Must be unique for each encryption with the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a 64-bit counter value.
    ///
    /// The counter occupies the first 8 bytes (little-endian), so it lines
    /// up with [`Nonce::increment`].
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Self(nonce)
    }

    /// Create a fresh random nonce.
    pub fn random() -> Self {
        Self(crate::crypto::SecureRandom::bytes())
    }

    /// Create a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Increment the whole nonce by one, little-endian with byte-wise carry.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

#[derive(Clone)]
enum Inner {
    ChaCha(ChaCha20Poly1305),
    AesGcm(Aes256Gcm),
}

/// Stateless AEAD primitive over a selected [`CipherKind`].
#[derive(Clone)]
pub struct Aead {
    kind: CipherKind,
    inner: Inner,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(kind: CipherKind, key: &AeadKey) -> Self {
        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => {
                Inner::ChaCha(ChaCha20Poly1305::new(key.as_bytes().into()))
            }
            CipherKind::Aes256Gcm => Inner::AesGcm(Aes256Gcm::new(key.as_bytes().into())),
        };
        Self { kind, inner }
    }

    /// Which algorithm this instance runs.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let sealed = match &self.inner {
            Inner::ChaCha(c) => c.encrypt(nonce.as_bytes().into(), payload),
            Inner::AesGcm(c) => c.encrypt(nonce.as_bytes().into(), payload),
        };
        sealed.map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns `DecryptFailed` if authentication fails (wrong key, wrong
    /// nonce, tampered data, etc.)
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::DecryptFailed);
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let opened = match &self.inner {
            Inner::ChaCha(c) => c.decrypt(nonce.as_bytes().into(), payload),
            Inner::AesGcm(c) => c.decrypt(nonce.as_bytes().into(), payload),
        };
        opened.map_err(|_| Error::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        let mut bytes = [0u8; KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        AeadKey::from_bytes(bytes)
    }

    #[test]
    fn test_encrypt_decrypt_both_kinds() {
        for kind in [CipherKind::ChaCha20Poly1305, CipherKind::Aes256Gcm] {
            let aead = Aead::new(kind, &test_key());
            let nonce = Nonce::new(1);

            let ciphertext = aead.encrypt(&nonce, b"Hello, World!", b"context").unwrap();
            assert_eq!(ciphertext.len(), 13 + TAG_SIZE);

            let decrypted = aead.decrypt(&nonce, &ciphertext, b"context").unwrap();
            assert_eq!(decrypted, b"Hello, World!");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let aead1 = Aead::new(CipherKind::ChaCha20Poly1305, &test_key());
        let aead2 = Aead::new(
            CipherKind::ChaCha20Poly1305,
            &AeadKey::from_bytes([0x42u8; KEY_SIZE]),
        );
        let nonce = Nonce::new(1);

        let ciphertext = aead1.encrypt(&nonce, b"secret data", b"").unwrap();
        assert!(matches!(
            aead2.decrypt(&nonce, &ciphertext, b""),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_short_ciphertext_fails() {
        let aead = Aead::new(CipherKind::Aes256Gcm, &test_key());
        assert!(matches!(
            aead.decrypt(&Nonce::new(0), &[0u8; TAG_SIZE - 1], b""),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut nonce = Nonce::new(0);
        nonce.increment();
        assert_eq!(nonce, Nonce::new(1));

        let mut nonce = Nonce::from_bytes([0xff, 0xff, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        nonce.increment();
        assert_eq!(nonce.as_bytes()[..3], [0x00, 0x00, 0x01]);

        let mut nonce = Nonce::from_bytes([0xff; NONCE_SIZE]);
        nonce.increment();
        assert_eq!(nonce.as_bytes(), &[0u8; NONCE_SIZE]);
    }

    #[test]
    fn test_cipher_kind_serde_names() {
        #[derive(Deserialize)]
        struct Wrap {
            cipher: CipherKind,
        }
        let w: Wrap = toml::from_str("cipher = \"aes-256-gcm\"").unwrap();
        assert_eq!(w.cipher, CipherKind::Aes256Gcm);
        let w: Wrap = toml::from_str("cipher = \"chacha20-poly1305\"").unwrap();
        assert_eq!(w.cipher, CipherKind::ChaCha20Poly1305);
    }
}
