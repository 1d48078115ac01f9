//! Message-oriented AEAD cipher with optional implicit nonces.
//!
//! In stateless mode every ciphertext carries its own random nonce. In
//! implicit-nonce mode the nonce travels only with the first message of a
//! direction; every later message uses the previous nonce plus one. That
//! saves 12 bytes per frame but requires strict in-order processing: one
//! lost, skipped or reordered message desynchronises the direction for good.

use crate::crypto::{Aead, AeadKey, CipherKind, Nonce, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// AEAD cipher state for one direction of a connection.
///
/// Methods take `&mut self`; the owner serialises access (the framed
/// connection keeps each direction behind its own lock). `Clone` forks the
/// state, including an independent copy of the implicit nonce.
#[derive(Clone)]
pub struct BlockCipher {
    aead: Aead,
    implicit_nonce_mode: bool,
    implicit_nonce: Option<Nonce>,
}

impl BlockCipher {
    /// Create a cipher in implicit-nonce mode.
    pub fn new(kind: CipherKind, key: &AeadKey) -> Self {
        Self {
            aead: Aead::new(kind, key),
            implicit_nonce_mode: true,
            implicit_nonce: None,
        }
    }

    /// Create a cipher in stateless mode.
    pub fn stateless(kind: CipherKind, key: &AeadKey) -> Self {
        let mut cipher = Self::new(kind, key);
        cipher.set_implicit_nonce_mode(false);
        cipher
    }

    /// Nonce size in bytes.
    pub fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    /// Authentication tag overhead in bytes.
    pub fn overhead(&self) -> usize {
        TAG_SIZE
    }

    /// Number of nonce bytes the next `encrypt`/`decrypt` adds or expects.
    pub fn nonce_overhead(&self) -> usize {
        if self.implicit_nonce_mode && self.implicit_nonce.is_some() {
            0
        } else {
            NONCE_SIZE
        }
    }

    /// Enable or disable implicit-nonce mode.
    ///
    /// Disabling drops any established implicit nonce.
    pub fn set_implicit_nonce_mode(&mut self, enable: bool) {
        self.implicit_nonce_mode = enable;
        if !enable {
            self.implicit_nonce = None;
        }
    }

    /// True if `encrypt`/`decrypt` may be called in any order.
    pub fn is_stateless(&self) -> bool {
        !self.implicit_nonce_mode
    }

    /// Encrypt a message.
    ///
    /// Output is `nonce || ciphertext || tag` when a nonce has to be sent,
    /// otherwise `ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, send_nonce) = if self.implicit_nonce_mode {
            match self.implicit_nonce.as_mut() {
                Some(nonce) => {
                    nonce.increment();
                    (*nonce, false)
                }
                None => {
                    let nonce = Nonce::random();
                    self.implicit_nonce = Some(nonce);
                    (nonce, true)
                }
            }
        } else {
            (Nonce::random(), true)
        };

        let sealed = self.aead.encrypt(&nonce, plaintext, b"")?;
        if !send_nonce {
            return Ok(sealed);
        }
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a message produced by the peer's `encrypt`.
    ///
    /// In implicit-nonce mode the nonce is advanced even when
    /// authentication fails; the direction is unusable afterwards.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, body) = if self.implicit_nonce_mode {
            match self.implicit_nonce.as_mut() {
                Some(nonce) => {
                    nonce.increment();
                    (*nonce, ciphertext)
                }
                None => {
                    let (nonce, body) = split_nonce(ciphertext)?;
                    self.implicit_nonce = Some(nonce);
                    (nonce, body)
                }
            }
        } else {
            split_nonce(ciphertext)?
        };

        self.aead.decrypt(&nonce, body, b"")
    }
}

fn split_nonce(data: &[u8]) -> Result<(Nonce, &[u8])> {
    if data.len() < NONCE_SIZE {
        return Err(Error::DecryptFailed);
    }
    let (head, body) = data.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(head);
    Ok((Nonce::from_bytes(nonce), body))
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("kind", &self.aead.kind())
            .field("implicit_nonce_mode", &self.implicit_nonce_mode)
            .field("nonce_established", &self.implicit_nonce.is_some())
            .finish()
    }
}
