//! Key Derivation Functions.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256 to derive
//! per-direction traffic keys from a handshake secret, and HMAC-SHA256 for
//! the resumption binder and confirmation tags.

use hkdf::Hkdf as HkdfImpl;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::transcript::{Transcript, TranscriptHash};
use crate::crypto::{AeadKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Salt for the traffic key schedule
const SESSION_SALT: &[u8] = b"veil/v1";
const PSK_INFO: &[u8] = b"veil resumption psk";
const FAST_SECRET_INFO: &[u8] = b"veil fast secret";

/// Size of an HMAC-SHA256 tag
pub const MAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// HKDF key derivation using SHA-256.
pub struct Hkdf {
    prk: HkdfImpl<Sha256>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt
    /// * `ikm` - Input keying material (e.g., shared secret from DH)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        Ok(okm)
    }
}

/// Traffic keys derived from a handshake secret and transcript hash.
///
/// Contains separate keys for client-to-server and server-to-client
/// directions plus the key the server seals resumption tokens under.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    client_key: [u8; KEY_SIZE],
    server_key: [u8; KEY_SIZE],
    token_key: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive session keys from a handshake secret.
    ///
    /// The transcript hash is mixed into every label so keys are bound to
    /// the exact exchange.
    pub fn derive(secret: &[u8; KEY_SIZE], transcript: &TranscriptHash) -> Result<Self> {
        let hkdf = Hkdf::new(Some(SESSION_SALT), secret);
        let info = |label: &[u8]| [label, transcript.as_bytes().as_slice()].concat();

        Ok(Self {
            client_key: hkdf.expand_fixed(&info(b"client key"))?,
            server_key: hkdf.expand_fixed(&info(b"server key"))?,
            token_key: hkdf.expand_fixed(&info(b"token key"))?,
        })
    }

    /// Get the client-to-server encryption key.
    pub fn client_key(&self) -> AeadKey {
        AeadKey::from_bytes(self.client_key)
    }

    /// Get the server-to-client encryption key.
    pub fn server_key(&self) -> AeadKey {
        AeadKey::from_bytes(self.server_key)
    }

    /// Get the resumption token sealing key.
    pub fn token_key(&self) -> AeadKey {
        AeadKey::from_bytes(self.token_key)
    }
}

/// Pre-shared key derived from a resumption token.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ResumptionPsk([u8; KEY_SIZE]);

impl ResumptionPsk {
    /// Derive the PSK from raw token contents.
    pub fn from_token(token: &[u8]) -> Result<Self> {
        Ok(Self(Hkdf::new(None, token).expand_fixed(PSK_INFO)?))
    }

    /// Binder proving possession of the token, tied to the fast hello.
    pub fn binder(&self, session_id: &[u8], eph_public: &[u8], entropy: &[u8]) -> [u8; MAC_SIZE] {
        let mut transcript = Transcript::new();
        transcript
            .append(session_id)
            .append(eph_public)
            .append(entropy);
        hmac_sha256(&self.0, transcript.finish().as_bytes())
    }

    /// Server confirmation tag over the transcript hash.
    pub fn confirm(&self, transcript: &TranscriptHash) -> [u8; MAC_SIZE] {
        hmac_sha256(&self.0, transcript.as_bytes())
    }

    /// Mix a fresh Diffie-Hellman result with the PSK.
    pub fn fast_secret(&self, dh: &[u8]) -> Result<[u8; KEY_SIZE]> {
        Hkdf::new(Some(self.0.as_slice()), dh).expand_fixed(FAST_SECRET_INFO)
    }
}

/// Compute HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time tag comparison.
pub fn verify_mac(expected: &[u8; MAC_SIZE], received: &[u8]) -> Result<()> {
    if received.len() != MAC_SIZE {
        return Err(Error::AuthenticationFailed);
    }
    let diff = expected
        .iter()
        .zip(received.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic() {
        let a = Hkdf::new(Some(b"salt".as_slice()), b"ikm").expand_fixed::<32>(b"info").unwrap();
        let b = Hkdf::new(Some(b"salt".as_slice()), b"ikm").expand_fixed::<32>(b"info").unwrap();
        let c = Hkdf::new(Some(b"salt".as_slice()), b"ikm").expand_fixed::<32>(b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_session_keys_distinct_and_bound_to_transcript() {
        let secret = [7u8; KEY_SIZE];
        let h1 = TranscriptHash::of(&[b"one".as_slice()]);
        let h2 = TranscriptHash::of(&[b"two".as_slice()]);

        let k1 = SessionKeys::derive(&secret, &h1).unwrap();
        let k1b = SessionKeys::derive(&secret, &h1).unwrap();
        let k2 = SessionKeys::derive(&secret, &h2).unwrap();

        assert_eq!(k1.client_key(), k1b.client_key());
        assert_ne!(k1.client_key(), k1.server_key());
        assert_ne!(k1.server_key(), k1.token_key());
        assert_ne!(k1.client_key(), k2.client_key());
    }

    #[test]
    fn test_binder_depends_on_every_field() {
        let psk = ResumptionPsk::from_token(&[1u8; 48]).unwrap();
        let base = psk.binder(b"sid0", &[2u8; 32], b"entropy");
        assert_ne!(base, psk.binder(b"sid1", &[2u8; 32], b"entropy"));
        assert_ne!(base, psk.binder(b"sid0", &[3u8; 32], b"entropy"));
        assert_ne!(base, psk.binder(b"sid0", &[2u8; 32], b"entropz"));

        let other = ResumptionPsk::from_token(&[9u8; 48]).unwrap();
        assert_ne!(base, other.binder(b"sid0", &[2u8; 32], b"entropy"));
    }

    #[test]
    fn test_verify_mac() {
        let tag = hmac_sha256(b"key", b"data");
        assert!(verify_mac(&tag, &tag).is_ok());

        let mut bad = tag;
        bad[31] ^= 1;
        assert!(matches!(verify_mac(&tag, &bad), Err(Error::AuthenticationFailed)));
        assert!(verify_mac(&tag, &tag[..16]).is_err());
    }
}
