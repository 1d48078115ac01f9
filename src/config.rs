//! Tunnel endpoint configuration.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::{CipherKind, Identity};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeConfig, HandshakeMethod, TokenPool, DEFAULT_READ_TIMEOUT};

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

/// Configuration file format for one tunnel endpoint.
///
/// ```toml
/// private_key = "<base64 ed25519 seed or seed||public>"
/// public_key = "<base64 peer ed25519 public key>"
/// fast_handshake = true
/// cipher = "chacha20-poly1305"
/// handshake = "two-rtt"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Own ed25519 key (base64): 32-byte seed or 64-byte seed||public
    pub private_key: String,
    /// Peer's ed25519 verifying key (base64)
    pub public_key: String,
    /// Enable the resumption path
    #[serde(default)]
    pub fast_handshake: bool,
    /// Per-read handshake deadline (seconds)
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Read and discard before closing on a malformed or unauthenticated peer
    #[serde(default = "default_true")]
    pub drain_after_error: bool,
    /// AEAD for the framed connection and token sealing
    #[serde(default)]
    pub cipher: CipherKind,
    /// Handshake message family: `two-rtt` or `one-rtt`
    #[serde(default)]
    pub handshake: HandshakeMethod,
    /// Expiry for pooled resumption tokens (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ttl_secs: Option<u64>,
}

impl TunnelConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML text.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::config(format!("cannot serialize: {}", e)))
    }

    /// Generate matching client and server configurations with fresh keys.
    ///
    /// Returns `(client, server)`; each holds its own key and the other's
    /// public key.
    pub fn generate() -> (Self, Self) {
        let client_key = Identity::generate_signing_key();
        let server_key = Identity::generate_signing_key();

        let endpoint = |own: &ed25519_dalek::SigningKey, peer: &ed25519_dalek::SigningKey| Self {
            private_key: STANDARD.encode(own.to_bytes()),
            public_key: STANDARD.encode(peer.verifying_key().as_bytes()),
            fast_handshake: false,
            read_timeout_secs: default_read_timeout_secs(),
            drain_after_error: true,
            cipher: CipherKind::default(),
            handshake: HandshakeMethod::default(),
            token_ttl_secs: None,
        };

        (
            endpoint(&client_key, &server_key),
            endpoint(&server_key, &client_key),
        )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_secs == 0 {
            return Err(Error::config("read_timeout_secs must be positive"));
        }
        if self.token_ttl_secs == Some(0) {
            return Err(Error::config("token_ttl_secs must be positive when set"));
        }
        if self.fast_handshake && self.handshake == HandshakeMethod::OneRtt {
            return Err(Error::config("fast_handshake requires the two-rtt handshake"));
        }
        self.identity().map(|_| ())
    }

    /// Decode the static key material.
    pub fn identity(&self) -> Result<Identity> {
        Identity::load(&self.private_key, &self.public_key)
    }

    /// Handshake settings described by this file.
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            fast_handshake: self.fast_handshake,
            drain_after_error: self.drain_after_error,
            cipher: self.cipher,
            method: self.handshake,
        }
    }

    /// Empty token pool honouring `token_ttl_secs`.
    pub fn token_pool(&self) -> TokenPool {
        match self.token_ttl_secs {
            Some(secs) => TokenPool::with_ttl(Duration::from_secs(secs)),
            None => TokenPool::new(),
        }
    }
}
