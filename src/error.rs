//! Error types for the veil handshake and secure connection.

use thiserror::Error;

/// Result type alias for veil operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or using a secure connection.
///
/// `ProtocolViolation` and `AuthenticationFailed` carry no detail; the
/// failing check is only logged, never surfaced to a peer.
#[derive(Error, Debug)]
pub enum Error {
    /// Static key material is missing or malformed
    #[error("invalid key material: {0}")]
    KeyFormat(String),

    /// Peer offered a low-order or otherwise degenerate X25519 public key
    #[error("invalid peer public key")]
    InvalidPeerKey,

    /// A handshake read exceeded its deadline
    #[error("handshake timeout after {0}ms")]
    Timeout(u64),

    /// A length field or flag was outside the accepted range
    #[error("protocol violation")]
    ProtocolViolation,

    /// A signature, binder or confirmation tag did not verify
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Resumption referenced an unknown or already consumed token
    #[error("resumption token not found")]
    TokenNotFound,

    /// AEAD tag verification failed on a framed read
    #[error("decryption failed")]
    DecryptFailed,

    /// The connection was closed or is no longer usable
    #[error("connection closed")]
    ConnectionClosed,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cryptographic primitive failure
    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new key format error
    pub fn key_format(msg: impl Into<String>) -> Self {
        Error::KeyFormat(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if the caller may recover by redialing.
    ///
    /// A `TokenNotFound` client falls back to a full handshake; a `Timeout`
    /// may be retried under the caller's own policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TokenNotFound | Error::Timeout(_))
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthenticationFailed)
    }

    /// Map an I/O error, treating an unexpected EOF as a closed connection.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Network(err),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err {
            Error::Network(io) => return io,
            Error::ConnectionClosed => ErrorKind::NotConnected,
            Error::Timeout(_) => ErrorKind::TimedOut,
            Error::DecryptFailed | Error::ProtocolViolation | Error::AuthenticationFailed => {
                ErrorKind::InvalidData
            }
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
