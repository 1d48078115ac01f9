//! # veil
//!
//! Authenticated, traffic-shaped handshake and framed secure connection for
//! disguised proxy tunnels.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Upper layers (multiplexers, proxy adapters)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  SecureConn (padded frames, random chunking, AEAD)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake (full: X25519 + ed25519, fast: token + PSK)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto (X25519, ed25519, ChaCha20/AES-GCM, HKDF)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use veil::{HandshakeClient, TunnelConfig};
//!
//! # async fn run() -> veil::Result<()> {
//! let config = TunnelConfig::from_file("client.toml")?;
//! let client = HandshakeClient::new(
//!     Arc::new(config.identity()?),
//!     Arc::new(config.token_pool()),
//!     config.handshake_config(),
//! );
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//! let conn = client.connect(stream).await?;
//! conn.write(b"ping").await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod conn;
pub mod crypto;
pub mod error;
pub mod handshake;

pub use config::TunnelConfig;
pub use conn::SecureConn;
pub use crypto::{CipherKind, Identity};
pub use error::{Error, Result};
pub use handshake::{
    Established, HandshakeClient, HandshakeConfig, HandshakeKind, HandshakeMethod, HandshakeMode,
    HandshakeServer, SessionId, Token, TokenPool,
};
