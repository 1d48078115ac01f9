//! Authenticated key exchange producing a [`SecureConn`].
//!
//! Two paths share one message family:
//!
//! - **Full**: ephemeral X25519 exchange, then both sides sign the
//!   transcript hash with their static ed25519 keys. The server's final
//!   message carries a sealed resumption token.
//! - **Fast**: the client presents a token from an earlier full handshake
//!   plus an HMAC binder. The server answers in a single flight; trust is
//!   inherited from the token instead of re-proven by signatures.
//!
//! - **One-RTT**: an alternative family disguised as an HTTP upload and
//!   its response, selected by [`HandshakeMethod::OneRtt`]. Both sides
//!   still sign the transcript; there is no resumption.
//!
//! Every blocking read is bounded by [`HandshakeConfig::read_timeout`].
//! Malformed input and failed authentication can trigger a randomized
//! read-and-discard before the stream is dropped so that a scanning peer cannot
//! tell which check failed.

mod client;
pub mod message;
mod one_rtt;
mod server;
pub mod token;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;
use zeroize::Zeroizing;

use crate::conn::SecureConn;
use crate::crypto::random::random_delay_ms;
use crate::crypto::{BlockCipher, CipherKind, SecureRandom, SessionKeys, TranscriptHash, KEY_SIZE};
use crate::error::{Error, Result};

pub use client::HandshakeClient;
pub use server::HandshakeServer;
pub use token::{Token, TokenId, TokenPool};

/// Minimum entropy and padding length in a hello
pub const MIN_PADDING_LEN: usize = 128;

/// Exclusive upper bound for entropy and padding length in a hello
pub const MAX_PADDING_LEN: usize = 255;

/// Size of a session identifier
pub const SESSION_ID_SIZE: usize = 4;

/// Default deadline for each handshake read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const HEADER_SIZE: usize = 4;

/// Largest `2 * padding + entropy` a hello header may claim
pub(crate) const MAX_HELLO_PADDING: usize = 3 * MAX_PADDING_LEN;

/// Header flag marking a signed fast-path rejection
pub(crate) const REJECT_FLAG: u8 = 255;

/// 4-byte identifier correlating physical connections to a logical session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Pick a fresh random session id.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Message family spoken during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeMethod {
    /// Hello exchange then a signature round; supports resumption
    #[default]
    TwoRtt,
    /// HTTP-disguised exchange finished in one round trip
    OneRtt,
}

/// Handshake tunables.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for every individual handshake read
    pub read_timeout: Duration,
    /// Issue and accept resumption tokens
    pub fast_handshake: bool,
    /// Read and discard for a while before closing on a malformed or unauthenticated peer
    pub drain_after_error: bool,
    /// AEAD used for the framed connection and token sealing
    pub cipher: CipherKind,
    /// Message family both ends must agree on
    pub method: HandshakeMethod,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            fast_handshake: false,
            drain_after_error: true,
            cipher: CipherKind::default(),
            method: HandshakeMethod::default(),
        }
    }
}

/// Which path a client attempts.
#[derive(Debug, Clone)]
pub enum HandshakeMode {
    /// Two-round exchange with signatures
    Full {
        /// Session to open or rejoin
        session_id: SessionId,
    },
    /// One-round resumption with a previously issued token
    Fast {
        /// Token already consumed from the client pool
        token: Token,
        /// Session to open or rejoin
        session_id: SessionId,
    },
    /// HTTP-disguised single round trip with signatures
    OneRtt {
        /// Session to open or rejoin
        session_id: SessionId,
    },
}

impl HandshakeMode {
    /// Session id this attempt will carry.
    pub fn session_id(&self) -> SessionId {
        match self {
            HandshakeMode::Full { session_id }
            | HandshakeMode::Fast { session_id, .. }
            | HandshakeMode::OneRtt { session_id } => *session_id,
        }
    }
}

/// Which path produced an [`Established`] handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// Signature-authenticated exchange
    Full,
    /// Token resumption
    Fast,
    /// HTTP-disguised exchange
    OneRtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Key material agreed by one handshake, before the stream is attached.
pub(crate) struct Agreement {
    pub session_id: SessionId,
    pub transcript_hash: TranscriptHash,
    pub kind: HandshakeKind,
    pub secret: Zeroizing<[u8; KEY_SIZE]>,
    pub keys: SessionKeys,
}

/// A completed handshake, ready to become a [`SecureConn`].
pub struct Established<S> {
    stream: S,
    role: Role,
    cipher: CipherKind,
    agreement: Agreement,
}

impl<S> Established<S> {
    pub(crate) fn new(stream: S, role: Role, cipher: CipherKind, agreement: Agreement) -> Self {
        Self {
            stream,
            role,
            cipher,
            agreement,
        }
    }

    /// Session id supplied by the client.
    pub fn session_id(&self) -> SessionId {
        self.agreement.session_id
    }

    /// Hash committing both parties to this exchange.
    pub fn transcript_hash(&self) -> &TranscriptHash {
        &self.agreement.transcript_hash
    }

    /// Path that produced this handshake.
    pub fn kind(&self) -> HandshakeKind {
        self.agreement.kind
    }

    /// Handshake secret the traffic keys are derived from.
    ///
    /// # Security
    ///
    /// Secret key material. Exposed for key-agreement checks only.
    pub fn shared_secret(&self) -> &[u8; KEY_SIZE] {
        &self.agreement.secret
    }
}

impl<S> Established<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap the stream in a framed connection keyed for this side.
    pub fn into_secure_conn(self) -> SecureConn<S> {
        let keys = &self.agreement.keys;
        let (send_key, recv_key) = match self.role {
            Role::Client => (keys.client_key(), keys.server_key()),
            Role::Server => (keys.server_key(), keys.client_key()),
        };
        SecureConn::new(
            self.stream,
            self.agreement.session_id,
            BlockCipher::new(self.cipher, &send_key),
            BlockCipher::new(self.cipher, &recv_key),
        )
    }
}

impl<S> fmt::Debug for Established<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("session_id", &self.agreement.session_id)
            .field("kind", &self.agreement.kind)
            .field("role", &self.role)
            .finish()
    }
}

/// Transcript hash over both hellos and the handshake secret.
pub(crate) fn transcript_hash(
    client: &message::Hello,
    server: &message::Hello,
    secret: &[u8],
) -> TranscriptHash {
    let items: [&[u8]; 7] = [
        client.session_id.as_bytes(),
        client.eph_public.as_bytes(),
        &client.entropy,
        server.session_id.as_bytes(),
        server.eph_public.as_bytes(),
        &server.entropy,
        secret,
    ];
    TranscriptHash::of(&items)
}

/// Fill `buf` completely or fail with `Timeout` once `limit` passes.
pub(crate) async fn read_exact_timed<S>(stream: &mut S, buf: &mut [u8], limit: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    timeout(limit, stream.read_exact(buf))
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
        .map_err(Error::from_io)?;
    Ok(())
}

pub(crate) async fn send<S>(stream: &mut S, message: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(message).await.map_err(Error::from_io)?;
    stream.flush().await.map_err(Error::from_io)
}

/// Errors after which the peer is treated as hostile.
pub(crate) fn warrants_drain(err: &Error) -> bool {
    matches!(err, Error::ProtocolViolation | Error::AuthenticationFailed)
}

/// Read and discard a random amount before the caller closes the stream.
///
/// Deadline, buffer size and minimum byte count are all randomized, with
/// the deadline drawn from `[read_timeout / 5, read_timeout]`.
pub(crate) async fn drain_after_error<S>(stream: &mut S, read_timeout: Duration)
where
    S: AsyncRead + Unpin,
{
    let limit_ms = read_timeout.as_millis() as u64;
    let wait = Duration::from_millis(random_delay_ms(limit_ms / 5, limit_ms + 1));
    let mut buf = vec![0u8; 4096 << (SecureRandom::u8() % 4)];
    let min = SecureRandom::int_range(2, 1026) + SecureRandom::u8() as usize;

    let drained = timeout(wait, async {
        let mut total = 0;
        while total < min {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok::<usize, std::io::Error>(total)
    })
    .await;

    match drained {
        Ok(Ok(n)) => debug!("read {} bytes after handshake error", n),
        Ok(Err(e)) => debug!("read after handshake error failed: {}", e),
        Err(_) => debug!("read after handshake error stopped after {:?}", wait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use std::sync::Arc;

    fn identities() -> (Arc<Identity>, Arc<Identity>) {
        let client_key = Identity::generate_signing_key();
        let server_key = Identity::generate_signing_key();
        let client = Identity::new(client_key.clone(), server_key.verifying_key());
        let server = Identity::new(server_key, client_key.verifying_key());
        (Arc::new(client), Arc::new(server))
    }

    fn config(fast: bool) -> HandshakeConfig {
        HandshakeConfig {
            read_timeout: Duration::from_secs(2),
            fast_handshake: fast,
            drain_after_error: false,
            cipher: CipherKind::ChaCha20Poly1305,
            method: HandshakeMethod::TwoRtt,
        }
    }

    fn endpoints(fast: bool) -> (HandshakeClient, HandshakeServer) {
        let (client_id, server_id) = identities();
        (
            HandshakeClient::new(client_id, Arc::new(TokenPool::new()), config(fast)),
            HandshakeServer::new(server_id, Arc::new(TokenPool::new()), config(fast)),
        )
    }

    #[tokio::test]
    async fn test_full_handshake_symmetry() {
        let (client, server) = endpoints(false);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let session_id = SessionId::random();

        let (client_res, server_res) = tokio::join!(
            client.handshake(a, HandshakeMode::Full { session_id }),
            server.handshake(b)
        );
        let client_est = client_res.unwrap();
        let server_est = server_res.unwrap();

        assert_eq!(client_est.kind(), HandshakeKind::Full);
        assert_eq!(server_est.kind(), HandshakeKind::Full);
        assert_eq!(client_est.session_id(), session_id);
        assert_eq!(server_est.session_id(), session_id);
        assert_eq!(client_est.shared_secret(), server_est.shared_secret());
        assert_eq!(client_est.transcript_hash(), server_est.transcript_hash());

        // Fast path disabled: nothing is issued.
        assert!(client.tokens().is_empty());
        assert!(server.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_client_wrong_key_rejected_by_server() {
        let (_, server_id) = identities();
        // The client knows the real server key but signs with a key the server does not expect.
        let impostor = Identity::new(Identity::generate_signing_key(), server_id.public_key());
        let client = HandshakeClient::new(Arc::new(impostor), Arc::new(TokenPool::new()), config(false));
        let server = HandshakeServer::new(server_id, Arc::new(TokenPool::new()), config(false));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client_res, server_res) = tokio::join!(client.connect(a), server.handshake(b));

        assert!(matches!(server_res, Err(Error::AuthenticationFailed)));
        assert!(client_res.is_err());
    }

    #[tokio::test]
    async fn test_server_wrong_key_rejected_by_client() {
        let (client_id, _) = identities();
        let rogue_server_key = Identity::generate_signing_key();
        // The rogue server knows the client's public key but not the real server key.
        let rogue = Identity::new(rogue_server_key, client_id.public_key());
        let client = HandshakeClient::new(client_id, Arc::new(TokenPool::new()), config(false));
        let server = HandshakeServer::new(Arc::new(rogue), Arc::new(TokenPool::new()), config(false));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client_res, _server_res) = tokio::join!(client.connect(a), server.handshake(b));

        assert!(matches!(client_res, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_resumption_then_reuse_fails() {
        let (client, server) = endpoints(true);

        // Handshake A: full, issues a token to the client.
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.connect_session(a, SessionId::random()), server.handshake(b));
        c.unwrap();
        s.unwrap();
        assert_eq!(client.tokens().len(), 1);
        assert_eq!(server.tokens().len(), 1);
        let token = client.tokens().pick().unwrap();

        // Handshake B: fast, with the issued token.
        let session_id = SessionId::random();
        let mode = client.select_mode(session_id);
        assert!(matches!(mode, HandshakeMode::Fast { .. }));
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.handshake(a, mode), server.handshake(b));
        let c = c.unwrap();
        let s = s.unwrap();
        assert_eq!(c.kind(), HandshakeKind::Fast);
        assert_eq!(s.kind(), HandshakeKind::Fast);
        assert_eq!(c.shared_secret(), s.shared_secret());
        assert_eq!(c.transcript_hash(), s.transcript_hash());
        assert_eq!(c.session_id(), session_id);

        // A fresh token replaced the consumed one on both sides.
        assert_eq!(client.tokens().len(), 1);
        assert_eq!(server.tokens().len(), 1);
        assert_ne!(client.tokens().pick().unwrap(), token);

        // Presenting the consumed token again fails.
        let replay = HandshakeMode::Fast {
            token,
            session_id: SessionId::random(),
        };
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.handshake(a, replay), server.handshake(b));
        assert!(matches!(c, Err(Error::TokenNotFound)));
        assert!(matches!(s, Err(Error::TokenNotFound)));

        // A signed rejection means the server forgot our tokens.
        assert!(client.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_server_with_fast_disabled_rejects_fast_hello() {
        let (client_id, server_id) = identities();
        let client_tokens = Arc::new(TokenPool::new());
        client_tokens.add(Token::generate());
        let client = HandshakeClient::new(client_id, client_tokens.clone(), config(true));
        let server = HandshakeServer::new(server_id, Arc::new(TokenPool::new()), config(false));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.connect(a), server.handshake(b));
        assert!(matches!(c, Err(Error::TokenNotFound)));
        assert!(matches!(s, Err(Error::TokenNotFound)));
        assert!(client_tokens.is_empty());
    }

    #[tokio::test]
    async fn test_forged_binder_fails_authentication() {
        let (client, server) = endpoints(true);
        let real = Token::generate();
        server.tokens().add(real.clone());

        // Same id, different contents: the binder cannot match.
        let mut forged = real.as_bytes().to_vec();
        forged[10] ^= 0xff;
        let mode = HandshakeMode::Fast {
            token: Token::from_bytes(forged).unwrap(),
            session_id: SessionId::random(),
        };

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.handshake(a, mode), server.handshake(b));
        assert!(matches!(s, Err(Error::AuthenticationFailed)));
        assert!(c.is_err());

        // The genuine token survives a forged attempt.
        assert!(server.tokens().peek(real.id()).is_some());
    }

    #[tokio::test]
    async fn test_server_pool_bounded_by_ttl() {
        let (client_id, server_id) = identities();
        let client = HandshakeClient::new(client_id, Arc::new(TokenPool::new()), config(false));
        let server = HandshakeServer::new(
            server_id,
            Arc::new(TokenPool::with_ttl(Duration::from_millis(0))),
            config(true),
        );

        // Tokens the client never redeems must not pile up on the server.
        for _ in 0..5 {
            let (a, b) = tokio::io::duplex(64 * 1024);
            let (c, s) = tokio::join!(
                client.handshake(a, HandshakeMode::Full { session_id: SessionId::random() }),
                server.handshake(b)
            );
            c.unwrap();
            s.unwrap();
        }
        assert_eq!(server.tokens().len(), 1);
    }

    fn one_rtt_config() -> HandshakeConfig {
        HandshakeConfig {
            method: HandshakeMethod::OneRtt,
            ..config(false)
        }
    }

    #[tokio::test]
    async fn test_one_rtt_handshake_symmetry() {
        let (client_id, server_id) = identities();
        let client = HandshakeClient::new(client_id, Arc::new(TokenPool::new()), one_rtt_config());
        let server = HandshakeServer::new(server_id, Arc::new(TokenPool::new()), one_rtt_config());

        let session_id = SessionId::random();
        let mode = client.select_mode(session_id);
        assert!(matches!(mode, HandshakeMode::OneRtt { .. }));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.handshake(a, mode), server.handshake(b));
        let c = c.unwrap();
        let s = s.unwrap();
        assert_eq!(c.kind(), HandshakeKind::OneRtt);
        assert_eq!(s.kind(), HandshakeKind::OneRtt);
        assert_eq!(s.session_id(), session_id);
        assert_eq!(c.shared_secret(), s.shared_secret());
        assert_eq!(c.transcript_hash(), s.transcript_hash());

        let client_conn = c.into_secure_conn();
        let server_conn = s.into_secure_conn();
        client_conn.write(b"over http").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over http");

        assert!(client.tokens().is_empty());
        assert!(server.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_one_rtt_wrong_keys() {
        let (client_id, server_id) = identities();

        // Client signs with a key the server does not expect.
        let impostor = Identity::new(Identity::generate_signing_key(), server_id.public_key());
        let client = HandshakeClient::new(
            Arc::new(impostor),
            Arc::new(TokenPool::new()),
            one_rtt_config(),
        );
        let server = HandshakeServer::new(
            server_id.clone(),
            Arc::new(TokenPool::new()),
            one_rtt_config(),
        );
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_, s) = tokio::join!(client.connect(a), server.handshake(b));
        assert!(matches!(s, Err(Error::AuthenticationFailed)));

        // Server signs with a key the client does not expect.
        let rogue = Identity::new(Identity::generate_signing_key(), client_id.public_key());
        let client = HandshakeClient::new(client_id, Arc::new(TokenPool::new()), one_rtt_config());
        let server = HandshakeServer::new(
            Arc::new(rogue),
            Arc::new(TokenPool::new()),
            one_rtt_config(),
        );
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (c, s) = tokio::join!(client.connect(a), server.handshake(b));
        assert!(matches!(c, Err(Error::AuthenticationFailed)));
        assert!(s.is_err());
    }

    #[tokio::test]
    async fn test_one_rtt_server_answers_garbage_with_404() {
        let (_, server_id) = identities();
        let server = HandshakeServer::new(server_id, Arc::new(TokenPool::new()), one_rtt_config());

        let (a, mut b) = tokio::io::duplex(64 * 1024);
        b.write_all(b"GET /index.html HTTP/1.1\r\nHost: example\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(server.handshake(a).await, Err(Error::ProtocolViolation)));

        let mut response = Vec::new();
        b.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let (_, server) = endpoints(false);
        let server = HandshakeServer::new(
            server.identity().clone(),
            Arc::new(TokenPool::new()),
            HandshakeConfig {
                read_timeout: Duration::from_millis(100),
                ..config(false)
            },
        );
        let (_a, b) = tokio::io::duplex(1024);
        assert!(matches!(server.handshake(b).await, Err(Error::Timeout(100))));
    }

    #[tokio::test]
    async fn test_drain_stops_at_eof() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        tokio::time::timeout(Duration::from_secs(1), drain_after_error(&mut b, Duration::from_secs(5)))
            .await
            .unwrap();
    }
}
