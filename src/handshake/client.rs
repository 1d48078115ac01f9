//! Client side of the handshake.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::conn::SecureConn;
use crate::crypto::kdf::verify_mac;
use crate::crypto::{BlockCipher, EphemeralKeyPair, Identity, ResumptionPsk, SessionKeys};
use crate::error::{Error, Result};
use crate::handshake::message::{
    encode_signature, fast_flag, full_flag, read_fast_accept, read_server_reply, read_signature,
    reject_digest, Hello, Resumption, ServerReply,
};
use crate::handshake::token::{Token, TokenPool};
use crate::handshake::{
    drain_after_error, one_rtt, send, transcript_hash, warrants_drain, Agreement, Established,
    HandshakeConfig, HandshakeKind, HandshakeMethod, HandshakeMode, Role, SessionId,
};

/// Initiating side of the handshake.
///
/// Cheap to share: the identity and token pool sit behind `Arc`s and every
/// call runs an independent handshake.
#[derive(Debug, Clone)]
pub struct HandshakeClient {
    identity: Arc<Identity>,
    tokens: Arc<TokenPool>,
    config: HandshakeConfig,
}

impl HandshakeClient {
    /// Create a client.
    pub fn new(identity: Arc<Identity>, tokens: Arc<TokenPool>, config: HandshakeConfig) -> Self {
        Self {
            identity,
            tokens,
            config,
        }
    }

    /// Static identity used to sign and verify.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Tokens received from the server.
    pub fn tokens(&self) -> &Arc<TokenPool> {
        &self.tokens
    }

    /// Handshake settings.
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Choose the path for the next attempt.
    ///
    /// With resumption enabled and a token on hand, the token is consumed
    /// here so it is never presented twice. Otherwise a full handshake, or
    /// the one-RTT exchange when that method is configured.
    pub fn select_mode(&self, session_id: SessionId) -> HandshakeMode {
        if self.config.method == HandshakeMethod::OneRtt {
            return HandshakeMode::OneRtt { session_id };
        }
        if self.config.fast_handshake {
            if let Some(token) = self.tokens.pick() {
                if let Ok(token) = self.tokens.consume(token.id()) {
                    return HandshakeMode::Fast { token, session_id };
                }
            }
        }
        HandshakeMode::Full { session_id }
    }

    /// Run a handshake over `stream` in the given mode.
    ///
    /// # Errors
    ///
    /// `TokenNotFound` when the server signed a rejection of a fast hello;
    /// the caller may redial with a full handshake. Nothing is retried here.
    pub async fn handshake<S>(&self, mut stream: S, mode: HandshakeMode) -> Result<Established<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = match mode {
            HandshakeMode::Full { session_id } => self.full(&mut stream, session_id).await,
            HandshakeMode::Fast { token, session_id } => {
                self.fast(&mut stream, token, session_id).await
            }
            HandshakeMode::OneRtt { session_id } => {
                one_rtt::client(
                    &mut stream,
                    &self.identity,
                    session_id,
                    self.config.read_timeout,
                )
                .await
            }
        };

        match result {
            Ok(agreement) => {
                debug!(
                    "session {}: {:?} handshake complete",
                    agreement.session_id, agreement.kind
                );
                Ok(Established::new(stream, Role::Client, self.config.cipher, agreement))
            }
            Err(e) => {
                if warrants_drain(&e) && self.config.drain_after_error {
                    drain_after_error(&mut stream, self.config.read_timeout).await;
                }
                Err(e)
            }
        }
    }

    /// Handshake with a fresh session id and return the framed connection.
    pub async fn connect<S>(&self, stream: S) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.connect_session(stream, SessionId::random()).await
    }

    /// Handshake to open or rejoin `session_id`.
    pub async fn connect_session<S>(&self, stream: S, session_id: SessionId) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mode = self.select_mode(session_id);
        Ok(self.handshake(stream, mode).await?.into_secure_conn())
    }

    async fn full<S>(&self, stream: &mut S, session_id: SessionId) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.config.read_timeout;
        let eph = EphemeralKeyPair::generate();
        let hello = Hello::new(session_id, *eph.public(), full_flag());
        send(stream, &hello.encode()).await?;

        let server_hello = match read_server_reply(stream, limit, false).await? {
            ServerReply::Hello(server_hello) => server_hello,
            ServerReply::Reject { .. } => return Err(Error::ProtocolViolation),
        };
        let shared = eph.derive_shared_secret(&server_hello.eph_public)?;
        let secret = Zeroizing::new(*shared.as_bytes());
        let transcript = transcript_hash(&hello, &server_hello, secret.as_slice());

        let signature = self.identity.sign(transcript.as_bytes());
        send(stream, &encode_signature(&signature, None)?).await?;

        let (server_signature, sealed) = read_signature(stream, limit, true).await?;
        self.identity
            .verify_peer(transcript.as_bytes(), &server_signature)
            .map_err(|e| {
                warn!("session {}: server signature did not verify", session_id);
                e
            })?;

        let keys = SessionKeys::derive(&secret, &transcript)?;
        self.store_token(&keys, &sealed.unwrap_or_default())?;

        Ok(Agreement {
            session_id,
            transcript_hash: transcript,
            kind: HandshakeKind::Full,
            secret,
            keys,
        })
    }

    async fn fast<S>(&self, stream: &mut S, token: Token, session_id: SessionId) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.config.read_timeout;
        let eph = EphemeralKeyPair::generate();
        let psk = ResumptionPsk::from_token(token.as_bytes())?;

        let mut hello = Hello::new(session_id, *eph.public(), fast_flag());
        hello.resumption = Some(Resumption {
            token_id: token.id(),
            binder: psk.binder(session_id.as_bytes(), eph.public().as_bytes(), &hello.entropy),
        });
        let raw = hello.encode();
        send(stream, &raw).await?;
        debug!("session {}: presenting token {}", session_id, token.id());

        let server_hello = match read_server_reply(stream, limit, true).await? {
            ServerReply::Hello(server_hello) => server_hello,
            ServerReply::Reject { prefix, signature } => {
                let digest = reject_digest(&raw, &prefix);
                self.identity.verify_peer(digest.as_bytes(), &signature)?;
                debug!(
                    "session {}: token {} rejected, dropping {} cached tokens",
                    session_id,
                    token.id(),
                    self.tokens.len()
                );
                self.tokens.clear();
                return Err(Error::TokenNotFound);
            }
        };

        let shared = eph.derive_shared_secret(&server_hello.eph_public)?;
        let secret = Zeroizing::new(psk.fast_secret(shared.as_bytes())?);
        let transcript = transcript_hash(&hello, &server_hello, secret.as_slice());

        let (confirm, sealed) = read_fast_accept(stream, limit).await?;
        verify_mac(&psk.confirm(&transcript), &confirm).map_err(|e| {
            warn!("session {}: resumption confirmation did not verify", session_id);
            e
        })?;

        let keys = SessionKeys::derive(&secret, &transcript)?;
        self.store_token(&keys, &sealed)?;

        Ok(Agreement {
            session_id,
            transcript_hash: transcript,
            kind: HandshakeKind::Fast,
            secret,
            keys,
        })
    }

    fn store_token(&self, keys: &SessionKeys, sealed: &[u8]) -> Result<()> {
        if sealed.is_empty() {
            return Ok(());
        }
        if !self.config.fast_handshake {
            debug!("ignoring resumption token, fast handshake disabled");
            return Ok(());
        }
        let mut cipher = BlockCipher::stateless(self.config.cipher, &keys.token_key());
        let token = Token::from_bytes(cipher.decrypt(sealed)?)?;
        let id = self.tokens.add(token);
        debug!("stored resumption token {}", id);
        Ok(())
    }
}
