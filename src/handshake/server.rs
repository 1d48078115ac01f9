//! Server side of the handshake.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::conn::SecureConn;
use crate::crypto::kdf::verify_mac;
use crate::crypto::{BlockCipher, EphemeralKeyPair, Identity, ResumptionPsk, SessionKeys};
use crate::error::{Error, Result};
use crate::handshake::message::{
    encode_fast_accept, encode_reject, encode_signature, read_client_hello, read_signature,
    server_flag, Hello, ReceivedHello,
};
use crate::handshake::token::{Token, TokenPool};
use crate::handshake::{
    drain_after_error, one_rtt, send, transcript_hash, warrants_drain, Agreement, Established,
    HandshakeConfig, HandshakeKind, HandshakeMethod, Role, SessionId,
};

/// Accepting side of the handshake.
///
/// One server is shared by every connection-handling task; the token pool
/// is the only mutable state and is internally locked.
#[derive(Debug, Clone)]
pub struct HandshakeServer {
    identity: Arc<Identity>,
    tokens: Arc<TokenPool>,
    config: HandshakeConfig,
}

impl HandshakeServer {
    /// Create a server.
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

    /// Tokens issued to clients and not yet redeemed.
    pub fn tokens(&self) -> &Arc<TokenPool> {
        &self.tokens
    }

    /// Handshake settings.
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Answer one client handshake over `stream`.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` and `AuthenticationFailed` are preceded by a
    /// randomized drain when enabled, and by a `404` on the one-RTT path.
    /// `TokenNotFound` is returned after a signed rejection has been sent
    /// to the client.
    pub async fn handshake<S>(&self, mut stream: S) -> Result<Established<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.run(&mut stream).await {
            Ok(agreement) => {
                debug!(
                    "session {}: {:?} handshake accepted",
                    agreement.session_id, agreement.kind
                );
                Ok(Established::new(stream, Role::Server, self.config.cipher, agreement))
            }
            Err(e) => {
                if warrants_drain(&e) {
                    if self.config.method == HandshakeMethod::OneRtt {
                        one_rtt::not_found(&mut stream).await;
                    }
                    if self.config.drain_after_error {
                        drain_after_error(&mut stream, self.config.read_timeout).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Answer a handshake and return the framed connection.
    pub async fn accept<S>(&self, stream: S) -> Result<SecureConn<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Ok(self.handshake(stream).await?.into_secure_conn())
    }

    async fn run<S>(&self, stream: &mut S) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.config.method == HandshakeMethod::OneRtt {
            return one_rtt::server(stream, &self.identity, self.config.read_timeout).await;
        }
        let received = read_client_hello(stream, self.config.read_timeout).await?;
        if received.hello.is_fast() {
            self.fast(stream, received).await
        } else {
            self.full(stream, received.hello).await
        }
    }

    async fn full<S>(&self, stream: &mut S, client_hello: Hello) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session_id = client_hello.session_id;
        let eph = EphemeralKeyPair::generate();
        let server_hello = Hello::new(SessionId::random(), *eph.public(), server_flag());
        let shared = eph.derive_shared_secret(&client_hello.eph_public)?;
        let secret = Zeroizing::new(*shared.as_bytes());
        send(stream, &server_hello.encode()).await?;

        let transcript = transcript_hash(&client_hello, &server_hello, secret.as_slice());
        let (client_signature, _) = read_signature(stream, self.config.read_timeout, false).await?;
        self.identity
            .verify_peer(transcript.as_bytes(), &client_signature)
            .map_err(|e| {
                warn!("session {}: client signature did not verify", session_id);
                e
            })?;

        let keys = SessionKeys::derive(&secret, &transcript)?;
        let sealed = self.issue_token(&keys)?;
        let signature = self.identity.sign(transcript.as_bytes());
        send(stream, &encode_signature(&signature, Some(&sealed))?).await?;

        Ok(Agreement {
            session_id,
            transcript_hash: transcript,
            kind: HandshakeKind::Full,
            secret,
            keys,
        })
    }

    async fn fast<S>(&self, stream: &mut S, received: ReceivedHello) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let hello = &received.hello;
        let session_id = hello.session_id;
        let resumption = hello.resumption.as_ref().ok_or(Error::ProtocolViolation)?;
        let token_id = resumption.token_id;

        let token = if self.config.fast_handshake {
            self.tokens.peek(token_id)
        } else {
            None
        };
        let Some(token) = token else {
            debug!("session {}: unknown token {}, rejecting", session_id, token_id);
            return self.reject(stream, &received.raw).await;
        };

        let psk = ResumptionPsk::from_token(token.as_bytes())?;
        let expected = psk.binder(
            session_id.as_bytes(),
            hello.eph_public.as_bytes(),
            &hello.entropy,
        );
        verify_mac(&expected, &resumption.binder).map_err(|e| {
            warn!("session {}: binder for token {} did not verify", session_id, token_id);
            e
        })?;

        // Only a proven holder may redeem; a concurrent redeemer may still win.
        if self.tokens.consume(token_id).is_err() {
            debug!("session {}: token {} already redeemed", session_id, token_id);
            return self.reject(stream, &received.raw).await;
        }

        let eph = EphemeralKeyPair::generate();
        let server_hello = Hello::new(SessionId::random(), *eph.public(), server_flag());
        let shared = eph.derive_shared_secret(&hello.eph_public)?;
        let secret = Zeroizing::new(psk.fast_secret(shared.as_bytes())?);
        let transcript = transcript_hash(hello, &server_hello, secret.as_slice());
        let keys = SessionKeys::derive(&secret, &transcript)?;

        let sealed = self.issue_token(&keys)?;
        let mut reply = server_hello.encode();
        reply.extend_from_slice(&encode_fast_accept(&psk.confirm(&transcript), &sealed)?);
        send(stream, &reply).await?;

        Ok(Agreement {
            session_id,
            transcript_hash: transcript,
            kind: HandshakeKind::Fast,
            secret,
            keys,
        })
    }

    async fn reject<S>(&self, stream: &mut S, raw_client_hello: &[u8]) -> Result<Agreement>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        send(stream, &encode_reject(&self.identity, raw_client_hello)).await?;
        Err(Error::TokenNotFound)
    }

    /// Issue a token and seal it for the client, or nothing when disabled.
    fn issue_token(&self, keys: &SessionKeys) -> Result<Vec<u8>> {
        if !self.config.fast_handshake {
            return Ok(Vec::new());
        }
        let token = Token::generate();
        let sealed = BlockCipher::stateless(self.config.cipher, &keys.token_key())
            .encrypt(token.as_bytes())?;
        let id = self.tokens.add(token);
        debug!("issued resumption token {}", id);
        Ok(sealed)
    }
}
