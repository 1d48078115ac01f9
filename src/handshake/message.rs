//! Wire encoding of handshake messages.
//!
//! Every message opens with a random 12-byte nonce. Hellos follow it with a
//! 4-byte header `[entropy_len, padding_total (u16 LE), flag]` whose bytes
//! are XOR-masked with `nonce[1]`, so no byte of a hello sits at a fixed
//! value on the wire.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncRead;

use crate::crypto::kdf::MAC_SIZE;
use crate::crypto::random::random_padding;
use crate::crypto::{
    Identity, PublicKey, SecureRandom, TranscriptHash, NONCE_SIZE, PUBLIC_KEY_SIZE,
    SIGNATURE_SIZE,
};
use crate::error::{Error, Result};
use crate::handshake::token::TokenId;
use crate::handshake::{
    read_exact_timed, SessionId, HEADER_SIZE, MAX_HELLO_PADDING, MAX_PADDING_LEN,
    MIN_PADDING_LEN, REJECT_FLAG, SESSION_ID_SIZE,
};

/// Nonce plus header
pub(crate) const PREFIX_SIZE: usize = NONCE_SIZE + HEADER_SIZE;

const RESUMPTION_SIZE: usize = 4 + MAC_SIZE;

/// Token id and binder carried by a fast hello.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resumption {
    /// Identifier of the token being presented
    pub token_id: TokenId,
    /// HMAC proving possession of the token
    pub binder: [u8; MAC_SIZE],
}

/// Client or server hello.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    /// Session identifier of the sender
    pub session_id: SessionId,
    /// Sender's ephemeral X25519 public key
    pub eph_public: PublicKey,
    /// Random entropy mixed into the transcript
    pub entropy: Vec<u8>,
    /// Path selector: odd for a full client hello, even for a fast one
    pub flag: u8,
    /// Present only in fast client hellos
    pub resumption: Option<Resumption>,
}

impl Hello {
    /// Build a hello with fresh random entropy.
    pub fn new(session_id: SessionId, eph_public: PublicKey, flag: u8) -> Self {
        let entropy = random_padding(SecureRandom::int_range(MIN_PADDING_LEN, MAX_PADDING_LEN));
        Self {
            session_id,
            eph_public,
            entropy,
            flag,
            resumption: None,
        }
    }

    /// True for a client hello requesting the resumption path.
    pub fn is_fast(&self) -> bool {
        self.flag % 2 == 0
    }

    /// Serialize with fresh nonce and padding.
    pub fn encode(&self) -> Vec<u8> {
        let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();
        let padding_len = SecureRandom::int_range(MIN_PADDING_LEN, MAX_PADDING_LEN);
        let entropy_len = self.entropy.len().min(u8::MAX as usize);
        let padding_total = (2 * padding_len + entropy_len) as u16;
        let header = HelloHeader {
            entropy_len,
            padding_total: padding_total as usize,
            flag: self.flag,
        };

        let resumption_len = if self.resumption.is_some() {
            RESUMPTION_SIZE
        } else {
            0
        };
        let mut buf = BytesMut::with_capacity(
            PREFIX_SIZE + header.padding_total + SESSION_ID_SIZE + PUBLIC_KEY_SIZE + resumption_len,
        );
        buf.put_slice(&nonce);
        buf.put_slice(&header.encode(&nonce));
        buf.put_slice(&random_padding(padding_len));
        buf.put_slice(self.session_id.as_bytes());
        buf.put_slice(self.eph_public.as_bytes());
        if let Some(resumption) = &self.resumption {
            buf.put_slice(&resumption.token_id.to_bytes());
            buf.put_slice(&resumption.binder);
        }
        buf.put_slice(&self.entropy[..entropy_len]);
        buf.put_slice(&random_padding(padding_len));
        buf.to_vec()
    }

    fn decode_body(header: &HelloHeader, mut body: &[u8], with_resumption: bool) -> Self {
        let padding_len = header.padding_len();
        body.advance(padding_len);

        let mut session_id = [0u8; SESSION_ID_SIZE];
        body.copy_to_slice(&mut session_id);
        let mut eph_public = [0u8; PUBLIC_KEY_SIZE];
        body.copy_to_slice(&mut eph_public);

        let resumption = with_resumption.then(|| {
            let mut token_id = [0u8; 4];
            body.copy_to_slice(&mut token_id);
            let mut binder = [0u8; MAC_SIZE];
            body.copy_to_slice(&mut binder);
            Resumption {
                token_id: TokenId::from_bytes(token_id),
                binder,
            }
        });

        let entropy = body[..header.entropy_len].to_vec();

        Self {
            session_id: SessionId::from_bytes(session_id),
            eph_public: PublicKey::from_bytes(eph_public),
            entropy,
            flag: header.flag,
            resumption,
        }
    }
}

/// Unmasked hello header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HelloHeader {
    pub entropy_len: usize,
    pub padding_total: usize,
    pub flag: u8,
}

impl HelloHeader {
    fn encode(&self, nonce: &[u8; NONCE_SIZE]) -> [u8; HEADER_SIZE] {
        let total = (self.padding_total as u16).to_le_bytes();
        let mut header = [self.entropy_len as u8, total[0], total[1], self.flag];
        mask(&mut header, nonce);
        header
    }

    fn decode(prefix: &[u8; PREFIX_SIZE]) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&prefix[..NONCE_SIZE]);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&prefix[NONCE_SIZE..]);
        mask(&mut header, &nonce);

        Self {
            entropy_len: header[0] as usize,
            padding_total: u16::from_le_bytes([header[1], header[2]]) as usize,
            flag: header[3],
        }
    }

    /// Reject lengths no honest peer produces, before anything is allocated.
    fn validate(&self) -> Result<()> {
        if self.padding_total > MAX_HELLO_PADDING
            || self.entropy_len > self.padding_total
            || (self.padding_total - self.entropy_len) % 2 != 0
        {
            tracing::debug!(
                "hello header rejected: entropy {} total {}",
                self.entropy_len,
                self.padding_total
            );
            return Err(Error::ProtocolViolation);
        }
        Ok(())
    }

    fn padding_len(&self) -> usize {
        (self.padding_total - self.entropy_len) / 2
    }

    fn body_len(&self, with_resumption: bool) -> usize {
        let resumption = if with_resumption { RESUMPTION_SIZE } else { 0 };
        self.padding_total + SESSION_ID_SIZE + PUBLIC_KEY_SIZE + resumption
    }
}

fn mask(header: &mut [u8; HEADER_SIZE], nonce: &[u8; NONCE_SIZE]) {
    for byte in header.iter_mut() {
        *byte ^= nonce[1];
    }
}

/// Flag for a full client hello (odd, never the reject marker).
pub(crate) fn full_flag() -> u8 {
    let flag = SecureRandom::u8() | 1;
    if flag == REJECT_FLAG {
        flag - 2
    } else {
        flag
    }
}

/// Flag for a fast client hello (even).
pub(crate) fn fast_flag() -> u8 {
    SecureRandom::u8() & !1
}

/// Flag for a server hello (anything except the reject marker).
pub(crate) fn server_flag() -> u8 {
    SecureRandom::u8() % REJECT_FLAG
}

/// A client hello as received, with its exact wire bytes.
pub(crate) struct ReceivedHello {
    pub hello: Hello,
    pub raw: Vec<u8>,
}

/// Read a client hello.
pub(crate) async fn read_client_hello<S>(stream: &mut S, limit: Duration) -> Result<ReceivedHello>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_SIZE];
    read_exact_timed(stream, &mut prefix, limit).await?;
    let header = HelloHeader::decode(&prefix);
    header.validate()?;

    let with_resumption = header.flag % 2 == 0;
    let mut raw = vec![0u8; PREFIX_SIZE + header.body_len(with_resumption)];
    raw[..PREFIX_SIZE].copy_from_slice(&prefix);
    read_exact_timed(stream, &mut raw[PREFIX_SIZE..], limit).await?;

    let hello = Hello::decode_body(&header, &raw[PREFIX_SIZE..], with_resumption);
    Ok(ReceivedHello { hello, raw })
}

/// What a server may answer to a client hello.
pub(crate) enum ServerReply {
    Hello(Hello),
    Reject {
        prefix: [u8; PREFIX_SIZE],
        signature: [u8; SIGNATURE_SIZE],
    },
}

/// Read the server's answer to a client hello.
///
/// A reject is only acceptable in answer to a fast hello.
pub(crate) async fn read_server_reply<S>(
    stream: &mut S,
    limit: Duration,
    allow_reject: bool,
) -> Result<ServerReply>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_SIZE];
    read_exact_timed(stream, &mut prefix, limit).await?;
    let header = HelloHeader::decode(&prefix);

    if header.flag == REJECT_FLAG {
        if !allow_reject {
            return Err(Error::ProtocolViolation);
        }
        let mut signature = [0u8; SIGNATURE_SIZE];
        read_exact_timed(stream, &mut signature, limit).await?;
        return Ok(ServerReply::Reject { prefix, signature });
    }

    header.validate()?;
    let mut body = vec![0u8; header.body_len(false)];
    read_exact_timed(stream, &mut body, limit).await?;
    Ok(ServerReply::Hello(Hello::decode_body(&header, &body, false)))
}

/// Digest the server signs when rejecting a fast hello.
pub(crate) fn reject_digest(raw_client_hello: &[u8], reject_prefix: &[u8]) -> TranscriptHash {
    TranscriptHash::of(&[raw_client_hello, reject_prefix])
}

/// Build a signed rejection of a fast hello.
pub(crate) fn encode_reject(identity: &Identity, raw_client_hello: &[u8]) -> Vec<u8> {
    let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();
    let entropy_len = SecureRandom::int_range(MIN_PADDING_LEN, MAX_PADDING_LEN);
    let padding_len = SecureRandom::int_range(MIN_PADDING_LEN, MAX_PADDING_LEN);
    let header = HelloHeader {
        entropy_len,
        padding_total: 2 * padding_len + entropy_len,
        flag: REJECT_FLAG,
    };

    let mut buf = BytesMut::with_capacity(PREFIX_SIZE + SIGNATURE_SIZE);
    buf.put_slice(&nonce);
    buf.put_slice(&header.encode(&nonce));
    let signature = identity.sign(reject_digest(raw_client_hello, &buf).as_bytes());
    buf.put_slice(&signature);
    buf.to_vec()
}

/// Build a signature message, optionally followed by a sealed token.
///
/// `token` of `Some(&[])` sends an explicit empty token section.
pub(crate) fn encode_signature(
    signature: &[u8; SIGNATURE_SIZE],
    token: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();
    let padding_len = SecureRandom::intn(u8::MAX as usize + 1);

    let mut buf = BytesMut::with_capacity(NONCE_SIZE + SIGNATURE_SIZE + 2 + padding_len + 256);
    buf.put_slice(&nonce);
    buf.put_slice(signature);
    buf.put_u8(padding_len as u8 ^ nonce[1]);
    buf.put_slice(&random_padding(padding_len));
    if let Some(token) = token {
        put_token_section(&mut buf, token)?;
    }
    Ok(buf.to_vec())
}

/// Read a signature message, and the token section if one is expected.
pub(crate) async fn read_signature<S>(
    stream: &mut S,
    limit: Duration,
    with_token: bool,
) -> Result<([u8; SIGNATURE_SIZE], Option<Vec<u8>>)>
where
    S: AsyncRead + Unpin,
{
    let mut fixed = [0u8; NONCE_SIZE + SIGNATURE_SIZE + 1];
    read_exact_timed(stream, &mut fixed, limit).await?;

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&fixed[NONCE_SIZE..NONCE_SIZE + SIGNATURE_SIZE]);
    let padding_len = (fixed[NONCE_SIZE + SIGNATURE_SIZE] ^ fixed[1]) as usize;
    let mut padding = vec![0u8; padding_len];
    read_exact_timed(stream, &mut padding, limit).await?;

    let token = if with_token {
        Some(read_token_section(stream, limit).await?)
    } else {
        None
    };
    Ok((signature, token))
}

/// Build the trailer that follows a server hello on an accepted fast path.
pub(crate) fn encode_fast_accept(confirm: &[u8; MAC_SIZE], token: &[u8]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(MAC_SIZE + 1 + token.len());
    buf.put_slice(confirm);
    put_token_section(&mut buf, token)?;
    Ok(buf.to_vec())
}

/// Read the fast-path trailer: confirmation tag and sealed token.
pub(crate) async fn read_fast_accept<S>(
    stream: &mut S,
    limit: Duration,
) -> Result<([u8; MAC_SIZE], Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut confirm = [0u8; MAC_SIZE];
    read_exact_timed(stream, &mut confirm, limit).await?;
    let token = read_token_section(stream, limit).await?;
    Ok((confirm, token))
}

fn put_token_section(buf: &mut BytesMut, token: &[u8]) -> Result<()> {
    let len = u8::try_from(token.len()).map_err(|_| Error::crypto("sealed token too long"))?;
    buf.put_u8(len);
    buf.put_slice(token);
    Ok(())
}

async fn read_token_section<S>(stream: &mut S, limit: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    read_exact_timed(stream, &mut len, limit).await?;
    let mut token = vec![0u8; len[0] as usize];
    read_exact_timed(stream, &mut token, limit).await?;
    Ok(token)
}
