//! HTTP-disguised one-round-trip handshake.
//!
//! The client's ephemeral key and session id sit at a random offset inside
//! the body of an ordinary-looking `POST`; the offset travels in an `Index`
//! header. The server answers `200` with its own ephemeral key and its
//! signature hidden the same way, then the client's 64-byte signature
//! follows as raw bytes. There is no resumption on this path.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::random::random_padding;
use crate::crypto::{
    EphemeralKeyPair, Identity, PublicKey, SecureRandom, SessionKeys, TranscriptHash,
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::error::{Error, Result};
use crate::handshake::{
    read_exact_timed, send, Agreement, HandshakeKind, SessionId, SESSION_ID_SIZE,
};

const CLIENT_BODY_MIN: usize = 128;
const CLIENT_BODY_MAX: usize = 512;
const SERVER_BODY_MIN: usize = 256;
const SERVER_BODY_MAX: usize = 512;

/// Ephemeral key plus session id hidden in the request body
const CLIENT_FIELDS: usize = PUBLIC_KEY_SIZE + SESSION_ID_SIZE;

/// Ephemeral key plus signature hidden in the response body
const SERVER_FIELDS: usize = PUBLIC_KEY_SIZE + SIGNATURE_SIZE;

/// Upper bound on request line plus headers
const MAX_HEAD_SIZE: usize = 4096;

const ENTROPY_LEN: usize = 32;

const COVER_HOST: &str = "www.88996644.com";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

const NOT_FOUND: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 13\r\nConnection: close\r\n\r\n404 not found";

/// Request line (or status line) and headers of one HTTP/1.1 message.
#[derive(Debug)]
struct HttpHead {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl HttpHead {
    fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| Error::ProtocolViolation)?;
        let mut lines = text.lines();
        let start_line = lines.next().ok_or(Error::ProtocolViolation)?.to_string();

        let mut headers = Vec::new();
        for line in lines.take_while(|line| !line.is_empty()) {
            let (name, value) = line.split_once(':').ok_or(Error::ProtocolViolation)?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self {
            start_line,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn usize_header(&self, name: &str) -> Result<usize> {
        self.header(name)
            .and_then(|value| value.parse().ok())
            .ok_or(Error::ProtocolViolation)
    }
}

/// Read a head terminated by an empty line, never buffering more than
/// `MAX_HEAD_SIZE` bytes.
async fn read_head<R>(reader: &mut R) -> Result<HttpHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    let mut limited = reader.take(MAX_HEAD_SIZE as u64);
    loop {
        let start = raw.len();
        let n = limited
            .read_until(b'\n', &mut raw)
            .await
            .map_err(Error::from_io)?;
        if n == 0 {
            return Err(if raw.len() >= MAX_HEAD_SIZE {
                Error::ProtocolViolation
            } else {
                Error::ConnectionClosed
            });
        }
        if matches!(&raw[start..], b"\r\n" | b"\n") {
            break;
        }
    }
    HttpHead::parse(&raw)
}

/// Read one message with a `Content-Length` body of at most `max_body`.
///
/// Nothing may follow the body before our reply, so leftover buffered bytes
/// are a violation.
async fn read_message<S>(
    stream: &mut S,
    limit: Duration,
    max_body: usize,
) -> Result<(HttpHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut reader = BufReader::new(&mut *stream);
        let head = read_head(&mut reader).await?;
        let len = head.usize_header("Content-Length")?;
        if len > max_body {
            debug!("http body of {} bytes refused", len);
            return Err(Error::ProtocolViolation);
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(Error::from_io)?;
        if !reader.buffer().is_empty() {
            return Err(Error::ProtocolViolation);
        }
        Ok::<_, Error>((head, body))
    };
    timeout(limit, read)
        .await
        .map_err(|_| Error::Timeout(limit.as_millis() as u64))?
}

/// Offset carried in the `Index` header, checked against the body.
fn field_offset(head: &HttpHead, body: &[u8], fields: usize) -> Result<usize> {
    let index = head.usize_header("Index")?;
    if index + fields > body.len() {
        debug!("index {} outside body of {} bytes", index, body.len());
        return Err(Error::ProtocolViolation);
    }
    Ok(index)
}

fn random_entropy() -> String {
    SecureRandom::rng()
        .sample_iter(&Alphanumeric)
        .take(ENTROPY_LEN)
        .map(char::from)
        .collect()
}

fn transcript(
    client_eph: &PublicKey,
    session_id: SessionId,
    entropy: &[u8],
    client_index: usize,
    server_eph: &PublicKey,
    server_index: usize,
    secret: &[u8],
) -> TranscriptHash {
    let client_index = (client_index as u16).to_le_bytes();
    let server_index = (server_index as u16).to_le_bytes();
    let items: [&[u8]; 7] = [
        client_eph.as_bytes(),
        session_id.as_bytes(),
        entropy,
        &client_index,
        server_eph.as_bytes(),
        &server_index,
        secret,
    ];
    TranscriptHash::of(&items)
}

fn encode_request(body: &[u8], index: usize, entropy: &str) -> Vec<u8> {
    let head = format!(
        "POST /file?token={entropy} HTTP/1.1\r\n\
         Host: {COVER_HOST}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept-Encoding: gzip, deflate\r\n\
         Connection: keep-alive\r\n\
         Pragma: no-cache\r\n\
         Index: {index}\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );
    let mut message = head.into_bytes();
    message.extend_from_slice(body);
    message
}

fn encode_response(body: &[u8], index: usize) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Connection: keep-alive\r\n\
         Pragma: no-cache\r\n\
         Index: {index}\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );
    let mut message = head.into_bytes();
    message.extend_from_slice(body);
    message
}

/// Initiate the exchange.
pub(crate) async fn client<S>(
    stream: &mut S,
    identity: &Identity,
    session_id: SessionId,
    limit: Duration,
) -> Result<Agreement>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let eph = EphemeralKeyPair::generate();
    let client_eph = *eph.public();

    let mut body = random_padding(SecureRandom::int_range(CLIENT_BODY_MIN, CLIENT_BODY_MAX));
    let client_index = SecureRandom::intn(body.len() - CLIENT_FIELDS);
    body[client_index..client_index + PUBLIC_KEY_SIZE].copy_from_slice(client_eph.as_bytes());
    body[client_index + PUBLIC_KEY_SIZE..client_index + CLIENT_FIELDS]
        .copy_from_slice(session_id.as_bytes());
    let entropy = random_entropy();
    send(stream, &encode_request(&body, client_index, &entropy)).await?;

    let (head, body) = read_message(stream, limit, SERVER_BODY_MAX).await?;
    if head.start_line.split_whitespace().nth(1) != Some("200") {
        debug!("session {}: server answered {:?}", session_id, head.start_line);
        return Err(Error::ProtocolViolation);
    }
    let server_index = field_offset(&head, &body, SERVER_FIELDS)?;
    let mut server_eph = [0u8; PUBLIC_KEY_SIZE];
    server_eph.copy_from_slice(&body[server_index..server_index + PUBLIC_KEY_SIZE]);
    let server_eph = PublicKey::from_bytes(server_eph);
    let mut server_signature = [0u8; SIGNATURE_SIZE];
    server_signature
        .copy_from_slice(&body[server_index + PUBLIC_KEY_SIZE..server_index + SERVER_FIELDS]);

    let shared = eph.derive_shared_secret(&server_eph)?;
    let secret = Zeroizing::new(*shared.as_bytes());
    let transcript = transcript(
        &client_eph,
        session_id,
        entropy.as_bytes(),
        client_index,
        &server_eph,
        server_index,
        secret.as_slice(),
    );

    identity
        .verify_peer(transcript.as_bytes(), &server_signature)
        .map_err(|e| {
            warn!("session {}: server signature did not verify", session_id);
            e
        })?;
    send(stream, &identity.sign(transcript.as_bytes())).await?;

    let keys = SessionKeys::derive(&secret, &transcript)?;
    Ok(Agreement {
        session_id,
        transcript_hash: transcript,
        kind: HandshakeKind::OneRtt,
        secret,
        keys,
    })
}

/// Answer the exchange.
pub(crate) async fn server<S>(
    stream: &mut S,
    identity: &Identity,
    limit: Duration,
) -> Result<Agreement>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (head, body) = read_message(stream, limit, CLIENT_BODY_MAX).await?;
    let mut request_line = head.start_line.split_whitespace();
    if request_line.next() != Some("POST") {
        return Err(Error::ProtocolViolation);
    }
    let entropy = request_line
        .next()
        .and_then(|target| target.split_once('='))
        .map(|(_, entropy)| entropy.to_string())
        .ok_or(Error::ProtocolViolation)?;

    let client_index = field_offset(&head, &body, CLIENT_FIELDS)?;
    let mut client_eph = [0u8; PUBLIC_KEY_SIZE];
    client_eph.copy_from_slice(&body[client_index..client_index + PUBLIC_KEY_SIZE]);
    let client_eph = PublicKey::from_bytes(client_eph);
    let mut session_id = [0u8; SESSION_ID_SIZE];
    session_id
        .copy_from_slice(&body[client_index + PUBLIC_KEY_SIZE..client_index + CLIENT_FIELDS]);
    let session_id = SessionId::from_bytes(session_id);

    let eph = EphemeralKeyPair::generate();
    let server_eph = *eph.public();
    let shared = eph.derive_shared_secret(&client_eph)?;
    let secret = Zeroizing::new(*shared.as_bytes());

    let mut reply = random_padding(SecureRandom::int_range(SERVER_BODY_MIN, SERVER_BODY_MAX));
    let server_index = SecureRandom::intn(reply.len() - SERVER_FIELDS);
    let transcript = transcript(
        &client_eph,
        session_id,
        entropy.as_bytes(),
        client_index,
        &server_eph,
        server_index,
        secret.as_slice(),
    );
    reply[server_index..server_index + PUBLIC_KEY_SIZE].copy_from_slice(server_eph.as_bytes());
    reply[server_index + PUBLIC_KEY_SIZE..server_index + SERVER_FIELDS]
        .copy_from_slice(&identity.sign(transcript.as_bytes()));
    send(stream, &encode_response(&reply, server_index)).await?;

    let mut client_signature = [0u8; SIGNATURE_SIZE];
    read_exact_timed(stream, &mut client_signature, limit).await?;
    identity
        .verify_peer(transcript.as_bytes(), &client_signature)
        .map_err(|e| {
            warn!("session {}: client signature did not verify", session_id);
            e
        })?;

    let keys = SessionKeys::derive(&secret, &transcript)?;
    Ok(Agreement {
        session_id,
        transcript_hash: transcript,
        kind: HandshakeKind::OneRtt,
        secret,
        keys,
    })
}

/// Answer like a web server that has nothing at this path.
pub(crate) async fn not_found<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = send(stream, NOT_FOUND).await {
        debug!("could not send 404: {}", e);
    }
}
