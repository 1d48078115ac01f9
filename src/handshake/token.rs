//! Resumption tokens and the in-memory token pool.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Length of freshly issued tokens
pub const TOKEN_SIZE: usize = 48;

/// Largest token accepted from the wire
pub const MAX_TOKEN_SIZE: usize = 256;

/// 4-byte identifier derived from a token's first bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TokenId(u32);

impl TokenId {
    /// Decode from little-endian wire bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    /// Little-endian wire bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Opaque resumption secret issued by a server.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Token(Vec<u8>);

impl Token {
    /// Issue a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; TOKEN_SIZE];
        SecureRandom::fill(&mut bytes);
        Self(bytes)
    }

    /// Wrap received token contents.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 4 || bytes.len() > MAX_TOKEN_SIZE {
            return Err(Error::ProtocolViolation);
        }
        Ok(Self(bytes))
    }

    /// Identifier derived from the first four bytes.
    pub fn id(&self) -> TokenId {
        TokenId::from_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Raw token contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.id())
    }
}

struct Entry {
    token: Token,
    issued_at: Instant,
}

/// Thread-safe cache of resumption tokens keyed by [`TokenId`].
///
/// Servers hold the tokens they issued; clients hold the tokens they
/// received. An identifier maps to at most one live token and
/// [`TokenPool::consume`] removes it atomically, so of several concurrent
/// attempts presenting the same identifier exactly one wins.
pub struct TokenPool {
    entries: Mutex<HashMap<TokenId, Entry>>,
    ttl: Option<Duration>,
}

impl TokenPool {
    /// Create a pool whose tokens never expire.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: None,
        }
    }

    /// Create a pool whose tokens expire `ttl` after being added.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Store a token, replacing any entry with the same identifier.
    ///
    /// With a TTL set, expired entries are evicted first so a pool that only
    /// ever receives tokens stays bounded by the issue rate times the TTL.
    pub fn add(&self, token: Token) -> TokenId {
        let id = token.id();
        let entry = Entry {
            token,
            issued_at: Instant::now(),
        };
        let mut entries = self.entries.lock();
        if self.ttl.is_some() {
            let before = entries.len();
            entries.retain(|_, entry| !self.is_expired(entry));
            let evicted = before - entries.len();
            if evicted > 0 {
                debug!("evicted {} expired tokens", evicted);
            }
        }
        if entries.insert(id, entry).is_some() {
            debug!("token {} replaced an existing entry", id);
        }
        id
    }

    /// Atomically remove and return the token for `id`.
    pub fn consume(&self, id: TokenId) -> Result<Token> {
        let entry = self.entries.lock().remove(&id).ok_or(Error::TokenNotFound)?;
        if self.is_expired(&entry) {
            debug!("token {} expired", id);
            return Err(Error::TokenNotFound);
        }
        Ok(entry.token)
    }

    /// Return a copy of the token for `id` without removing it.
    pub fn peek(&self, id: TokenId) -> Option<Token> {
        let entries = self.entries.lock();
        entries
            .get(&id)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.token.clone())
    }

    /// Return a copy of any live token without removing it.
    pub fn pick(&self) -> Option<Token> {
        let entries = self.entries.lock();
        entries
            .values()
            .find(|entry| !self.is_expired(entry))
            .map(|entry| entry.token.clone())
    }

    /// Drop every token.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired tokens, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry));
        before - entries.len()
    }

    /// Number of stored tokens, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no tokens are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        self.ttl
            .map(|ttl| entry.issued_at.elapsed() >= ttl)
            .unwrap_or(false)
    }
}

impl Default for TokenPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn token_with_id(id: [u8; 4], fill: u8) -> Token {
        let mut bytes = vec![fill; TOKEN_SIZE];
        bytes[..4].copy_from_slice(&id);
        Token::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_add_consume_once() {
        let pool = TokenPool::new();
        let token = Token::generate();
        let id = pool.add(token.clone());
        assert_eq!(id, token.id());
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.consume(id).unwrap(), token);
        assert!(matches!(pool.consume(id), Err(Error::TokenNotFound)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_collision_last_write_wins() {
        let pool = TokenPool::new();
        let first = token_with_id([1, 2, 3, 4], 0xaa);
        let second = token_with_id([1, 2, 3, 4], 0xbb);

        pool.add(first);
        pool.add(second.clone());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.consume(second.id()).unwrap(), second);
    }

    #[test]
    fn test_pick_and_peek_do_not_remove() {
        let pool = TokenPool::new();
        assert!(pool.pick().is_none());

        let token = Token::generate();
        pool.add(token.clone());
        assert_eq!(pool.pick().unwrap(), token);
        assert_eq!(pool.peek(token.id()).unwrap(), token);
        assert_eq!(pool.len(), 1);

        pool.clear();
        assert!(pool.pick().is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let pool = TokenPool::with_ttl(Duration::from_millis(0));
        let token = Token::generate();
        let id = pool.add(token);

        assert!(pool.pick().is_none());
        assert!(pool.peek(id).is_none());
        assert_eq!(pool.purge_expired(), 1);
        assert!(matches!(pool.consume(id), Err(Error::TokenNotFound)));
    }

    #[test]
    fn test_add_evicts_expired() {
        let pool = TokenPool::with_ttl(Duration::from_millis(0));
        for _ in 0..2000 {
            pool.add(Token::generate());
        }
        assert_eq!(pool.len(), 1);

        let pool = TokenPool::with_ttl(Duration::from_secs(3600));
        for i in 0..100u32 {
            pool.add(token_with_id(i.to_le_bytes(), 0x11));
        }
        assert_eq!(pool.len(), 100);
    }

    #[test]
    fn test_concurrent_consume_single_winner() {
        let pool = Arc::new(TokenPool::new());
        let id = pool.add(Token::generate());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if pool.consume(id).is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_bounds() {
        assert!(Token::from_bytes(vec![0; 3]).is_err());
        assert!(Token::from_bytes(vec![0; MAX_TOKEN_SIZE + 1]).is_err());
        assert!(Token::from_bytes(vec![0; MAX_TOKEN_SIZE]).is_ok());
    }
}
