//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source, plus the skewed size distribution used to shape
//! padding and chunk lengths.

use rand::{CryptoRng, Rng, RngCore};
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Generate a random u8.
    pub fn u8() -> u8 {
        Self::bytes::<1>()[0]
    }

    /// OS-backed RNG for `rand` distributions and samplers.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }

    /// Random integer in `[0, n)` with a scale-down distribution.
    ///
    /// Smaller values are more likely than larger ones, so sizes drawn from
    /// here cluster low with a long tail instead of being uniform. Returns 0
    /// when `n == 0`.
    pub fn intn(n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let base = rng.gen_range(0..=n) as f64;
        let v = (base * scale_down(&mut rng)) as usize;
        v.min(n - 1)
    }

    /// Random integer in `[m, n)` with a scale-down distribution.
    ///
    /// Returns `m` when the range is empty.
    pub fn int_range(m: usize, n: usize) -> usize {
        if n <= m {
            return m;
        }
        m + Self::intn(n - m)
    }
}

/// A random value in `[0.0, 1.0)` where small values are more likely.
fn scale_down(rng: &mut impl Rng) -> f64 {
    let base: f64 = rng.gen();
    (base * base * base).sqrt()
}

/// Generate random padding of the specified length.
///
/// The padding is filled with random bytes to make traffic analysis harder.
pub fn random_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    SecureRandom::fill(&mut padding);
    padding
}

/// Generate a random delay in milliseconds within a range.
///
/// Uniform in `[min_ms, max_ms)`; returns `min_ms` for an empty range.
pub fn random_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    rand::thread_rng().gen_range(min_ms..max_ms)
}
