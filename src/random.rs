//! Pseudo-random number generation for fair offer selection.
//!
//! A small xorshift128+ generator, one per thread. Randomness here only
//! breaks ties between simultaneously-ready offers; there is no security
//! or reproducibility requirement.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A pseudo-random number generator using the xorshift128+ algorithm.
#[derive(Debug, Clone)]
pub(crate) struct Rng {
    state: [u64; 2],
}

impl Rng {
    /// Create a new generator with a seed distinct from other threads'.
    pub(crate) fn new() -> Self {
        static SALT: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self::from_seed(nanos ^ SALT.fetch_add(0x9E37_79B9, Ordering::Relaxed))
    }

    /// Create a new generator with a specific seed.
    pub(crate) fn from_seed(seed: u64) -> Self {
        // splitmix64 expands the seed into the initial state
        let mut state = [0u64; 2];
        let mut x = seed;

        x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state[0] = x ^ (x >> 31);

        x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state[1] = x ^ (x >> 31);

        // all-zero state would never leave zero
        if state[0] == 0 && state[1] == 0 {
            state[0] = 1;
        }

        Rng { state }
    }

    /// Generate the next u64 value.
    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut s1 = self.state[0];
        let s0 = self.state[1];
        let result = s0.wrapping_add(s1);

        self.state[0] = s0;
        s1 ^= s1 << 23;
        self.state[1] = s1 ^ s0 ^ (s1 >> 18) ^ (s0 >> 5);

        result
    }

    /// Generate a random usize in `[0, max)`; 0 when `max` is 0.
    pub(crate) fn range_usize(&mut self, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        (self.next_u64() as usize) % max
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Rng> = RefCell::new(Rng::new());
}

/// A uniformly random starting index in `[0, len)` for cyclic scans.
pub(crate) fn random_index(len: usize) -> usize {
    THREAD_RNG.with(|rng| rng.borrow_mut().range_usize(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seed_deterministic() {
        let mut a = Rng::from_seed(12345);
        let mut b = Rng::from_seed(12345);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_range_usize_bounds() {
        let mut rng = Rng::from_seed(42);
        for _ in 0..1000 {
            let n = rng.range_usize(7);
            assert!(n < 7);
        }
    }

    #[test]
    fn test_range_usize_zero() {
        let mut rng = Rng::from_seed(42);
        assert_eq!(rng.range_usize(0), 0);
    }

    #[test]
    fn test_random_index_covers_range() {
        let mut seen = [false; 4];
        for _ in 0..1000 {
            seen[random_index(4)] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
