//! Utility functions and helpers.

use std::hash::{BuildHasher, Hash, Hasher};

/// Fast xorshift PRNG for non-cryptographic randomness.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Creates a new PRNG with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 1 } else { seed } }
    }

    /// Generates the next random u64.
    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generates a random index in `0..bound`. `bound` must be non-zero.
    pub fn next_below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.next() % bound as u64) as usize
    }
}

/// Hashes a value with the given hasher builder.
#[must_use]
pub fn hash_one<S: BuildHasher, T: Hash + ?Sized>(build: &S, value: &T) -> u64 {
    let mut hasher = build.build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Rounds up to the next power of two.
#[must_use]
pub const fn next_power_of_two(n: usize) -> usize {
    if n <= 1 {
        1
    } else {
        1 << (usize::BITS - (n - 1).leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;

    #[test]
    fn test_xorshift() {
        let mut rng = XorShift64::new(12345);
        let a = rng.next();
        let b = rng.next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_xorshift_zero_seed() {
        let mut rng = XorShift64::new(0);
        assert_ne!(rng.next(), 0);
    }

    #[test]
    fn test_next_below_in_range() {
        let mut rng = XorShift64::new(7);
        for _ in 0..1000 {
            assert!(rng.next_below(5) < 5);
        }
    }

    #[test]
    fn test_hash_one_is_stable_per_builder() {
        let build = RandomState::new();
        assert_eq!(hash_one(&build, "alice"), hash_one(&build, "alice"));
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(64), 64);
    }
}
