//! Small deterministic PRNG for seeded fuzzing.
//!
//! Phase-order fuzzing and the differential test oracles need reproducible
//! pseudo-random streams keyed by a single seed; splitmix64 is small, fast,
//! and has no state beyond one word, so identical seeds give identical
//! phase orders and test inputs on every platform.

/// splitmix64 generator (Steele, Lea, Flood 2014).
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub const fn new(seed: u64) -> Self {
        SplitMix64 { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    pub fn next_i64(&mut self) -> i64 {
        self.next_u64() as i64
    }

    /// Uniform-ish index in `0..n`. `n` must be nonzero.
    pub fn next_index(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    /// Signed value in `[-bound, bound]`, handy for arithmetic oracles that
    /// should exercise both signs without overflowing intermediates.
    pub fn next_i64_in(&mut self, bound: u64) -> i64 {
        let span = bound * 2 + 1;
        (self.next_u64() % span) as i64 - bound as i64
    }
}
