//! Pseudo random generator for lottery draws (LFSR64, xorshift step).
//!
//! Seeded from the TSC at boot, or from a fixed value when reproducible
//! scheduling decisions are wanted (tests, `seed=` on the command line).

use crate::cpu;

#[derive(Clone, Debug)]
pub struct Lfsr64 {
    state: u64,
}

impl Lfsr64 {
    /// A zero state would lock the generator at zero forever.
    pub const fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
    }

    pub fn from_tsc() -> Self {
        Self::new(cpu::rdtsc())
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish draw in `[0, bound)`. `bound` must be non-zero.
    #[inline]
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Lfsr64::new(0xC0FFEE);
        let mut b = Lfsr64::new(0xC0FFEE);
        for _ in 0..16 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn zero_seed_does_not_stall() {
        let mut r = Lfsr64::new(0);
        assert_ne!(r.next_u64(), 0);
        assert!(r.below(10) < 10);
    }
}
