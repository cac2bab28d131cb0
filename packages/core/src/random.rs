// ABOUTME: Injectable random source for rule, image, and message selection
// ABOUTME: Thread-local RNG in production, pinned index for deterministic tests

use rand::Rng;

/// Uniform selection among `len` candidates
pub trait RandomSource: Send + Sync {
    /// Return an index in `0..len`. Callers never pass `len == 0`.
    fn pick_index(&self, len: usize) -> usize;
}

/// Production source backed by `rand::thread_rng`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

/// Always picks the same index, clamped to the candidate count
#[derive(Debug, Clone, Copy)]
pub struct FixedIndex(pub usize);

impl RandomSource for FixedIndex {
    fn pick_index(&self, len: usize) -> usize {
        self.0.min(len.saturating_sub(1))
    }
}
