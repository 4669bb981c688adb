//! Randomness for retry jitter

use rand::Rng;

/// A source of random numbers, injectable so tests can pin the jitter
pub trait Random: Send + Sync {
    /// A value in `0..bound`, or 0 when `bound` is 0
    fn next_below(&self, bound: u64) -> u64;
}

/// Draws from the calling thread's generator
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl Random for ThreadRandom {
    fn next_below(&self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..bound)
    }
}
