//! Sequence-number arithmetic.

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Is `b` in the closed range `[a, c]` when accounting for wraparound?
pub fn mod_within(a: u32, b: u32, c: u32) -> bool {
    b.wrapping_sub(a) <= c.wrapping_sub(a)
}

/// Draws initial sequence numbers for new connections.
#[derive(Debug)]
pub struct IssGenerator {
    fixed: Option<u32>,
    rng: SmallRng,
}

impl IssGenerator {
    /// A generator that always answers `fixed` if given, and random numbers
    /// otherwise.
    pub fn new(fixed: Option<u32>) -> Self {
        Self {
            fixed,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn next_iss(&mut self) -> u32 {
        self.fixed.unwrap_or_else(|| self.rng.gen())
    }
}
