//! Short randomized pauses that keep racing processes from retrying in lockstep.

use rand::Rng;
use std::ops::Range;
use std::time::Duration;

/// Pause window in milliseconds, upper bound exclusive.
pub const JITTER_MS: Range<u64> = 8..18;

/// A random pause drawn from [`JITTER_MS`].
pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(JITTER_MS))
}
