//! Entropy trait for deterministic simulation testing.
//!
//! The [`Entropy`] trait controls randomness for worker-internal decisions
//! (currently just re-subscribe back-off jitter after a transport error).

/// Controls randomness for worker-internal decisions.
///
/// In production, the default [`SystemEntropy`] uses `rand::thread_rng()`. In
/// deterministic tests, a custom implementation backed by a seeded RNG
/// ensures reproducible behaviour.
pub trait Entropy: Send + Sync {
    /// Generate a random value in the given range `[low, high)`.
    ///
    /// The range is expressed as `u128` to accommodate any integer width.
    fn random_range(&self, range: std::ops::Range<u128>) -> u128;
}

/// The default entropy source, backed by the system RNG.
pub struct SystemEntropy;

impl Entropy for SystemEntropy {
    fn random_range(&self, range: std::ops::Range<u128>) -> u128 {
        use rand::Rng;
        rand::thread_rng().gen_range(range)
    }
}
