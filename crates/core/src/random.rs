//! Randomness port.
//!
//! Processing outcomes and simulated delays are drawn through this trait so
//! tests can script them. Only statistical uniformity matters; the default
//! implementation lives in the infrastructure crate.

pub trait RandomProvider: Send + Sync {
    /// Uniform float in `[0, 1)`.
    fn float64(&self) -> f64;

    /// Uniform integer in `[0, n)`. Returns 0 when `n == 0`.
    fn intn(&self, n: u64) -> u64;
}

impl<R: RandomProvider + ?Sized> RandomProvider for std::sync::Arc<R> {
    fn float64(&self) -> f64 {
        (**self).float64()
    }

    fn intn(&self, n: u64) -> u64 {
        (**self).intn(n)
    }
}
