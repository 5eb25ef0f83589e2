//! Default randomness source backed by the thread-local RNG.

use rand::Rng;

use taskproc_core::RandomProvider;

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngProvider;

impl RandomProvider for ThreadRngProvider {
    fn float64(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }

    fn intn(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..n)
    }
}
