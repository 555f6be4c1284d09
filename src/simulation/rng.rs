//! Seeded RNG shared by simulated components.
//!
//! A fixed seed makes noise and injected failures reproducible in tests.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe, optionally seeded random source
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG. `None` seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Decide whether an operation with failure probability `rate` fails.
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().r#gen::<f64>() < rate
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().r#gen()
    }

    /// Multiplicative noise factor uniformly drawn from `[1 - fraction, 1 + fraction]`.
    pub fn jitter(&self, fraction: f64) -> f64 {
        if fraction <= 0.0 {
            return 1.0;
        }
        1.0 + self.inner.lock().gen_range(-fraction..=fraction)
    }

    /// Additive noise uniformly drawn from `[-amplitude, amplitude]`.
    pub fn spread(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..=amplitude)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
