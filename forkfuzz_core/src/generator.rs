use crate::input::Input;
use rand_core::RngCore;
use std::fmt;

type Producer<I> = dyn Fn(&mut dyn RngCore) -> I + Send + Sync;

/// A named source of fuzz inputs.
///
/// Generators are pure producers: nothing flows back from an execution into
/// them. Randomness should be drawn from the `rng` handed to the producer
/// rather than from a global source, since every worker process is forked
/// from the same parent and would otherwise replay the same stream.
pub struct Generator<I: Input> {
    name: String,
    producer: Box<Producer<I>>,
}

impl<I: Input> Generator<I> {
    /// Wraps a zero-argument producer.
    pub fn new<F>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            producer: Box::new(move |_rng: &mut dyn RngCore| producer()),
        }
    }

    /// Wraps a producer that draws from the worker's random stream.
    pub fn with_rng<F>(name: impl Into<String>, producer: F) -> Self
    where
        F: Fn(&mut dyn RngCore) -> I + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            producer: Box::new(producer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generate(&self, rng: &mut dyn RngCore) -> I {
        (self.producer)(rng)
    }
}

impl<I: Input> fmt::Debug for Generator<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator").field("name", &self.name).finish()
    }
}

/// Ready-made producers for use with [`Generator::with_rng`].
pub mod generators {
    use rand::Rng;
    use rand_core::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

    /// Always yields a clone of `value`.
    pub fn fixed<I: Clone + Send + Sync + 'static>(
        value: I,
    ) -> impl Fn(&mut dyn RngCore) -> I + Send + Sync + 'static {
        move |_rng: &mut dyn RngCore| value.clone()
    }

    /// Random bytes, length uniform in `0..=max_len`.
    pub fn random_bytes(max_len: usize) -> impl Fn(&mut dyn RngCore) -> Vec<u8> + Send + Sync {
        move |rng: &mut dyn RngCore| {
            let len = rng.random_range(0..=max_len);
            let mut buf = vec![0u8; len];
            rng.fill_bytes(&mut buf);
            buf
        }
    }

    /// Random bytes of exactly `len` bytes.
    pub fn random_fixed_len(len: usize) -> impl Fn(&mut dyn RngCore) -> Vec<u8> + Send + Sync {
        move |rng: &mut dyn RngCore| {
            let mut buf = vec![0u8; len];
            rng.fill_bytes(&mut buf);
            buf
        }
    }

    /// Lowercase hex text, length uniform in `0..=max_len`.
    pub fn random_hex(max_len: usize) -> impl Fn(&mut dyn RngCore) -> String + Send + Sync {
        move |rng: &mut dyn RngCore| {
            let len = rng.random_range(0..=max_len);
            (0..len)
                .map(|_| HEX_DIGITS[rng.random_range(0..HEX_DIGITS.len())] as char)
                .collect()
        }
    }

    /// Yields `values` round robin.
    ///
    /// The position lives in the producer, so each forked worker walks the
    /// sequence independently from wherever the parent left it.
    ///
    /// # Panics
    /// Panics if `values` is empty.
    pub fn cycle<I: Clone + Send + Sync + 'static>(
        values: Vec<I>,
    ) -> impl Fn(&mut dyn RngCore) -> I + Send + Sync + 'static {
        assert!(!values.is_empty(), "cycle generator needs at least one value");
        let position = AtomicUsize::new(0);
        move |_rng: &mut dyn RngCore| {
            let idx = position.fetch_add(1, Ordering::Relaxed) % values.len();
            values[idx].clone()
        }
    }

}

/// Convenience: a generator of random bytes up to `max_len`.
pub fn random_bytes_generator(name: impl Into<String>, max_len: usize) -> Generator<Vec<u8>> {
    Generator::with_rng(name, generators::random_bytes(max_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn zero_arg_generator_ignores_rng() {
        let generator = Generator::new("const", || "a".to_string());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(generator.name(), "const");
        assert_eq!(generator.generate(&mut rng), "a");
    }

    #[test]
    fn random_bytes_generator_draws_like_its_producer() {
        let generator = random_bytes_generator("bytes", 8);
        let producer = generators::random_bytes(8);
        let mut a = ChaCha8Rng::seed_from_u64(9);
        let mut b = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..20 {
            let data = generator.generate(&mut a);
            assert!(data.len() <= 8);
            assert_eq!(data, producer(&mut b));
        }
    }

    #[test]
    fn rng_generator_is_deterministic_for_a_seed() {
        let generator = random_bytes_generator("bytes", 16);
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10 {
            assert_eq!(generator.generate(&mut a), generator.generate(&mut b));
        }
    }
}
