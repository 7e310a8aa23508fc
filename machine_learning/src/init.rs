use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::Result;

/// A source of initial parameter values.
pub trait WeightGen {
    /// Samples `n` values.
    fn sample(&mut self, n: usize) -> Vec<f32>;
}

/// A weight generator that yields the same value every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstWeightGen(pub f32);

impl WeightGen for ConstWeightGen {
    fn sample(&mut self, n: usize) -> Vec<f32> {
        vec![self.0; n]
    }
}

/// A weight generator that samples a normal distribution truncated to `[low, high]`
/// by rejection, the way `timm` initializes transformer weights.
pub struct TruncNormalWeightGen<'r, R: Rng> {
    rng: &'r mut R,
    distribution: Normal<f32>,
    low: f32,
    high: f32,
}

impl<'r, R: Rng> TruncNormalWeightGen<'r, R> {
    /// Creates a new `TruncNormalWeightGen` centered at zero with the default
    /// absolute bounds of `[-2, 2]`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `std_dev` - The standard deviation of the untruncated distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn new(rng: &'r mut R, std_dev: f32) -> Result<Self> {
        Ok(Self {
            rng,
            distribution: Normal::new(0.0, std_dev)?,
            low: -2.0,
            high: 2.0,
        })
    }
}

impl<R: Rng> WeightGen for TruncNormalWeightGen<'_, R> {
    fn sample(&mut self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);

        while out.len() < n {
            let x = self.distribution.sample(&mut *self.rng);
            if (self.low..=self.high).contains(&x) {
                out.push(x);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn const_gen_fills() {
        assert_eq!(ConstWeightGen(1.5).sample(3), vec![1.5; 3]);
        assert!(ConstWeightGen(0.0).sample(0).is_empty());
    }

    #[test]
    fn trunc_normal_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut weight_gen = TruncNormalWeightGen::new(&mut rng, 3.0).unwrap();
        let sample = weight_gen.sample(1000);

        assert_eq!(sample.len(), 1000);
        assert!(sample.iter().all(|x| (-2.0..=2.0).contains(x)));
    }

    #[test]
    fn trunc_normal_small_std_is_centered() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut weight_gen = TruncNormalWeightGen::new(&mut rng, 0.02).unwrap();
        let sample = weight_gen.sample(4000);
        let mean = sample.iter().sum::<f32>() / sample.len() as f32;

        assert!(mean.abs() < 0.005);
        assert!(sample.iter().all(|x| x.abs() < 0.2));
    }

    #[test]
    fn invalid_std_is_an_error() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(TruncNormalWeightGen::new(&mut rng, f32::NAN).is_err());
    }
}
