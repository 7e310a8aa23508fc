//! Random intensity transforms applied to training volumes.

use machine_learning::mixup::VolumeShape;
use rand::{Rng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

/// A random in-place transform over one volume.
pub trait Transform: Send + Sync {
    /// # Arguments
    /// * `volume` - `channels × side³` values in `[c, z, y, x]` order.
    /// * `shape` - The volume's layout.
    /// * `rng` - The sample's random source.
    fn apply(&self, volume: &mut [f32], shape: VolumeShape, rng: &mut StdRng);
}

/// Adds `N(mean, σ)` noise with `σ ~ U(0, std)`.
#[derive(Debug, Clone, Copy)]
pub struct RandGaussianNoise {
    pub prob: f32,
    pub mean: f32,
    pub std: f32,
}

impl Transform for RandGaussianNoise {
    fn apply(&self, volume: &mut [f32], _shape: VolumeShape, rng: &mut StdRng) {
        if rng.random::<f32>() >= self.prob {
            return;
        }

        let std = rng.random_range(0.0..=self.std);
        let Ok(noise) = Normal::new(self.mean, std) else {
            return;
        };

        volume.iter_mut().for_each(|v| *v += noise.sample(rng));
    }
}

/// Blurs every channel with a separable gaussian whose σ is drawn per axis.
#[derive(Debug, Clone, Copy)]
pub struct RandGaussianSmooth {
    pub prob: f32,
    /// `(min, max)` of σ along z, y and x.
    pub sigma: [(f32, f32); 3],
}

/// Truncation of the gaussian kernel, in standard deviations.
const TRUNCATED: f32 = 4.0;

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (TRUNCATED * sigma + 0.5) as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f32 / sigma).powi(2)).exp())
        .collect();

    let total: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= total);
    kernel
}

/// Convolves every line of a `side³` cube along `axis`, zero padded.
fn convolve_axis(cube: &mut [f32], side: usize, axis: usize, kernel: &[f32]) {
    let stride = side.pow(2 - axis as u32);
    let radius = (kernel.len() / 2) as isize;
    let mut line = vec![0.0; side];

    for start in 0..side.pow(3) {
        // Only visit the first element of every line along `axis`.
        if (start / stride) % side != 0 {
            continue;
        }

        for (i, l) in line.iter_mut().enumerate() {
            *l = cube[start + i * stride];
        }

        for i in 0..side {
            cube[start + i * stride] = kernel
                .iter()
                .enumerate()
                .filter_map(|(k, w)| {
                    let j = i as isize + k as isize - radius;
                    (0..side as isize)
                        .contains(&j)
                        .then(|| w * line[j as usize])
                })
                .sum();
        }
    }
}

impl Transform for RandGaussianSmooth {
    fn apply(&self, volume: &mut [f32], shape: VolumeShape, rng: &mut StdRng) {
        if rng.random::<f32>() >= self.prob {
            return;
        }

        let kernels: Vec<Vec<f32>> = self
            .sigma
            .iter()
            .map(|&(lo, hi)| gaussian_kernel(rng.random_range(lo..=hi)))
            .collect();

        let side = shape.side;
        for cube in volume.chunks_exact_mut(side.pow(3)) {
            for (axis, kernel) in kernels.iter().enumerate() {
                convolve_axis(cube, side, axis, kernel);
            }
        }
    }
}

/// Rescales intensities to `[0, 1]`, raises them to `γ ~ U(gamma)` and maps them back.
#[derive(Debug, Clone, Copy)]
pub struct RandAdjustContrast {
    pub prob: f32,
    pub gamma: (f32, f32),
}

impl Transform for RandAdjustContrast {
    fn apply(&self, volume: &mut [f32], _shape: VolumeShape, rng: &mut StdRng) {
        const EPSILON: f32 = 1e-7;

        if rng.random::<f32>() >= self.prob {
            return;
        }

        let gamma = rng.random_range(self.gamma.0..=self.gamma.1);
        let (min, max) = volume
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;

        volume
            .iter_mut()
            .for_each(|v| *v = ((*v - min) / (range + EPSILON)).powf(gamma) * range + min);
    }
}

/// Runs its transforms in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// The training pipeline: noise, smoothing and contrast.
    pub fn training() -> Self {
        Self::new(vec![
            Box::new(RandGaussianNoise {
                prob: 0.1,
                mean: 0.0,
                std: 0.1,
            }),
            Box::new(RandGaussianSmooth {
                prob: 0.2,
                sigma: [(0.5, 1.0); 3],
            }),
            Box::new(RandAdjustContrast {
                prob: 0.15,
                gamma: (0.75, 1.25),
            }),
        ])
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, volume: &mut [f32], shape: VolumeShape, rng: &mut StdRng) {
        for transform in &self.transforms {
            transform.apply(volume, shape, rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    const CUBE: VolumeShape = VolumeShape {
        channels: 1,
        side: 5,
    };

    #[test]
    fn zero_probability_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let original: Vec<f32> = (0..125).map(|i| i as f32).collect();
        let mut volume = original.clone();

        RandGaussianNoise {
            prob: 0.0,
            mean: 0.0,
            std: 1.0,
        }
        .apply(&mut volume, CUBE, &mut rng);
        RandAdjustContrast {
            prob: 0.0,
            gamma: (0.5, 2.0),
        }
        .apply(&mut volume, CUBE, &mut rng);

        assert_eq!(volume, original);
    }

    #[test]
    fn smoothing_spreads_an_impulse_and_keeps_mass() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut volume = vec![0.0; 125];
        volume[62] = 1.0; // center of the 5³ cube

        RandGaussianSmooth {
            prob: 1.0,
            sigma: [(0.5, 0.5); 3],
        }
        .apply(&mut volume, CUBE, &mut rng);

        assert!(volume[62] < 1.0);
        assert!(volume[61] > 0.0 && volume[57] > 0.0 && volume[37] > 0.0);
        assert!((volume.iter().sum::<f32>() - 1.0).abs() < 1e-3);
        assert!((volume[61] - volume[63]).abs() < 1e-6);
    }

    #[test]
    fn contrast_keeps_the_intensity_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut volume: Vec<f32> = (0..125).map(|i| i as f32 / 10.0 - 2.0).collect();

        RandAdjustContrast {
            prob: 1.0,
            gamma: (1.2, 1.2),
        }
        .apply(&mut volume, CUBE, &mut rng);

        assert!((volume[0] + 2.0).abs() < 1e-4);
        assert!((volume[124] - 10.4).abs() < 1e-3);
        // γ > 1 darkens the midtones.
        assert!(volume[62] < 62.0 / 10.0 - 2.0);
    }

    #[test]
    fn training_pipeline_has_three_transforms() {
        let pipeline = Compose::training();
        assert_eq!(pipeline.len(), 3);

        let mut rng = StdRng::seed_from_u64(1);
        let mut volume = vec![1.0; 125];
        pipeline.apply(&mut volume, CUBE, &mut rng);
        assert!(volume.iter().all(|v| v.is_finite()));
    }
}
