use ndarray::prelude::*;
use rand::Rng;

/// Stochastic depth: drops whole residual branches per sample while training.
#[derive(Debug, Clone)]
pub struct DropPath {
    prob: f32,
    mask: Option<Vec<f32>>,
}

impl DropPath {
    /// Creates a new `DropPath` that drops a sample's branch with probability `prob`.
    pub fn new(prob: f32) -> Self {
        Self { prob, mask: None }
    }

    pub fn prob(&self) -> f32 {
        self.prob
    }

    /// Scales the rows of each sample by either `0` or `1 / keep_prob`.
    ///
    /// # Arguments
    /// * `x` - The branch output, `x.nrows()` must be a multiple of `batch`.
    /// * `batch` - The amount of samples in `x`.
    /// * `train` - Outside training this is the identity.
    /// * `rng` - The random number generator used to draw the mask.
    pub fn forward<R: Rng>(
        &mut self,
        mut x: Array2<f32>,
        batch: usize,
        train: bool,
        rng: &mut R,
    ) -> Array2<f32> {
        if !train || self.prob <= 0.0 || batch == 0 {
            self.mask = None;
            return x;
        }

        let keep = 1.0 - self.prob;
        let mask: Vec<f32> = (0..batch)
            .map(|_| if rng.random::<f32>() < keep { 1.0 / keep } else { 0.0 })
            .collect();

        Self::apply(&mut x, &mask);
        self.mask = Some(mask);
        x
    }

    pub fn backward(&mut self, mut d: Array2<f32>) -> Array2<f32> {
        if let Some(mask) = &self.mask {
            Self::apply(&mut d, mask);
        }
        d
    }

    fn apply(x: &mut Array2<f32>, mask: &[f32]) {
        let rows = x.nrows() / mask.len();
        for (mut chunk, &scale) in x.axis_chunks_iter_mut(Axis(0), rows.max(1)).zip(mask) {
            chunk *= scale;
        }
    }
}
