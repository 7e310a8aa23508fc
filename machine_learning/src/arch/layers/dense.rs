use ndarray::{linalg, prelude::*};
use rand::Rng;

use crate::{
    ParamId, ParamStore, Result,
    init::{ConstWeightGen, TruncNormalWeightGen, WeightGen},
};

/// A fully connected layer, `y = x · Wᵀ + b`.
///
/// The weight is stored `[out, in]` so its tensor lines up with the usual
/// checkpoint layout.
#[derive(Debug, Clone)]
pub struct Dense {
    w: ParamId,
    b: ParamId,
    dim: (usize, usize),

    // Forward metadata
    x: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer and registers its parameters.
    ///
    /// # Arguments
    /// * `store` - Where to register `{prefix}.weight` and `{prefix}.bias`.
    /// * `prefix` - The dotted name of this layer.
    /// * `dim` - The `(in, out)` sizes.
    /// * `rng` - The random number generator used for the weights.
    /// * `std_dev` - The standard deviation of the truncated normal weight init.
    pub fn new<R: Rng>(
        store: &mut ParamStore,
        prefix: &str,
        dim: (usize, usize),
        rng: &mut R,
        std_dev: f32,
    ) -> Result<Self> {
        let (fan_in, fan_out) = dim;
        let weights = TruncNormalWeightGen::new(rng, std_dev)?.sample(fan_in * fan_out);
        let w = store.register(format!("{prefix}.weight"), &[fan_out, fan_in], weights)?;
        let b = store.register(
            format!("{prefix}.bias"),
            &[fan_out],
            ConstWeightGen(0.0).sample(fan_out),
        )?;

        Ok(Self::from_params(w, b, dim))
    }

    /// Creates a `Dense` layer over already registered parameters, the weight
    /// may have any shape whose trailing dimensions flatten to `in`.
    pub fn from_params(w: ParamId, b: ParamId, dim: (usize, usize)) -> Self {
        Self {
            w,
            b,
            dim,
            x: Array2::zeros((0, dim.0)),
        }
    }

    pub fn weight(&self) -> ParamId {
        self.w
    }

    pub fn bias(&self) -> ParamId {
        self.b
    }

    /// Returns the `(in, out)` sizes of this layer.
    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Computes the layer's output and keeps `x` for the backward pass.
    ///
    /// # Arguments
    /// * `store` - The parameter storage.
    /// * `x` - The input, one row per token.
    ///
    /// # Returns
    /// The output of shape `[rows, out]`.
    pub fn forward(&mut self, store: &ParamStore, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (fan_in, fan_out) = self.dim;
        let w = store.get(self.w).view2((fan_out, fan_in))?;
        let b = store.get(self.b).view1();

        let mut z = Array2::zeros((x.nrows(), fan_out));
        z += &b;
        linalg::general_mat_mul(1.0, &x, &w.t(), 1.0, &mut z);

        self.x = x.to_owned();
        Ok(z)
    }

    /// Adds this layer's weight and bias gradients for the upstream delta `d`.
    pub fn accumulate_grads(&self, store: &mut ParamStore, d: ArrayView2<f32>) -> Result<()> {
        let (fan_in, fan_out) = self.dim;

        let grad = store.get_mut(self.w).grad_mut();
        let mut dw = ArrayViewMut2::from_shape((fan_out, fan_in), grad)?;
        linalg::general_mat_mul(1.0, &d.t(), &self.x, 1.0, &mut dw);

        let mut db = ArrayViewMut1::from(store.get_mut(self.b).grad_mut());
        db += &d.sum_axis(Axis(0));

        Ok(())
    }

    /// Accumulates the parameter gradients and propagates `d` to the input.
    ///
    /// # Returns
    /// The delta with respect to this layer's input, of shape `[rows, in]`.
    pub fn backward(&mut self, store: &mut ParamStore, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.accumulate_grads(store, d)?;

        let (fan_in, fan_out) = self.dim;
        let w = store.get(self.w).view2((fan_out, fan_in))?;
        let mut dx = Array2::zeros((d.nrows(), fan_in));
        linalg::general_mat_mul(1.0, &d, &w, 0.0, &mut dx);

        Ok(dx)
    }
}
