use std::collections::HashSet;

use ndarray::{Array2, ArrayView2};

use crate::{ParamStore, Result};

pub trait Model {
    /// Returns the model's trainable parameters.
    fn params(&self) -> &ParamStore;

    /// Returns the model's trainable parameters mutably.
    fn params_mut(&mut self) -> &mut ParamStore;

    /// Computes the model's output for a batch.
    ///
    /// # Arguments
    /// * `x` - The batch, one flattened sample per row.
    /// * `train` - Whether training-only behavior such as stochastic depth is active.
    ///
    /// # Returns
    /// The logits, one row per sample.
    fn forward(&mut self, x: ArrayView2<f32>, train: bool) -> Result<Array2<f32>>;

    /// Back propagates the delta of the last `forward` output and **adds** the
    /// result onto the parameters' gradients.
    ///
    /// # Arguments
    /// * `d` - The derivative of the loss with respect to the last output.
    fn backward(&mut self, d: ArrayView2<f32>) -> Result<()>;

    /// The amount of transformer blocks, used to assign layer ids.
    fn depth(&self) -> usize;

    /// Names of the parameters that are never weight decayed.
    fn no_weight_decay(&self) -> HashSet<String>;

    /// The amount of trainable scalars.
    fn n_parameters(&self) -> usize {
        self.params().n_parameters()
    }
}
