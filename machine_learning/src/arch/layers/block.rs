use ndarray::prelude::*;
use rand::Rng;

use super::{Attention, Dense, DropPath, Gelu, LayerNorm};
use crate::{ParamStore, Result};

/// A pre-norm transformer encoder block.
///
/// `x + drop_path(attn(norm1(x)))` followed by `x + drop_path(mlp(norm2(x)))`.
#[derive(Debug, Clone)]
pub struct Block {
    norm1: LayerNorm,
    attn: Attention,
    drop_path1: DropPath,
    norm2: LayerNorm,
    fc1: Dense,
    act: Gelu,
    fc2: Dense,
    drop_path2: DropPath,
}

impl Block {
    /// Creates a new `Block`.
    ///
    /// # Arguments
    /// * `store` - Where to register the block's parameters.
    /// * `prefix` - The dotted name of this block, e.g. `blocks.3`.
    /// * `dim` - The embedding size.
    /// * `num_heads` - The amount of attention heads.
    /// * `mlp_ratio` - The hidden size of the MLP relative to `dim`.
    /// * `drop_path` - The stochastic depth probability of both branches.
    /// * `rng` - The random number generator used for the weights.
    pub fn new<R: Rng>(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        num_heads: usize,
        mlp_ratio: f32,
        drop_path: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let hidden = (dim as f32 * mlp_ratio) as usize;

        Ok(Self {
            norm1: LayerNorm::new(store, &format!("{prefix}.norm1"), dim)?,
            attn: Attention::new(store, &format!("{prefix}.attn"), dim, num_heads, rng)?,
            drop_path1: DropPath::new(drop_path),
            norm2: LayerNorm::new(store, &format!("{prefix}.norm2"), dim)?,
            fc1: Dense::new(store, &format!("{prefix}.mlp.fc1"), (dim, hidden), rng, 0.02)?,
            act: Gelu::new(),
            fc2: Dense::new(store, &format!("{prefix}.mlp.fc2"), (hidden, dim), rng, 0.02)?,
            drop_path2: DropPath::new(drop_path),
        })
    }

    pub fn drop_path(&self) -> f32 {
        self.drop_path1.prob()
    }

    pub fn forward<R: Rng>(
        &mut self,
        store: &ParamStore,
        x: Array2<f32>,
        batch: usize,
        train: bool,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        let h = self.norm1.forward(store, x.view())?;
        let h = self.attn.forward(store, h.view(), batch)?;
        let x = x + self.drop_path1.forward(h, batch, train, rng);

        let h = self.norm2.forward(store, x.view())?;
        let h = self.fc1.forward(store, h.view())?;
        let h = self.act.forward(h);
        let h = self.fc2.forward(store, h.view())?;
        Ok(x + self.drop_path2.forward(h, batch, train, rng))
    }

    pub fn backward(&mut self, store: &mut ParamStore, d: Array2<f32>) -> Result<Array2<f32>> {
        let dh = self.drop_path2.backward(d.clone());
        let dh = self.fc2.backward(store, dh.view())?;
        let dh = self.act.backward(dh);
        let dh = self.fc1.backward(store, dh.view())?;
        let dh = self.norm2.backward(store, dh.view())?;
        let d = d + dh;

        let dh = self.drop_path1.backward(d.clone());
        let dh = self.attn.backward(store, dh.view())?;
        let dh = self.norm1.backward(store, dh.view())?;
        Ok(d + dh)
    }
}
