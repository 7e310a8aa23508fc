use ndarray::prelude::*;
use rand::Rng;
use rayon::prelude::*;

use super::Dense;
use crate::{MlErr, ParamStore, Result};

/// Multi-head self attention over a batch of token sequences.
///
/// Inputs are `[batch · tokens, dim]` with the tokens of each sample stored
/// contiguously.
#[derive(Debug, Clone)]
pub struct Attention {
    qkv: Dense,
    proj: Dense,
    num_heads: usize,
    head_dim: usize,
    scale: f32,

    // Forward metadata
    batch: usize,
    qkv_out: Array2<f32>,
    probs: Vec<Array2<f32>>,
}

impl Attention {
    /// Creates a new `Attention` layer.
    ///
    /// # Arguments
    /// * `store` - Where to register `{prefix}.qkv.*` and `{prefix}.proj.*`.
    /// * `prefix` - The dotted name of this layer.
    /// * `dim` - The embedding size, must be divisible by `num_heads`.
    /// * `num_heads` - The amount of attention heads.
    /// * `rng` - The random number generator used for the weights.
    pub fn new<R: Rng>(
        store: &mut ParamStore,
        prefix: &str,
        dim: usize,
        num_heads: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(MlErr::InvalidHyperParam {
                name: "num_heads",
                reason: format!("{num_heads} heads do not divide the embedding size {dim}"),
            });
        }

        let head_dim = dim / num_heads;

        Ok(Self {
            qkv: Dense::new(store, &format!("{prefix}.qkv"), (dim, 3 * dim), rng, 0.02)?,
            proj: Dense::new(store, &format!("{prefix}.proj"), (dim, dim), rng, 0.02)?,
            num_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
            batch: 0,
            qkv_out: Array2::zeros((0, 3 * dim)),
            probs: Vec::new(),
        })
    }

    fn dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Returns the column ranges of the query, key and value of `head`.
    fn head_cols(&self, head: usize) -> [std::ops::Range<usize>; 3] {
        let dim = self.dim();
        let start = head * self.head_dim;
        let end = start + self.head_dim;
        [start..end, dim + start..dim + end, 2 * dim + start..2 * dim + end]
    }

    pub fn forward(
        &mut self,
        store: &ParamStore,
        x: ArrayView2<f32>,
        batch: usize,
    ) -> Result<Array2<f32>> {
        let tokens = x.nrows() / batch.max(1);
        let qkv = self.qkv.forward(store, x)?;

        let heads: Vec<_> = (0..batch * self.num_heads)
            .into_par_iter()
            .map(|i| {
                let (b, h) = (i / self.num_heads, i % self.num_heads);
                let rows = b * tokens..(b + 1) * tokens;
                let [qc, kc, vc] = self.head_cols(h);

                let q = qkv.slice(s![rows.clone(), qc]);
                let k = qkv.slice(s![rows.clone(), kc]);
                let v = qkv.slice(s![rows, vc]);

                let mut p = q.dot(&k.t()) * self.scale;
                softmax_rows(&mut p);
                let o = p.dot(&v);
                (p, o)
            })
            .collect();

        let mut out = Array2::zeros((x.nrows(), self.dim()));
        let mut probs = Vec::with_capacity(heads.len());

        for (i, (p, o)) in heads.into_iter().enumerate() {
            let (b, h) = (i / self.num_heads, i % self.num_heads);
            let [qc, _, _] = self.head_cols(h);
            out.slice_mut(s![b * tokens..(b + 1) * tokens, qc]).assign(&o);
            probs.push(p);
        }

        self.batch = batch;
        self.qkv_out = qkv;
        self.probs = probs;

        self.proj.forward(store, out.view())
    }

    pub fn backward(&mut self, store: &mut ParamStore, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        let dout = self.proj.backward(store, d)?;
        let tokens = dout.nrows() / self.batch.max(1);
        let qkv = &self.qkv_out;

        let grads: Vec<_> = (0..self.batch * self.num_heads)
            .into_par_iter()
            .map(|i| {
                let (b, h) = (i / self.num_heads, i % self.num_heads);
                let rows = b * tokens..(b + 1) * tokens;
                let [qc, kc, vc] = self.head_cols(h);

                let q = qkv.slice(s![rows.clone(), qc.clone()]);
                let k = qkv.slice(s![rows.clone(), kc]);
                let v = qkv.slice(s![rows.clone(), vc]);
                let dout = dout.slice(s![rows, qc]);
                let p = &self.probs[i];

                let dv = p.t().dot(&dout);
                let dp = dout.dot(&v.t());

                let mut ds = &dp * p;
                let row_sums = ds.sum_axis(Axis(1)).insert_axis(Axis(1));
                ds = p * &(&dp - &row_sums);

                let dq = ds.dot(&k) * self.scale;
                let dk = ds.t().dot(&q) * self.scale;
                (dq, dk, dv)
            })
            .collect();

        let mut dqkv = Array2::zeros(self.qkv_out.raw_dim());

        for (i, (dq, dk, dv)) in grads.into_iter().enumerate() {
            let (b, h) = (i / self.num_heads, i % self.num_heads);
            let rows = b * tokens..(b + 1) * tokens;
            let [qc, kc, vc] = self.head_cols(h);

            dqkv.slice_mut(s![rows.clone(), qc]).assign(&dq);
            dqkv.slice_mut(s![rows.clone(), kc]).assign(&dk);
            dqkv.slice_mut(s![rows, vc]).assign(&dv);
        }

        self.qkv.backward(store, dqkv.view())
    }
}

/// Numerically stable softmax over every row of `x`, in place.
pub fn softmax_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}
