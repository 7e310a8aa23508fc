use ndarray::prelude::*;

use crate::{
    ParamId, ParamStore, Result,
    init::{ConstWeightGen, WeightGen},
};

/// Row-wise layer normalization with a learned affine transform.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    w: ParamId,
    b: ParamId,
    dim: usize,
    eps: f32,

    // Forward metadata
    xhat: Array2<f32>,
    inv_std: Array1<f32>,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f32 = 1e-6;

    /// Creates a new `LayerNorm` with unit scale and zero shift.
    ///
    /// # Arguments
    /// * `store` - Where to register `{prefix}.weight` and `{prefix}.bias`.
    /// * `prefix` - The dotted name of this layer.
    /// * `dim` - The size of the normalized rows.
    pub fn new(store: &mut ParamStore, prefix: &str, dim: usize) -> Result<Self> {
        let w = store.register(
            format!("{prefix}.weight"),
            &[dim],
            ConstWeightGen(1.0).sample(dim),
        )?;
        let b = store.register(
            format!("{prefix}.bias"),
            &[dim],
            ConstWeightGen(0.0).sample(dim),
        )?;

        Ok(Self {
            w,
            b,
            dim,
            eps: Self::DEFAULT_EPS,
            xhat: Array2::zeros((0, dim)),
            inv_std: Array1::zeros(0),
        })
    }

    pub fn forward(&mut self, store: &ParamStore, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let gamma = store.get(self.w).view1();
        let beta = store.get(self.b).view1();
        let n = self.dim as f32;

        let mut xhat = x.to_owned();
        let mut inv_std = Array1::zeros(x.nrows());

        for (mut row, inv) in xhat.rows_mut().into_iter().zip(inv_std.iter_mut()) {
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            *inv = 1.0 / (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) * *inv);
        }

        let y = &xhat * &gamma + &beta;
        self.xhat = xhat;
        self.inv_std = inv_std;
        Ok(y)
    }

    pub fn backward(&mut self, store: &mut ParamStore, d: ArrayView2<f32>) -> Result<Array2<f32>> {
        {
            let mut dgamma = ArrayViewMut1::from(store.get_mut(self.w).grad_mut());
            dgamma += &(&d * &self.xhat).sum_axis(Axis(0));
        }
        {
            let mut dbeta = ArrayViewMut1::from(store.get_mut(self.b).grad_mut());
            dbeta += &d.sum_axis(Axis(0));
        }

        let gamma = store.get(self.w).view1();
        let n = self.dim as f32;
        let mut dx = &d * &gamma;

        for ((mut row, xhat), &inv) in dx
            .rows_mut()
            .into_iter()
            .zip(self.xhat.rows())
            .zip(self.inv_std.iter())
        {
            let sum = row.sum();
            let dot = row.dot(&xhat);
            row.zip_mut_with(&xhat, |g, &xh| *g = inv / n * (n * *g - sum - xh * dot));
        }

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_rows() {
        let mut store = ParamStore::new();
        let mut ln = LayerNorm::new(&mut store, "norm", 4).unwrap();
        let x = array![[1.0, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 10.0]];
        let y = ln.forward(&store, x.view()).unwrap();

        let mean = y.row(0).sum() / 4.0;
        let var = y.row(0).iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-4);
        assert!(y.row(1).iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn input_grad_sums_to_zero() {
        let mut store = ParamStore::new();
        let mut ln = LayerNorm::new(&mut store, "norm", 3).unwrap();
        let x = array![[0.3, -1.2, 2.0]];
        ln.forward(&store, x.view()).unwrap();

        let dx = ln.backward(&mut store, array![[1.0, 2.0, -0.5]].view()).unwrap();
        assert!(dx.sum().abs() < 1e-5);
        assert_eq!(store.by_name("norm.bias").unwrap().grad(), &[1.0, 2.0, -0.5]);
    }
}
