use ndarray::prelude::*;

use super::LossFn;

/// Row-wise `log(softmax(x))`.
pub fn log_softmax(x: ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row -= max;
        let lse = row.mapv(f32::exp).sum().ln();
        row -= lse;
    }
    out
}

/// The class index stored in the first column of each target row.
fn class_of(y: ArrayView1<f32>, nb_classes: usize) -> usize {
    (y[0].max(0.0) as usize).min(nb_classes.saturating_sub(1))
}

/// Cross entropy between logits and integer class targets.
///
/// Targets are `[batch, 1]` holding the class index.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        LabelSmoothingCrossEntropy::new(0.0).loss(y_pred, y)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        LabelSmoothingCrossEntropy::new(0.0).loss_prime(y_pred, y)
    }
}

/// Cross entropy against targets smoothed towards the uniform distribution,
/// `(1 - s) · nll + s · mean(-log p)`.
#[derive(Debug, Clone, Copy)]
pub struct LabelSmoothingCrossEntropy {
    smoothing: f32,
}

impl LabelSmoothingCrossEntropy {
    pub fn new(smoothing: f32) -> Self {
        Self { smoothing }
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }
}

impl LossFn for LabelSmoothingCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let logp = log_softmax(y_pred);
        let c = y_pred.ncols();
        let s = self.smoothing;

        let total: f32 = logp
            .rows()
            .into_iter()
            .zip(y.rows())
            .map(|(lp, t)| {
                let nll = -lp[class_of(t, c)];
                let smooth = -lp.mean().unwrap_or_default();
                (1.0 - s) * nll + s * smooth
            })
            .sum();

        total / y_pred.nrows().max(1) as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let mut grad = log_softmax(y_pred).mapv_into(f32::exp);
        let (b, c) = grad.dim();
        let s = self.smoothing;

        for (mut row, t) in grad.rows_mut().into_iter().zip(y.rows()) {
            row -= s / c as f32;
            row[class_of(t, c)] -= 1.0 - s;
        }

        grad / b.max(1) as f32
    }
}

/// Cross entropy against dense probability targets, as produced by mixup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftTargetCrossEntropy;

impl LossFn for SoftTargetCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let logp = log_softmax(y_pred);
        -(&logp * &y).sum() / y_pred.nrows().max(1) as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let p = log_softmax(y_pred).mapv_into(f32::exp);
        let mass = y.sum_axis(Axis(1)).insert_axis(Axis(1));
        (&p * &mass - &y) / y_pred.nrows().max(1) as f32
    }
}
