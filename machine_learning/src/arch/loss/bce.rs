use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Binary cross entropy on logits, averaged over every output element.
///
/// With `pos_weight` the positive term of output `j` is scaled by `pos_weight[j]`.
#[derive(Debug, Default, Clone)]
pub struct BceWithLogits {
    pos_weight: Option<Vec<f32>>,
}

impl BceWithLogits {
    pub fn new(pos_weight: Option<Vec<f32>>) -> Self {
        Self { pos_weight }
    }

    pub fn pos_weight(&self) -> Option<&[f32]> {
        self.pos_weight.as_deref()
    }

    fn weight(&self, col: usize) -> f32 {
        self.pos_weight
            .as_ref()
            .and_then(|w| w.get(col).or(w.last()))
            .copied()
            .unwrap_or(1.0)
    }
}

impl LossFn for BceWithLogits {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let mut total = 0.0;

        Zip::indexed(&y_pred).and(&y).for_each(|(_, j), &x, &t| {
            total += self.weight(j) * t * softplus(-x) + (1.0 - t) * softplus(x);
        });

        total / y_pred.len().max(1) as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let n = y_pred.len().max(1) as f32;
        let mut grad = Array2::zeros(y_pred.raw_dim());

        Zip::indexed(&mut grad)
            .and(&y_pred)
            .and(&y)
            .for_each(|(_, j), g, &x, &t| {
                let s = sigmoid(x);
                *g = (self.weight(j) * t * (s - 1.0) + (1.0 - t) * s) / n;
            });

        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn zero_logits_cost_ln2() {
        let loss = BceWithLogits::default().loss(
            Array2::zeros((2, 1)).view(),
            array![[1.0], [0.0]].view(),
        );
        assert!((loss - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn pos_weight_scales_positive_term() {
        let x = array![[0.3, -0.2]];
        let y = array![[1.0, 1.0]];
        let plain = BceWithLogits::default().loss(x.view(), y.view());
        let weighted = BceWithLogits::new(Some(vec![2.0, 2.0])).loss(x.view(), y.view());
        assert!((weighted - 2.0 * plain).abs() < 1e-6);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let bce = BceWithLogits::new(Some(vec![0.67, 4.0]));
        let x = array![[0.3, -1.2], [2.0, 0.1]];
        let y = array![[1.0, 0.0], [0.0, 1.0]];
        let grad = bce.loss_prime(x.view(), y.view());

        let h = 1e-3;
        for idx in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let mut plus = x.clone();
            plus[idx] += h;
            let mut minus = x.clone();
            minus[idx] -= h;
            let fd = (bce.loss(plus.view(), y.view()) - bce.loss(minus.view(), y.view())) / (2.0 * h);
            assert!((fd - grad[idx]).abs() < 1e-3);
        }
    }

    #[test]
    fn extreme_logits_stay_finite() {
        let loss = BceWithLogits::default().loss(
            array![[200.0, -200.0]].view(),
            array![[0.0, 1.0]].view(),
        );
        assert!(loss.is_finite());
        assert!((loss - 200.0).abs() < 1e-3);
    }
}
