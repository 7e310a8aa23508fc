use std::cmp::Ordering;

use ndarray::{ArrayView2, Axis, Zip};

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// The percentage of rows whose label is among the `k` largest logits.
///
/// # Arguments
/// * `logits` - The model outputs, `[batch, classes]`.
/// * `labels` - The true class of every row.
/// * `k` - How many of the top predictions count as a hit.
pub fn accuracy_topk(logits: ArrayView2<f32>, labels: &[usize], k: usize) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }

    let hits = logits
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|&(row, &label)| {
            let Some(&target) = row.get(label) else {
                return false;
            };

            // Ties are resolved in favor of the lower class index.
            let above = row
                .iter()
                .enumerate()
                .filter(|&(i, &v)| v > target || (v == target && i < label))
                .count();
            above < k
        })
        .count();

    100.0 * hits as f32 / labels.len() as f32
}

/// The percentage of outputs whose thresholded probability matches its indicator.
///
/// An output is predicted positive when `σ(logit) > 0.5`, a target is positive
/// when it is at least `0.5`.
pub fn binary_accuracy(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
    if logits.is_empty() {
        return 0.0;
    }

    let mut hits = 0usize;
    Zip::from(&logits).and(&targets).for_each(|&x, &t| {
        if (sigmoid(x) > 0.5) == (t >= 0.5) {
            hits += 1;
        }
    });

    100.0 * hits as f32 / logits.len() as f32
}

/// The area under the ROC curve, ties counting half.
///
/// # Returns
/// `None` when the labels hold a single class.
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Option<f64> {
    let n = scores.len();
    if n == 0 || labels.len() != n {
        return None;
    }

    let mut items: Vec<(f32, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| (s, y >= 0.5))
        .collect();
    items.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let pos = items.iter().filter(|(_, y)| *y).count() as f64;
    let neg = n as f64 - pos;
    if pos == 0.0 || neg == 0.0 {
        return None;
    }

    let mut auc_num = 0.0f64;
    let mut neg_cum = 0.0f64;
    for tie in items.chunk_by(|a, b| a.0 == b.0) {
        let pos_sum = tie.iter().filter(|(_, y)| *y).count() as f64;
        let neg_sum = tie.len() as f64 - pos_sum;
        auc_num += pos_sum * neg_cum + 0.5 * pos_sum * neg_sum;
        neg_cum += neg_sum;
    }

    Some(auc_num / (pos * neg))
}

/// The mean ROC-AUC over the output columns that contain both classes.
///
/// # Returns
/// `None` when no column does.
pub fn macro_auc(logits: ArrayView2<f32>, targets: ArrayView2<f32>) -> Option<f32> {
    let aucs: Vec<f64> = logits
        .axis_iter(Axis(1))
        .zip(targets.axis_iter(Axis(1)))
        .filter_map(|(scores, labels)| roc_auc(&scores.to_vec(), &labels.to_vec()))
        .collect();

    (!aucs.is_empty()).then(|| (aucs.iter().sum::<f64>() / aucs.len() as f64) as f32)
}

pub fn mean_absolute_error(y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
    if y_pred.is_empty() {
        return 0.0;
    }

    (&y_pred - &y).mapv(f32::abs).sum() / y_pred.len() as f32
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn topk_counts_hits() {
        let logits = array![[0.1, 0.9, 0.0], [0.8, 0.1, 0.5], [0.2, 0.3, 0.4]];
        let labels = [1, 2, 0];

        assert!((accuracy_topk(logits.view(), &labels, 1) - 100.0 / 3.0).abs() < 1e-4);
        assert!((accuracy_topk(logits.view(), &labels, 2) - 200.0 / 3.0).abs() < 1e-4);
        assert_eq!(accuracy_topk(logits.view(), &labels, 3), 100.0);
    }

    #[test]
    fn binary_accuracy_is_elementwise() {
        let logits = array![[2.0, -1.0], [-3.0, 0.5]];
        let targets = array![[1.0, 0.0], [1.0, 1.0]];
        assert_eq!(binary_accuracy(logits.view(), targets.view()), 75.0);
    }

    #[test]
    fn auc_perfect_random_and_ties() {
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &[0.0, 0.0, 1.0, 1.0]), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &[0.0, 0.0, 1.0, 1.0]), Some(0.0));
        assert_eq!(roc_auc(&[0.5, 0.5], &[0.0, 1.0]), Some(0.5));
        assert_eq!(roc_auc(&[0.1, 0.2], &[1.0, 1.0]), None);
    }

    #[test]
    fn macro_auc_skips_single_class_columns() {
        let logits = array![[0.1, 3.0], [0.9, 2.0], [0.4, 1.0]];
        let targets = array![[0.0, 1.0], [1.0, 1.0], [0.0, 1.0]];
        assert_eq!(macro_auc(logits.view(), targets.view()), Some(1.0));

        let targets = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        assert_eq!(macro_auc(logits.view(), targets.view()), None);
    }

    #[test]
    fn mae() {
        let pred = array![[1.0], [2.0]];
        let y = array![[0.5], [3.0]];
        assert_eq!(mean_absolute_error(pred.view(), y.view()), 0.75);
    }
}
