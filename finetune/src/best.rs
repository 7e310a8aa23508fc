use machine_learning::arch::loss::TaskMode;

use crate::engine::EvalStats;

/// The best validation metrics seen so far in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMetrics {
    pub best_val_loss: f32,
    pub best_auc: f32,
    pub best_accuracy: f32,
}

impl Default for BestMetrics {
    fn default() -> Self {
        Self {
            best_val_loss: f32::INFINITY,
            best_auc: 0.0,
            best_accuracy: 0.0,
        }
    }
}

impl BestMetrics {
    /// Folds a validation run into the record.
    ///
    /// The loss is always tracked, the accuracy for classification tasks and
    /// the AUC for binary ones. Only strict improvements count.
    ///
    /// # Returns
    /// The names of the metrics that improved, empty when nothing did.
    pub fn update(&mut self, stats: &EvalStats, task: TaskMode) -> Vec<&'static str> {
        let mut improved = Vec::new();

        if stats.loss < self.best_val_loss {
            self.best_val_loss = stats.loss;
            improved.push("loss");
        }

        if task.is_classification()
            && let Some(acc) = stats.acc1
            && acc > self.best_accuracy
        {
            self.best_accuracy = acc;
            improved.push("accuracy");
        }

        if task == TaskMode::Binary
            && let Some(auc) = stats.auc
            && auc > self.best_auc
        {
            self.best_auc = auc;
            improved.push("auc");
        }

        improved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(loss: f32, acc1: f32, auc: Option<f32>) -> EvalStats {
        EvalStats {
            loss,
            acc1: Some(acc1),
            auc,
            ..EvalStats::default()
        }
    }

    #[test]
    fn first_validation_improves_from_infinity() {
        let mut best = BestMetrics::default();
        let improved = best.update(&stats(0.7, 50.0, Some(0.6)), TaskMode::Binary);

        assert_eq!(improved, vec!["loss", "accuracy", "auc"]);
        assert_eq!(best.best_val_loss, 0.7);
    }

    #[test]
    fn record_is_monotonic_and_strict() {
        let mut best = BestMetrics::default();
        best.update(&stats(0.5, 60.0, Some(0.8)), TaskMode::Binary);

        let improved = best.update(&stats(0.5, 55.0, Some(0.9)), TaskMode::Binary);
        assert_eq!(improved, vec!["auc"]);
        assert_eq!(best.best_val_loss, 0.5);
        assert_eq!(best.best_accuracy, 60.0);

        assert!(best.update(&stats(0.9, 10.0, None), TaskMode::Binary).is_empty());
        assert_eq!(best.best_auc, 0.9);
    }

    #[test]
    fn regression_only_tracks_loss() {
        let mut best = BestMetrics::default();
        let improved = best.update(&stats(2.0, 0.0, None), TaskMode::Regression);
        assert_eq!(improved, vec!["loss"]);

        assert!(best.update(&stats(3.0, 99.0, Some(1.0)), TaskMode::Regression).is_empty());
        assert_eq!(best.best_accuracy, 0.0);
        assert_eq!(best.best_auc, 0.0);
    }
}
