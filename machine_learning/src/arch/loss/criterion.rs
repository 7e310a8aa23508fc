use std::fmt;

use ndarray::{Array2, ArrayView2};

use super::{
    BceWithLogits, CrossEntropy, LabelSmoothingCrossEntropy, LossFn, Mse, SoftTargetCrossEntropy,
};

/// What the head's outputs mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// One logit per class, a single integer class target.
    MultiClass,
    /// One logit per independent indicator.
    Binary,
    /// Continuous targets.
    Regression,
}

impl TaskMode {
    /// Resolves the task from the two run flags, `binary` wins over `regression`.
    pub fn from_flags(binary: bool, regression: bool) -> Self {
        match (binary, regression) {
            (true, _) => TaskMode::Binary,
            (false, true) => TaskMode::Regression,
            (false, false) => TaskMode::MultiClass,
        }
    }

    pub fn is_classification(self) -> bool {
        self != TaskMode::Regression
    }
}

/// The training objective, chosen once from the task and regularization settings.
#[derive(Debug, Clone)]
pub enum Criterion {
    CrossEntropy(CrossEntropy),
    LabelSmoothing(LabelSmoothingCrossEntropy),
    SoftTarget(SoftTargetCrossEntropy),
    Bce(BceWithLogits),
    Mse(Mse),
}

impl Criterion {
    /// Selects the criterion for a run.
    ///
    /// | task        | mixup | smoothing | criterion            |
    /// |-------------|-------|-----------|----------------------|
    /// | binary      | any   | any       | BCE with logits      |
    /// | regression  | any   | any       | MSE                  |
    /// | multi-class | yes   | any       | soft-target CE       |
    /// | multi-class | no    | > 0       | label-smoothing CE   |
    /// | multi-class | no    | 0         | CE                   |
    ///
    /// # Arguments
    /// * `task` - The task mode.
    /// * `mixup_active` - Whether mixup or cutmix rewrites the targets.
    /// * `smoothing` - The label smoothing factor.
    /// * `pos_weight` - Per-output positive weights for the binary task.
    pub fn select(
        task: TaskMode,
        mixup_active: bool,
        smoothing: f32,
        pos_weight: Option<Vec<f32>>,
    ) -> Self {
        match task {
            TaskMode::Binary => Criterion::Bce(BceWithLogits::new(pos_weight)),
            TaskMode::Regression => Criterion::Mse(Mse),
            TaskMode::MultiClass if mixup_active => Criterion::SoftTarget(SoftTargetCrossEntropy),
            TaskMode::MultiClass if smoothing > 0.0 => {
                Criterion::LabelSmoothing(LabelSmoothingCrossEntropy::new(smoothing))
            }
            TaskMode::MultiClass => Criterion::CrossEntropy(CrossEntropy),
        }
    }

    fn inner(&self) -> &dyn LossFn {
        match self {
            Criterion::CrossEntropy(l) => l,
            Criterion::LabelSmoothing(l) => l,
            Criterion::SoftTarget(l) => l,
            Criterion::Bce(l) => l,
            Criterion::Mse(l) => l,
        }
    }
}

impl LossFn for Criterion {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        self.inner().loss(y_pred, y)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        self.inner().loss_prime(y_pred, y)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::CrossEntropy(_) => write!(f, "CrossEntropyLoss()"),
            Criterion::LabelSmoothing(l) => {
                write!(f, "LabelSmoothingCrossEntropy(smoothing={})", l.smoothing())
            }
            Criterion::SoftTarget(_) => write!(f, "SoftTargetCrossEntropy()"),
            Criterion::Bce(l) => match l.pos_weight() {
                Some(w) => write!(f, "BCEWithLogitsLoss(pos_weight={w:?})"),
                None => write!(f, "BCEWithLogitsLoss()"),
            },
            Criterion::Mse(_) => write!(f, "MSELoss()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_flags_precedence() {
        assert_eq!(TaskMode::from_flags(true, true), TaskMode::Binary);
        assert_eq!(TaskMode::from_flags(false, true), TaskMode::Regression);
        assert_eq!(TaskMode::from_flags(false, false), TaskMode::MultiClass);
    }

    #[test]
    fn decision_table() {
        use TaskMode::*;

        for mixup in [false, true] {
            for smoothing in [0.0, 0.1] {
                assert!(matches!(
                    Criterion::select(Binary, mixup, smoothing, None),
                    Criterion::Bce(_)
                ));
                assert!(matches!(
                    Criterion::select(Regression, mixup, smoothing, None),
                    Criterion::Mse(_)
                ));
            }
        }

        assert!(matches!(
            Criterion::select(MultiClass, true, 0.1, None),
            Criterion::SoftTarget(_)
        ));
        assert!(matches!(
            Criterion::select(MultiClass, true, 0.0, None),
            Criterion::SoftTarget(_)
        ));
        assert!(matches!(
            Criterion::select(MultiClass, false, 0.1, None),
            Criterion::LabelSmoothing(_)
        ));
        assert!(matches!(
            Criterion::select(MultiClass, false, 0.0, None),
            Criterion::CrossEntropy(_)
        ));
    }

    #[test]
    fn pos_weight_reaches_bce() {
        let criterion = Criterion::select(TaskMode::Binary, false, 0.1, Some(vec![0.67]));
        match &criterion {
            Criterion::Bce(bce) => assert_eq!(bce.pos_weight(), Some(&[0.67][..])),
            other => panic!("unexpected criterion {other}"),
        }
        assert_eq!(criterion.to_string(), "BCEWithLogitsLoss(pos_weight=[0.67])");
    }
}
