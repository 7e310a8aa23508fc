mod bce;
mod criterion;
mod cross_entropy;
mod loss_fn;
mod mse;

pub use bce::BceWithLogits;
pub use criterion::{Criterion, TaskMode};
pub use cross_entropy::{CrossEntropy, LabelSmoothingCrossEntropy, SoftTargetCrossEntropy, log_softmax};
pub use loss_fn::LossFn;
pub use mse::Mse;
