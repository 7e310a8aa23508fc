mod adamw;
mod clip;
mod optimizer;
mod param_groups;
mod scaler;
mod schedule;

pub use adamw::{AdamW, Moments};
pub use clip::clip_grad_norm;
pub use optimizer::Optimizer;
pub use param_groups::{ParamGroup, layer_id, param_groups_lrd};
pub use scaler::{LossScaler, StepOutcome};
pub use schedule::CosineSchedule;
