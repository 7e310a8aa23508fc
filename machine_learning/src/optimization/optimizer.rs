use crate::{ParamStore, Result};

pub trait Optimizer {
    /// Updates the parameters in `store` from their current gradients.
    fn step(&mut self, store: &mut ParamStore) -> Result<()>;

    /// Sets the base learning rate, every group applies its own scale on top.
    fn set_lr(&mut self, lr: f32);

    /// The learning rate of the group with the largest scale.
    fn max_lr(&self) -> f32;
}
