use log::debug;

use super::{Optimizer, clip_grad_norm};
use crate::{ParamStore, Result};

/// What happened at an optimizer step boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// The unscaled global gradient norm before clipping.
    pub grad_norm: f32,
    /// Whether the step was skipped because a gradient was not finite.
    pub skipped: bool,
}

/// Dynamic loss scaling.
///
/// The backward seed is multiplied by `scale`, at every step boundary the
/// gradients are divided back. A non finite gradient skips the step and backs
/// the scale off, `growth_interval` clean steps in a row grow it.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u32,
    growth_tracker: u32,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new(65536.0, 2.0, 0.5, 2000)
    }
}

impl LossScaler {
    pub fn new(init_scale: f32, growth_factor: f32, backoff_factor: f32, growth_interval: u32) -> Self {
        Self {
            scale: init_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            growth_tracker: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn growth_tracker(&self) -> u32 {
        self.growth_tracker
    }

    /// Restores a previously saved state.
    pub fn load_state(&mut self, scale: f32, growth_tracker: u32) {
        self.scale = scale;
        self.growth_tracker = growth_tracker;
    }

    /// Unscales the gradients, clips them if asked to and steps the optimizer.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer to step.
    /// * `store` - The parameters holding scaled gradients.
    /// * `clip_grad` - The maximum global gradient norm, if any.
    ///
    /// # Returns
    /// The step's outcome, the optimizer is not touched when it was skipped.
    pub fn step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        store: &mut ParamStore,
        clip_grad: Option<f32>,
    ) -> Result<StepOutcome> {
        store.scale_grads(1.0 / self.scale);

        if !store.grads_finite() {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            debug!("non finite gradients, skipping step and backing the loss scale off to {}", self.scale);

            return Ok(StepOutcome {
                grad_norm: f32::INFINITY,
                skipped: true,
            });
        }

        let grad_norm = match clip_grad {
            Some(max_norm) => clip_grad_norm(store, max_norm),
            None => store.grad_norm(),
        };

        optimizer.step(store)?;

        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }

        Ok(StepOutcome {
            grad_norm,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingOptimizer {
        steps: usize,
        seen: Vec<f32>,
    }

    impl Optimizer for CountingOptimizer {
        fn step(&mut self, store: &mut ParamStore) -> Result<()> {
            self.steps += 1;
            self.seen = store.flat_grads();
            Ok(())
        }

        fn set_lr(&mut self, _lr: f32) {}

        fn max_lr(&self) -> f32 {
            0.0
        }
    }

    fn store(grad: &[f32]) -> ParamStore {
        let mut store = ParamStore::new();
        store.register("w", &[grad.len()], vec![0.0; grad.len()]).unwrap();
        store.get_mut(0).grad_mut().copy_from_slice(grad);
        store
    }

    #[test]
    fn unscales_before_stepping() {
        let mut scaler = LossScaler::default();
        let mut opt = CountingOptimizer::default();
        let mut store = store(&[3.0 * 65536.0, 4.0 * 65536.0]);

        let outcome = scaler.step(&mut opt, &mut store, None).unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.grad_norm, 5.0);
        assert_eq!(opt.seen, vec![3.0, 4.0]);
    }

    #[test]
    fn skips_and_backs_off_on_inf() {
        let mut scaler = LossScaler::default();
        let mut opt = CountingOptimizer::default();
        let mut store = store(&[f32::INFINITY, 1.0]);

        let outcome = scaler.step(&mut opt, &mut store, Some(1.0)).unwrap();
        assert!(outcome.skipped);
        assert_eq!(opt.steps, 0);
        assert_eq!(scaler.scale(), 32768.0);
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = LossScaler::new(8.0, 2.0, 0.5, 3);
        let mut opt = CountingOptimizer::default();

        for _ in 0..3 {
            let mut store = store(&[1.0]);
            scaler.step(&mut opt, &mut store, None).unwrap();
        }

        assert_eq!(scaler.scale(), 16.0);
        assert_eq!(scaler.growth_tracker(), 0);
        assert_eq!(opt.steps, 3);
    }

    #[test]
    fn clipping_reports_preclip_norm() {
        let mut scaler = LossScaler::new(1.0, 2.0, 0.5, 2000);
        let mut opt = CountingOptimizer::default();
        let mut store = store(&[30.0, 40.0]);

        let outcome = scaler.step(&mut opt, &mut store, Some(5.0)).unwrap();
        assert_eq!(outcome.grad_norm, 50.0);
        assert!((store.grad_norm() - 5.0).abs() < 1e-4);
    }
}
