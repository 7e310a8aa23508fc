use rayon::prelude::*;

use super::{Optimizer, ParamGroup};
use crate::{MlErr, ParamStore, Result};

/// The first and second moment estimates of one parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Moments {
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

/// Adam with decoupled weight decay over parameter groups.
#[derive(Debug, Clone)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    step: u64,
    /// Indexed by `ParamId`.
    moments: Vec<Moments>,
    /// `(lr, weight_decay)` indexed by `ParamId`.
    hyper: Vec<(f32, f32)>,
}

impl AdamW {
    pub const BETAS: (f32, f32) = (0.9, 0.999);
    pub const EPSILON: f32 = 1e-8;

    /// Creates a new `AdamW` optimizer.
    ///
    /// # Arguments
    /// * `store` - The parameters that are going to be optimized.
    /// * `groups` - The groups, every parameter must belong to exactly one.
    /// * `lr` - The initial base learning rate.
    pub fn new(store: &ParamStore, groups: Vec<ParamGroup>, lr: f32) -> Result<Self> {
        let mut owner = vec![None; store.len()];

        for (gi, group) in groups.iter().enumerate() {
            for &id in &group.params {
                let Some(slot) = owner.get_mut(id) else {
                    return Err(MlErr::UnknownParam(format!("#{id}")));
                };

                if slot.replace(gi).is_some() {
                    return Err(MlErr::DuplicateParam(store.get(id).name().to_string()));
                }
            }
        }

        if let Some(id) = owner.iter().position(Option::is_none) {
            return Err(MlErr::InvalidHyperParam {
                name: "param_groups",
                reason: format!("{} belongs to no group", store.get(id).name()),
            });
        }

        let moments = store
            .iter()
            .map(|p| Moments {
                exp_avg: vec![0.0; p.len()],
                exp_avg_sq: vec![0.0; p.len()],
            })
            .collect();

        let mut adamw = Self {
            groups,
            beta1: Self::BETAS.0,
            beta2: Self::BETAS.1,
            beta1_t: 1.0,
            beta2_t: 1.0,
            epsilon: Self::EPSILON,
            step: 0,
            moments,
            hyper: vec![(0.0, 0.0); store.len()],
        };
        adamw.set_lr(lr);

        Ok(adamw)
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// The amount of optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Restores the step count, e.g. after resuming from a checkpoint.
    pub fn set_step_count(&mut self, step: u64) {
        self.step = step;
        self.beta1_t = self.beta1.powi(step as i32);
        self.beta2_t = self.beta2.powi(step as i32);
    }

    /// The moment estimates of every parameter, indexed by `ParamId`.
    pub fn moments(&self) -> &[Moments] {
        &self.moments
    }

    /// Overwrites the moments of a single parameter.
    pub fn set_moments(&mut self, id: usize, moments: Moments) -> Result<()> {
        let slot = self
            .moments
            .get_mut(id)
            .ok_or_else(|| MlErr::UnknownParam(format!("#{id}")))?;

        if moments.exp_avg.len() != slot.exp_avg.len()
            || moments.exp_avg_sq.len() != slot.exp_avg_sq.len()
        {
            return Err(MlErr::SizeMismatch {
                what: "optimizer moments",
                got: moments.exp_avg.len(),
                expected: slot.exp_avg.len(),
            });
        }

        *slot = moments;
        Ok(())
    }
}

impl Optimizer for AdamW {
    /// Takes one AdamW step on every parameter.
    ///
    /// The weight decay is applied to the values directly, `w -= lr · wd · w`,
    /// before the bias corrected Adam update.
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        if store.len() != self.moments.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer state",
                got: store.len(),
                expected: self.moments.len(),
            });
        }

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.step += 1;
        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1.0 - self.beta1_t;
        let bc2_sqrt = (1.0 - self.beta2_t).sqrt();

        store
            .par_iter_mut()
            .zip(self.moments.par_iter_mut())
            .zip(self.hyper.par_iter())
            .for_each(|((param, moments), &(lr, wd))| {
                let step_size = lr / bc1;
                let decay = 1.0 - lr * wd;
                let (weights, grad) = param.update_view();

                weights
                    .iter_mut()
                    .zip(grad)
                    .zip(moments.exp_avg.iter_mut())
                    .zip(moments.exp_avg_sq.iter_mut())
                    .for_each(|(((w, g), m), v)| {
                        *w *= decay;
                        *m = b1 * *m + (1.0 - b1) * g;
                        *v = b2 * *v + (1.0 - b2) * g * g;
                        *w -= step_size * *m / (v.sqrt() / bc2_sqrt + eps);
                    });
            });

        Ok(())
    }

    fn set_lr(&mut self, lr: f32) {
        for group in &mut self.groups {
            group.lr = lr * group.lr_scale;
            for &id in &group.params {
                self.hyper[id] = (group.lr, group.weight_decay);
            }
        }
    }

    fn max_lr(&self) -> f32 {
        self.groups.iter().map(|g| g.lr).fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(wd: f32) -> (ParamStore, AdamW) {
        let mut store = ParamStore::new();
        store.register("w", &[2], vec![1.0, -2.0]).unwrap();
        store.register("b", &[1], vec![0.5]).unwrap();

        let groups = vec![
            ParamGroup {
                name: "decay".into(),
                params: vec![0],
                lr_scale: 1.0,
                weight_decay: wd,
                lr: 1.0,
            },
            ParamGroup {
                name: "no_decay".into(),
                params: vec![1],
                lr_scale: 0.5,
                weight_decay: 0.0,
                lr: 1.0,
            },
        ];

        let adamw = AdamW::new(&store, groups, 0.1).unwrap();
        (store, adamw)
    }

    #[test]
    fn first_step_moves_by_lr() {
        let (mut store, mut adamw) = setup(0.0);
        store.get_mut(0).grad_mut().copy_from_slice(&[0.3, -4.0]);
        store.get_mut(1).grad_mut().copy_from_slice(&[2.0]);
        adamw.step(&mut store).unwrap();

        // With bias correction the first step is lr · sign(g).
        let w = store.get(0).data();
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 1.9).abs() < 1e-5);
        assert!((store.get(1).data()[0] - 0.45).abs() < 1e-5);
        assert_eq!(adamw.step_count(), 1);
    }

    #[test]
    fn decoupled_weight_decay() {
        let (mut store, mut adamw) = setup(0.5);
        adamw.step(&mut store).unwrap();

        // Zero gradient, only the decay acts on the decayed group.
        assert!((store.get(0).data()[0] - 0.95).abs() < 1e-6);
        assert_eq!(store.get(1).data()[0], 0.5);
    }

    #[test]
    fn set_lr_applies_group_scale() {
        let (_, mut adamw) = setup(0.0);
        adamw.set_lr(2.0);

        assert_eq!(adamw.groups()[0].lr, 2.0);
        assert_eq!(adamw.groups()[1].lr, 1.0);
        assert_eq!(adamw.max_lr(), 2.0);
    }

    #[test]
    fn every_param_needs_a_group() {
        let mut store = ParamStore::new();
        store.register("w", &[1], vec![0.0]).unwrap();
        assert!(AdamW::new(&store, Vec::new(), 0.1).is_err());
    }

    #[test]
    fn step_count_restores_bias_correction() {
        let (mut store, mut a) = setup(0.0);
        a.step(&mut store).unwrap();
        a.step(&mut store).unwrap();

        let (_, mut b) = setup(0.0);
        b.set_step_count(2);

        assert_eq!(b.step_count(), 2);
        assert!((b.beta1_t - a.beta1_t).abs() < 1e-7);
        assert!((b.beta2_t - a.beta2_t).abs() < 1e-7);
    }
}
