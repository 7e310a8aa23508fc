use std::f32::consts::PI;

/// Linear warmup followed by a half-cycle cosine decay down to `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSchedule {
    pub lr: f32,
    pub min_lr: f32,
    pub warmup_epochs: f32,
    pub epochs: f32,
}

impl CosineSchedule {
    pub fn new(lr: f32, min_lr: f32, warmup_epochs: usize, epochs: usize) -> Self {
        Self {
            lr,
            min_lr,
            warmup_epochs: warmup_epochs as f32,
            epochs: epochs as f32,
        }
    }

    /// The learning rate at a fractional epoch.
    pub fn lr_at(&self, epoch: f32) -> f32 {
        if epoch < self.warmup_epochs {
            return self.lr * epoch / self.warmup_epochs;
        }

        let span = (self.epochs - self.warmup_epochs).max(f32::EPSILON);
        let progress = ((epoch - self.warmup_epochs) / span).min(1.0);
        self.min_lr + (self.lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
    }
}
