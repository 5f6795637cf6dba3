//! Learning-rate schedules

use crate::config::LrSchedulerType;
use std::f64::consts::PI;

/// Maps an optimizer step to a learning rate.
///
/// Every schedule except `Constant` ramps up linearly over `warmup_steps`.
/// `Cosine` and `Linear` then decay to zero at `total_steps`.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    base_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    scheduler_type: LrSchedulerType,
    current_step: usize,
}

impl LearningRateScheduler {
    pub fn new(
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        scheduler_type: LrSchedulerType,
    ) -> Self {
        Self {
            base_lr,
            total_steps,
            warmup_steps,
            scheduler_type,
            current_step: 0,
        }
    }

    /// Learning rate for `step`
    #[must_use]
    pub fn get_lr(&self, step: usize) -> f64 {
        if self.scheduler_type == LrSchedulerType::Constant {
            return self.base_lr;
        }

        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress = (step.saturating_sub(self.warmup_steps) as f64 / decay_steps as f64).min(1.0);

        match self.scheduler_type {
            LrSchedulerType::Constant | LrSchedulerType::ConstantWithWarmup => self.base_lr,
            LrSchedulerType::Linear => self.base_lr * (1.0 - progress),
            LrSchedulerType::Cosine => self.base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }

    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.current_step)
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}
