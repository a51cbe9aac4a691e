//! Learning rate schedulers, stepped once per epoch over every group.

use serde::{Deserialize, Serialize};

use crate::config::{SchedulerKind, SchedulerSettings};
use crate::error::Result;
use crate::optimizer::Optimizer;

/// Serializable scheduler progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Number of completed `step` calls.
    pub epoch: usize,
    /// Best validation loss seen (plateau).
    pub best: Option<f64>,
    /// Epochs since the last improvement (plateau).
    pub bad_epochs: usize,
    /// Accumulated decay multiplier (plateau).
    pub scale: f64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best: None,
            bad_epochs: 0,
            scale: 1.0,
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    kind: SchedulerKind,
    settings: SchedulerSettings,
    initial_lrs: Vec<f64>,
    total_epochs: usize,
    state: SchedulerState,
}

impl LRScheduler {
    /// Create a scheduler decaying from each group's `initial_lr`.
    #[must_use]
    pub fn new(settings: &SchedulerSettings, optimizer: &dyn Optimizer, total_epochs: usize) -> Self {
        Self {
            kind: settings.kind,
            settings: settings.clone(),
            initial_lrs: optimizer.groups().iter().map(|g| g.initial_lr).collect(),
            total_epochs: total_epochs.max(1),
            state: SchedulerState::default(),
        }
    }

    /// Scheduler family.
    #[must_use]
    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    /// Learning rate of a group after `state.epoch` steps.
    #[must_use]
    pub fn get_lr(&self, initial_lr: f64) -> f64 {
        let epoch = self.state.epoch as f64;
        match self.kind {
            SchedulerKind::Constant => initial_lr,
            SchedulerKind::Cosine => {
                let progress = (epoch / self.total_epochs as f64).min(1.0);
                let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                self.settings.min_lr + (initial_lr - self.settings.min_lr) * cosine_decay
            }
            SchedulerKind::Step => {
                let decays = self.state.epoch / self.settings.step_size.max(1);
                initial_lr * self.settings.gamma.powi(decays as i32)
            }
            SchedulerKind::Plateau => (initial_lr * self.state.scale).max(self.settings.min_lr),
        }
    }

    /// Advance one epoch and write the new rates into the optimizer.
    /// `val_loss` drives the plateau scheduler and is ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer group layout changed.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer, val_loss: Option<f64>) -> Result<()> {
        self.state.epoch += 1;
        if self.kind == SchedulerKind::Constant {
            return Ok(());
        }
        if self.kind == SchedulerKind::Plateau {
            if let Some(loss) = val_loss {
                // A diverged epoch counts as a bad one.
                let improved = loss.is_finite() && self.state.best.map_or(true, |best| loss < best);
                if improved {
                    self.state.best = Some(loss);
                    self.state.bad_epochs = 0;
                } else {
                    self.state.bad_epochs += 1;
                    if self.state.bad_epochs > self.settings.patience {
                        self.state.scale *= self.settings.factor;
                        self.state.bad_epochs = 0;
                        tracing::info!(scale = self.state.scale, "Reducing learning rate on plateau");
                    }
                }
            }
        }
        for (idx, initial) in self.initial_lrs.clone().into_iter().enumerate() {
            optimizer.set_learning_rate(idx, self.get_lr(initial))?;
        }
        Ok(())
    }

    /// Snapshot for checkpoints.
    #[must_use]
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Restore a snapshot.
    pub fn load_state(&mut self, state: SchedulerState) {
        self.state = state;
    }
}
