//! Optimizers over named parameter groups.
//!
//! All optimizers share an explicit two-state mode machine. For AdamW and SGD
//! the mode only guards [`Optimizer::step`]; schedule-free AdamW additionally
//! swaps the parameters between the training point `y` and the evaluation
//! average `x` on every transition.
//!
//! State export is positional: slot tensors are keyed `<group>.<param>.<slot>`
//! by index, and scalar state is kept per group.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{OptimizerKind, OptimizerSettings};
use crate::error::{Result, ZooError};
use crate::partition::ParamGroup;

/// Parameter placement of the optimizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerMode {
    /// Parameters hold the training point; `step` is allowed.
    #[default]
    Train,
    /// Parameters hold the evaluation point; `step` is an error.
    Eval,
}

/// Serializable scalar part of the optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMeta {
    /// Optimizer family that produced the state.
    pub kind: OptimizerKind,
    /// Mode the parameters were in when exported.
    pub mode: OptimizerMode,
    /// Per-group scalar state, in group order.
    pub groups: Vec<BTreeMap<String, f64>>,
}

/// Exported optimizer state.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// Scalar state.
    pub meta: OptimizerMeta,
    /// Slot tensors keyed `<group>.<param>.<slot>`.
    pub tensors: Vec<(String, Tensor)>,
}

/// Shared bookkeeping of every optimizer.
#[derive(Debug)]
pub struct OptimizerCore {
    groups: Vec<ParamGroup>,
    mode: OptimizerMode,
    slot_names: &'static [&'static str],
    // [group][param] -> per-slot tensors, created on the first update
    slots: Vec<Vec<Option<Vec<Tensor>>>>,
    scalars: Vec<BTreeMap<String, f64>>,
}

impl OptimizerCore {
    fn new(groups: Vec<ParamGroup>, slot_names: &'static [&'static str]) -> Self {
        let slots = groups
            .iter()
            .map(|g| vec![None; g.params.len()])
            .collect();
        let scalars = vec![BTreeMap::new(); groups.len()];
        Self {
            groups,
            mode: OptimizerMode::Train,
            slot_names,
            slots,
            scalars,
        }
    }

    fn scalar(&self, group: usize, key: &str) -> f64 {
        self.scalars[group].get(key).copied().unwrap_or(0.0)
    }

    fn set_scalar(&mut self, group: usize, key: &str, value: f64) {
        self.scalars[group].insert(key.to_string(), value);
    }

    fn ensure_train(&self) -> Result<()> {
        if self.mode == OptimizerMode::Eval {
            return Err(ZooError::Training(
                "optimizer stepped in eval mode; switch to train mode first".into(),
            ));
        }
        Ok(())
    }
}

/// Detached gradient of `var`, if it received one.
fn grad_of(grads: &GradStore, var: &Var) -> Option<Tensor> {
    grads.get(var.as_tensor()).map(Tensor::detach)
}

/// `a + (b - a) * w`.
fn lerp(a: &Tensor, b: &Tensor, w: f64) -> Result<Tensor> {
    Ok((a + ((b - a)? * w)?)?)
}

/// An optimizer over [`ParamGroup`]s.
pub trait Optimizer {
    /// Family of this optimizer.
    fn kind(&self) -> OptimizerKind;

    /// Shared bookkeeping.
    fn core(&self) -> &OptimizerCore;

    /// Shared bookkeeping, mutably.
    fn core_mut(&mut self) -> &mut OptimizerCore;

    /// Apply one update from the gradients in `grads`. Parameters without a
    /// gradient are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error in eval mode or if a tensor operation fails.
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    /// Move parameters between the training and evaluation points. The
    /// default only records the mode.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn set_mode(&mut self, mode: OptimizerMode) -> Result<()> {
        self.core_mut().mode = mode;
        Ok(())
    }

    /// Current mode.
    fn mode(&self) -> OptimizerMode {
        self.core().mode
    }

    /// Parameter groups in order.
    fn groups(&self) -> &[ParamGroup] {
        &self.core().groups
    }

    /// Learning rate of every group, in order.
    fn learning_rates(&self) -> Vec<f64> {
        self.core().groups.iter().map(|g| g.lr).collect()
    }

    /// Overwrite the learning rate of group `index`.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range group.
    fn set_learning_rate(&mut self, index: usize, lr: f64) -> Result<()> {
        let group = self
            .core_mut()
            .groups
            .get_mut(index)
            .ok_or_else(|| ZooError::Training(format!("no parameter group {index}")))?;
        group.lr = lr;
        Ok(())
    }

    /// Export scalar state and slot tensors.
    fn export_state(&self) -> OptimizerState {
        let core = self.core();
        let mut tensors = Vec::new();
        for (g, params) in core.slots.iter().enumerate() {
            for (p, slots) in params.iter().enumerate() {
                let Some(slots) = slots else { continue };
                for (name, tensor) in core.slot_names.iter().zip(slots) {
                    tensors.push((format!("{g}.{p}.{name}"), tensor.clone()));
                }
            }
        }
        OptimizerState {
            meta: OptimizerMeta {
                kind: self.kind(),
                mode: core.mode,
                groups: core.scalars.clone(),
            },
            tensors,
        }
    }

    /// Restore state exported by an optimizer of the same kind over the same
    /// group layout. The mode is restored without moving parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Checkpoint`] on kind, layout or shape mismatch.
    fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        let kind = self.kind();
        if state.meta.kind != kind {
            return Err(ZooError::Checkpoint(format!(
                "optimizer state is {:?}, expected {:?}",
                state.meta.kind, kind
            )));
        }
        let core = self.core_mut();
        if state.meta.groups.len() != core.groups.len() {
            return Err(ZooError::Checkpoint(format!(
                "optimizer state has {} groups, expected {}",
                state.meta.groups.len(),
                core.groups.len()
            )));
        }

        let mut slots: Vec<Vec<Option<Vec<Option<Tensor>>>>> = core
            .groups
            .iter()
            .map(|g| vec![None; g.params.len()])
            .collect();
        for (key, tensor) in &state.tensors {
            let mut parts = key.splitn(3, '.');
            let (Some(g), Some(p), Some(slot)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ZooError::Checkpoint(format!("bad optimizer key '{key}'")));
            };
            let parse = |s: &str| {
                s.parse::<usize>()
                    .map_err(|_| ZooError::Checkpoint(format!("bad optimizer key '{key}'")))
            };
            let (g, p) = (parse(g)?, parse(p)?);
            let s = core
                .slot_names
                .iter()
                .position(|name| *name == slot)
                .ok_or_else(|| ZooError::Checkpoint(format!("unknown optimizer slot '{slot}'")))?;
            let (_, var) = core
                .groups
                .get(g)
                .and_then(|group| group.params.get(p))
                .ok_or_else(|| ZooError::Checkpoint(format!("optimizer key '{key}' out of range")))?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(ZooError::Checkpoint(format!(
                    "optimizer slot '{key}' has shape {:?}, parameter has {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            let entry = slots[g][p].get_or_insert_with(|| vec![None; core.slot_names.len()]);
            entry[s] = Some(tensor.to_device(var.device())?);
        }

        let mut restored = Vec::with_capacity(slots.len());
        for group in slots {
            let mut params = Vec::with_capacity(group.len());
            for param in group {
                params.push(match param {
                    Some(entry) => Some(
                        entry
                            .into_iter()
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| ZooError::Checkpoint("incomplete optimizer slots".into()))?,
                    ),
                    None => None,
                });
            }
            restored.push(params);
        }

        core.slots = restored;
        core.scalars = state.meta.groups.clone();
        core.mode = state.meta.mode;
        Ok(())
    }
}

/// AdamW with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    core: OptimizerCore,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl AdamW {
    const SLOTS: &'static [&'static str] = &["exp_avg", "exp_avg_sq"];

    /// Create over `groups`.
    #[must_use]
    pub fn new(groups: Vec<ParamGroup>, settings: &OptimizerSettings) -> Self {
        Self {
            core: OptimizerCore::new(groups, Self::SLOTS),
            beta1: settings.beta1,
            beta2: settings.beta2,
            eps: settings.eps,
            weight_decay: settings.weight_decay,
        }
    }
}

impl Optimizer for AdamW {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AdamW
    }

    fn core(&self) -> &OptimizerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OptimizerCore {
        &mut self.core
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.core.ensure_train()?;
        for g in 0..self.core.groups.len() {
            let t = self.core.scalar(g, "step") + 1.0;
            self.core.set_scalar(g, "step", t);
            let lr = self.core.groups[g].lr;
            let bc1 = 1.0 - self.beta1.powf(t);
            let bc2 = 1.0 - self.beta2.powf(t);

            for p in 0..self.core.groups[g].params.len() {
                let var = self.core.groups[g].params[p].1.clone();
                let Some(grad) = grad_of(grads, &var) else {
                    continue;
                };
                let theta = var.as_tensor().detach();
                let slots = match self.core.slots[g][p].take() {
                    Some(slots) => slots,
                    None => vec![theta.zeros_like()?, theta.zeros_like()?],
                };
                let m = ((&slots[0] * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
                let v = ((&slots[1] * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
                let m_hat = (&m / bc1)?;
                let v_hat = (&v / bc2)?;
                let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
                let decayed = (&theta * (1.0 - lr * self.weight_decay))?;
                var.set(&(decayed - (update * lr)?)?)?;
                self.core.slots[g][p] = Some(vec![m, v]);
            }
        }
        Ok(())
    }
}

/// Schedule-free AdamW.
///
/// Keeps a base sequence `z` per parameter and stores the interpolation `y`
/// in the parameters while training. Switching to eval mode moves the
/// parameters to the averaged point `x`; switching back restores `y`.
#[derive(Debug)]
pub struct AdamWScheduleFree {
    core: OptimizerCore,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    warmup_steps: usize,
    r: f64,
    weight_lr_power: f64,
}

impl AdamWScheduleFree {
    const SLOTS: &'static [&'static str] = &["z", "exp_avg_sq"];

    /// Create over `groups`.
    #[must_use]
    pub fn new(groups: Vec<ParamGroup>, settings: &OptimizerSettings) -> Self {
        Self {
            core: OptimizerCore::new(groups, Self::SLOTS),
            beta1: settings.beta1,
            beta2: settings.beta2,
            eps: settings.eps,
            weight_decay: settings.weight_decay,
            warmup_steps: settings.warmup_steps,
            r: 0.0,
            weight_lr_power: 2.0,
        }
    }

    fn interpolate_towards_z(&mut self, weight: f64) -> Result<()> {
        for (group, slots) in self.core.groups.iter().zip(&self.core.slots) {
            for ((_, var), state) in group.params.iter().zip(slots) {
                if let Some(state) = state {
                    let p = var.as_tensor().detach();
                    var.set(&lerp(&p, &state[0], weight)?)?;
                }
            }
        }
        Ok(())
    }
}

impl Optimizer for AdamWScheduleFree {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AdamWScheduleFree
    }

    fn core(&self) -> &OptimizerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OptimizerCore {
        &mut self.core
    }

    fn set_mode(&mut self, mode: OptimizerMode) -> Result<()> {
        if mode == self.core.mode {
            return Ok(());
        }
        match mode {
            OptimizerMode::Eval => self.interpolate_towards_z(1.0 - 1.0 / self.beta1)?,
            OptimizerMode::Train => self.interpolate_towards_z(1.0 - self.beta1)?,
        }
        self.core.mode = mode;
        Ok(())
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.core.ensure_train()?;
        for g in 0..self.core.groups.len() {
            let k = self.core.scalar(g, "k");
            let sched = if (k as usize) < self.warmup_steps {
                (k + 1.0) / self.warmup_steps as f64
            } else {
                1.0
            };
            let bc2 = 1.0 - self.beta2.powf(k + 1.0);
            let lr = self.core.groups[g].lr * sched;
            let lr_max = lr.max(self.core.scalar(g, "lr_max"));
            let weight = (k + 1.0).powf(self.r) * lr_max.powf(self.weight_lr_power);
            let weight_sum = self.core.scalar(g, "weight_sum") + weight;
            let ckp1 = if weight_sum == 0.0 { 0.0 } else { weight / weight_sum };
            let adaptive_y_lr = lr * (self.beta1 * (1.0 - ckp1) - 1.0);

            for p in 0..self.core.groups[g].params.len() {
                let var = self.core.groups[g].params[p].1.clone();
                let Some(grad) = grad_of(grads, &var) else {
                    continue;
                };
                let y = var.as_tensor().detach();
                let slots = match self.core.slots[g][p].take() {
                    Some(slots) => slots,
                    None => vec![y.copy()?, y.zeros_like()?],
                };
                let (z, exp_avg_sq) = (&slots[0], &slots[1]);

                let exp_avg_sq = ((exp_avg_sq * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
                let denom = ((&exp_avg_sq / bc2)?.sqrt()? + self.eps)?;
                let mut grad_normalized = (grad / denom)?;
                if self.weight_decay != 0.0 {
                    grad_normalized = (grad_normalized + (&y * self.weight_decay)?)?;
                }
                let y = lerp(&y, z, ckp1)?;
                let y = (y + (&grad_normalized * adaptive_y_lr)?)?;
                let z = (z - (&grad_normalized * lr)?)?;
                var.set(&y)?;
                self.core.slots[g][p] = Some(vec![z, exp_avg_sq]);
            }

            self.core.set_scalar(g, "k", k + 1.0);
            self.core.set_scalar(g, "lr_max", lr_max);
            self.core.set_scalar(g, "weight_sum", weight_sum);
        }
        Ok(())
    }
}

/// SGD with momentum and L2 weight decay.
#[derive(Debug)]
pub struct Sgd {
    core: OptimizerCore,
    momentum: f64,
    weight_decay: f64,
}

impl Sgd {
    const SLOTS: &'static [&'static str] = &["momentum_buffer"];

    /// Create over `groups`.
    #[must_use]
    pub fn new(groups: Vec<ParamGroup>, settings: &OptimizerSettings) -> Self {
        Self {
            core: OptimizerCore::new(groups, Self::SLOTS),
            momentum: settings.momentum,
            weight_decay: settings.weight_decay,
        }
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn core(&self) -> &OptimizerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OptimizerCore {
        &mut self.core
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.core.ensure_train()?;
        for g in 0..self.core.groups.len() {
            let lr = self.core.groups[g].lr;
            for p in 0..self.core.groups[g].params.len() {
                let var = self.core.groups[g].params[p].1.clone();
                let Some(mut grad) = grad_of(grads, &var) else {
                    continue;
                };
                let theta = var.as_tensor().detach();
                if self.weight_decay != 0.0 {
                    grad = (grad + (&theta * self.weight_decay)?)?;
                }
                let buf = match self.core.slots[g][p].take() {
                    Some(slots) => ((&slots[0] * self.momentum)? + &grad)?,
                    None => grad,
                };
                var.set(&(theta - (&buf * lr)?)?)?;
                self.core.slots[g][p] = Some(vec![buf]);
            }
        }
        Ok(())
    }
}

/// Build the configured optimizer over `groups`.
#[must_use]
pub fn build_optimizer(settings: &OptimizerSettings, groups: Vec<ParamGroup>) -> Box<dyn Optimizer> {
    tracing::info!(kind = settings.kind.as_str(), groups = groups.len(), "Building optimizer");
    match settings.kind {
        OptimizerKind::AdamW => Box::new(AdamW::new(groups, settings)),
        OptimizerKind::AdamWScheduleFree => Box::new(AdamWScheduleFree::new(groups, settings)),
        OptimizerKind::Sgd => Box::new(Sgd::new(groups, settings)),
    }
}
