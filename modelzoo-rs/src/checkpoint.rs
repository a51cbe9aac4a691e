//! Checkpoint files, resumption and the best/latest save policy.
//!
//! A checkpoint is one safetensors file. Model tensors are stored as
//! `model.<param>`, optimizer slots as `optimizer.<group>.<param>.<slot>`,
//! and a JSON [`CheckpointHeader`] under the `modelzoo` metadata key.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::TaskKind;
use crate::error::{Result, ZooError};
use crate::graph::ModuleGraph;
use crate::model::{load_named_tensors, LoadReport};
use crate::optimizer::{Optimizer, OptimizerMeta, OptimizerState};
use crate::scheduler::{LRScheduler, SchedulerState};

/// Metadata key of the JSON header.
pub const METADATA_KEY: &str = "modelzoo";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Metric that triggered a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetric {
    /// Metric name (`val_loss`, `pck@0.1`, ...).
    pub name: String,
    /// Metric value.
    pub value: f64,
}

/// JSON header of a checkpoint. Everything but `epoch` may be absent in
/// files written by older versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Epoch the checkpoint was taken after.
    pub epoch: usize,
    /// Learning rate per parameter group, in group order.
    #[serde(default)]
    pub learning_rates: Option<Vec<f64>>,
    /// Run identifier.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Metric that triggered the save.
    #[serde(default)]
    pub metric: Option<CheckpointMetric>,
    /// Scheduler progress.
    #[serde(default)]
    pub scheduler: Option<SchedulerState>,
    /// Optimizer scalar state.
    #[serde(default)]
    pub optimizer: Option<OptimizerMeta>,
    /// Class names for inference output.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    /// Only trainable parameters were stored.
    #[serde(default)]
    pub trainable_only: bool,
    /// Task the model was trained for.
    #[serde(default)]
    pub task: Option<TaskKind>,
    /// Best validation loss so far.
    #[serde(default)]
    pub best_loss: Option<f64>,
    /// Best tracked PCK so far.
    #[serde(default)]
    pub best_pck: Option<f64>,
}

/// A loaded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Header fields.
    pub header: CheckpointHeader,
    /// Model tensors by parameter name.
    pub model: HashMap<String, Tensor>,
    /// Optimizer state, when the file carries one.
    pub optimizer: Option<OptimizerState>,
}

/// Everything needed to write a checkpoint.
pub struct SaveRequest<'a> {
    /// Model to store.
    pub graph: &'a ModuleGraph,
    /// Optimizer to store.
    pub optimizer: &'a dyn Optimizer,
    /// Scheduler progress.
    pub scheduler: Option<&'a SchedulerState>,
    /// Completed epoch.
    pub epoch: usize,
    /// Run identifier.
    pub run_id: &'a str,
    /// Triggering metric.
    pub metric: Option<CheckpointMetric>,
    /// Class names.
    pub labels: Option<&'a [String]>,
    /// Store only trainable parameters.
    pub trainable_only: bool,
    /// Task kind.
    pub task: TaskKind,
    /// Best-so-far values.
    pub best_loss: Option<f64>,
    /// Best-so-far PCK.
    pub best_pck: Option<f64>,
}

/// Write a checkpoint. The file is written next to `path` and renamed into
/// place, so readers never observe a partial file.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn save<P: AsRef<Path>>(path: P, request: &SaveRequest<'_>) -> Result<()> {
    let path = path.as_ref();
    let optimizer = request.optimizer.export_state();

    let mut tensors: Vec<(String, Tensor)> = request
        .graph
        .named_parameters()
        .into_iter()
        .filter(|p| p.trainable || !request.trainable_only)
        .map(|p| (format!("{MODEL_PREFIX}{}", p.name), p.var.as_tensor().detach()))
        .collect();
    tensors.extend(
        optimizer
            .tensors
            .iter()
            .map(|(key, t)| (format!("{OPTIMIZER_PREFIX}{key}"), t.clone())),
    );

    let header = CheckpointHeader {
        epoch: request.epoch,
        learning_rates: Some(request.optimizer.learning_rates()),
        run_id: Some(request.run_id.to_string()),
        metric: request.metric.clone(),
        scheduler: request.scheduler.cloned(),
        optimizer: Some(optimizer.meta),
        labels: request.labels.map(<[String]>::to_vec),
        trainable_only: request.trainable_only,
        task: Some(request.task),
        best_loss: request.best_loss,
        best_pck: request.best_pck,
    };
    let metadata = HashMap::from([(METADATA_KEY.to_string(), serde_json::to_string(&header)?)]);
    let bytes = safetensors::tensor::serialize(
        tensors.iter().map(|(name, t)| (name.as_str(), t)),
        &Some(metadata),
    )?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ZooError::Io(e.error))?;

    tracing::info!(
        path = %path.display(),
        epoch = request.epoch,
        tensors = tensors.len(),
        "Saved checkpoint"
    );
    Ok(())
}

/// Read a checkpoint.
///
/// # Errors
///
/// Returns [`ZooError::CheckpointNotFound`] if the file does not exist and
/// [`ZooError::Checkpoint`] if it has no header.
pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Checkpoint> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ZooError::CheckpointNotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    let (_, metadata) = safetensors::SafeTensors::read_metadata(&bytes)?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(METADATA_KEY))
        .ok_or_else(|| {
            ZooError::Checkpoint(format!("{}: missing '{METADATA_KEY}' header", path.display()))
        })?;
    let header: CheckpointHeader = serde_json::from_str(raw)?;
    if header.learning_rates.is_none() {
        tracing::warn!(path = %path.display(), "Checkpoint has no learning rates; keeping configured rates");
    }
    if header.run_id.is_none() {
        tracing::warn!(path = %path.display(), "Checkpoint has no run id; keeping current run id");
    }
    if header.optimizer.is_none() {
        tracing::warn!(path = %path.display(), "Checkpoint has no optimizer state");
    }

    let mut model = HashMap::new();
    let mut optimizer_tensors = Vec::new();
    for (name, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
        if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
            model.insert(param.to_string(), tensor);
        } else if let Some(key) = name.strip_prefix(OPTIMIZER_PREFIX) {
            optimizer_tensors.push((key.to_string(), tensor));
        } else {
            tracing::debug!(tensor = %name, "Ignoring unknown checkpoint tensor");
        }
    }
    optimizer_tensors.sort_by(|a, b| a.0.cmp(&b.0));
    let optimizer = header.optimizer.clone().map(|meta| OptimizerState {
        meta,
        tensors: optimizer_tensors,
    });

    Ok(Checkpoint {
        header,
        model,
        optimizer,
    })
}

/// How a checkpoint is applied to the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Same run, same architecture: every stored tensor must match and a
    /// full checkpoint must cover every parameter.
    Strict,
    /// Follow-up run: load what matches, skip the rest.
    Partial,
}

/// What [`resume`] restored.
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    /// First epoch to run.
    pub start_epoch: usize,
    /// Run identifier stored in the checkpoint.
    pub run_id: Option<String>,
    /// Weight loading details.
    pub weights: LoadReport,
    /// Best-so-far values stored in the checkpoint.
    pub best_loss: Option<f64>,
    /// Best-so-far PCK stored in the checkpoint.
    pub best_pck: Option<f64>,
}

/// Apply a checkpoint to the model, optimizer and scheduler.
///
/// Learning rates are written back positionally in group order, after the
/// optimizer state is restored.
///
/// # Errors
///
/// In [`ResumeMode::Strict`], any mismatch is a [`ZooError::Checkpoint`].
/// In [`ResumeMode::Partial`], mismatches are logged and skipped.
pub fn resume(
    checkpoint: &Checkpoint,
    graph: &ModuleGraph,
    optimizer: &mut dyn Optimizer,
    scheduler: Option<&mut LRScheduler>,
    mode: ResumeMode,
) -> Result<ResumeOutcome> {
    let strict = mode == ResumeMode::Strict;
    let header = &checkpoint.header;

    let weights = load_named_tensors(graph, &checkpoint.model, strict)?;
    if strict && !header.trainable_only && !weights.missing.is_empty() {
        return Err(ZooError::Checkpoint(format!(
            "checkpoint lacks parameters: {}",
            weights.missing.join(", ")
        )));
    }

    if let Some(state) = &checkpoint.optimizer {
        match optimizer.import_state(state) {
            Ok(()) => {}
            Err(e) if !strict => {
                tracing::warn!("Optimizer state not restored: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(lrs) = &header.learning_rates {
        let groups = optimizer.groups().len();
        if lrs.len() != groups {
            let msg = format!(
                "checkpoint has {} learning rates for {groups} parameter groups",
                lrs.len()
            );
            if strict {
                return Err(ZooError::Checkpoint(msg));
            }
            tracing::warn!("{msg}");
        }
        for (idx, lr) in lrs.iter().enumerate().take(groups) {
            optimizer.set_learning_rate(idx, *lr)?;
        }
    }

    if let (Some(scheduler), Some(state)) = (scheduler, &header.scheduler) {
        scheduler.load_state(state.clone());
    }

    let outcome = ResumeOutcome {
        start_epoch: header.epoch + 1,
        run_id: header.run_id.clone(),
        weights,
        best_loss: header.best_loss,
        best_pck: header.best_pck,
    };
    tracing::info!(
        start_epoch = outcome.start_epoch,
        loaded = outcome.weights.loaded.len(),
        skipped = outcome.weights.skipped.len(),
        ?mode,
        "Resumed from checkpoint"
    );
    Ok(outcome)
}

/// Direction of a best-so-far comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Lower is better; ties favour the newer epoch.
    Min,
    /// Higher is better; ties favour the newer epoch.
    Max,
}

/// Tracks the best value of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct BestTracker {
    criterion: Criterion,
    best: Option<f64>,
    best_epoch: Option<usize>,
}

impl BestTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new(criterion: Criterion) -> Self {
        Self {
            criterion,
            best: None,
            best_epoch: None,
        }
    }

    /// Tracker seeded with a previous best (epoch unknown).
    #[must_use]
    pub fn with_best(criterion: Criterion, best: Option<f64>) -> Self {
        Self {
            criterion,
            best,
            best_epoch: None,
        }
    }

    /// Offer a value; returns whether it is a new best. Non-finite values
    /// never improve.
    pub fn update(&mut self, epoch: usize, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let improved = match (self.best, self.criterion) {
            (None, _) => true,
            (Some(best), Criterion::Min) => value <= best,
            (Some(best), Criterion::Max) => value >= best,
        };
        if improved {
            self.best = Some(value);
            self.best_epoch = Some(epoch);
        }
        improved
    }

    /// Best value so far.
    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Epoch of the best value, if seen in this process.
    #[must_use]
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// File layout of a run's checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    dir: PathBuf,
    save_every: usize,
}

impl CheckpointPolicy {
    /// Policy writing into `dir`, with a periodic save every `save_every`
    /// epochs (0 disables it).
    #[must_use]
    pub fn new<P: Into<PathBuf>>(dir: P, save_every: usize) -> Self {
        Self {
            dir: dir.into(),
            save_every,
        }
    }

    /// Run directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lowest validation loss.
    #[must_use]
    pub fn best_loss_path(&self) -> PathBuf {
        self.dir.join("best_loss.safetensors")
    }

    /// Highest tracked PCK.
    #[must_use]
    pub fn best_pck_path(&self) -> PathBuf {
        self.dir.join("best_pck.safetensors")
    }

    /// Periodic save.
    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join("latest.safetensors")
    }

    /// Save on loop exit.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.dir.join("final.safetensors")
    }

    /// Whether `epoch` (0-based) gets a periodic save.
    #[must_use]
    pub fn is_periodic(&self, epoch: usize) -> bool {
        self.save_every > 0 && (epoch + 1) % self.save_every == 0
    }
}
