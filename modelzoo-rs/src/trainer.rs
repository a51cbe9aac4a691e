//! Epoch and evaluation runners, and the run orchestrator that ties them to
//! the scheduler, metric sinks and checkpoint policy.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{
    self, BestTracker, CheckpointMetric, CheckpointPolicy, Criterion, ResumeMode, SaveRequest,
};
use crate::config::{generate_run_id, run_id_from_parts, TaskKind, ZooConfig};
use crate::dataset::{BatchSource, ShardedLoader};
use crate::distributed::DistributedContext;
use crate::error::Result;
use crate::graph::{ModuleGraph, NamedParam};
use crate::loss::LossKind;
use crate::metrics::{pck_key, pose_distances, top1_accuracy, EvalSummary, MetricAccumulator};
use crate::model::{prepare_model, PreparedModel};
use crate::optimizer::{build_optimizer, Optimizer, OptimizerMode};
use crate::partition::partition;
use crate::scheduler::LRScheduler;
use crate::sink::{MetricSink, TracingSink, TRAIN_LOSS, VAL_LOSS};

/// Global loss of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLoss {
    /// `total / count` over every rank's batches.
    pub mean: f64,
    /// Sum of batch losses over every rank.
    pub total: f64,
}

/// Knobs of [`train_one_epoch`].
#[derive(Debug, Clone, Copy)]
pub struct EpochOptions {
    /// Epoch index, which seeds the shard order.
    pub epoch: usize,
    /// Global gradient norm limit; `<= 0` disables clipping.
    pub max_grad_norm: f64,
}

/// Run one training epoch over this rank's shard.
///
/// Gradients are averaged across ranks before clipping and the optimizer
/// step, and the returned loss is reduced over all ranks.
///
/// # Errors
///
/// Returns an error if a forward, backward, collective or optimizer step
/// fails.
pub fn train_one_epoch<S: BatchSource>(
    graph: &ModuleGraph,
    optimizer: &mut dyn Optimizer,
    loader: &ShardedLoader<'_, S>,
    loss_fn: LossKind,
    ctx: &DistributedContext,
    opts: EpochOptions,
    progress: Option<&ProgressBar>,
) -> Result<EpochLoss> {
    optimizer.set_mode(OptimizerMode::Train)?;
    let params = graph.trainable_parameters();

    let mut sum = 0.0;
    let mut count = 0.0;
    for batch in loader.iter(opts.epoch) {
        let batch = batch?;
        let output = graph.forward(&batch.inputs, true)?;
        let loss = loss_fn.compute(&output, &batch)?;
        let mut grads = loss.backward()?;

        sync_gradients(&mut grads, &params, ctx)?;
        if opts.max_grad_norm > 0.0 {
            clip_gradients(&mut grads, &params, opts.max_grad_norm)?;
        }
        optimizer.step(&grads)?;

        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        sum += value;
        count += 1.0;
        if let Some(pb) = progress {
            pb.set_message(format!("loss {value:.4}"));
            pb.inc(1);
        }
    }

    let reduced = ctx.all_reduce_sum(&[sum, count])?;
    Ok(EpochLoss {
        mean: reduced[0] / (reduced[1] + 1e-8),
        total: reduced[0],
    })
}

/// Replace every trainable gradient with its mean over all ranks. Parameters
/// without a gradient contribute zeros so every rank sends the same length.
fn sync_gradients(
    grads: &mut GradStore,
    params: &[NamedParam],
    ctx: &DistributedContext,
) -> Result<()> {
    if ctx.world_size() == 1 {
        return Ok(());
    }
    let mut flat = Vec::new();
    for param in params {
        let tensor = param.var.as_tensor();
        match grads.get(tensor) {
            Some(grad) => flat.extend(grad.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?),
            None => flat.extend(std::iter::repeat(0.0).take(tensor.elem_count())),
        }
    }

    let summed = ctx.all_reduce_sum(&flat)?;
    let world = ctx.world_size() as f64;
    let mut offset = 0;
    for param in params {
        let tensor = param.var.as_tensor();
        let n = tensor.elem_count();
        let mean: Vec<f64> = summed[offset..offset + n].iter().map(|v| v / world).collect();
        offset += n;
        let grad = Tensor::from_vec(mean, tensor.shape(), tensor.device())?.to_dtype(tensor.dtype())?;
        grads.insert(tensor, grad);
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns
/// the norm before clipping.
fn clip_gradients(grads: &mut GradStore, params: &[NamedParam], max_norm: f64) -> Result<f64> {
    let mut squares = 0.0;
    for param in params {
        if let Some(grad) = grads.get(param.var.as_tensor()) {
            squares += grad.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
        }
    }
    let norm = squares.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for param in params {
            let tensor = param.var.as_tensor();
            if let Some(grad) = grads.get(tensor) {
                let scaled = (grad * scale)?;
                grads.insert(tensor, scaled);
            }
        }
        tracing::debug!(norm, max_norm, "Clipped gradients");
    }
    Ok(norm)
}

/// Knobs of [`evaluate`].
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Task, which selects the extra metrics.
    pub task: TaskKind,
    /// PCK thresholds (pose only).
    pub thresholds: Vec<f64>,
    /// Input image size `[height, width]` for the coordinate estimator.
    pub image_size: [usize; 2],
}

/// Evaluate this rank's validation shard and reduce the metrics over all
/// ranks with a single collective call.
///
/// # Errors
///
/// Returns an error if a forward pass, metric or collective fails.
pub fn evaluate<S: BatchSource>(
    graph: &ModuleGraph,
    optimizer: &mut dyn Optimizer,
    loader: &ShardedLoader<'_, S>,
    loss_fn: LossKind,
    ctx: &DistributedContext,
    opts: &EvalOptions,
) -> Result<EvalSummary> {
    optimizer.set_mode(OptimizerMode::Eval)?;
    let pose = opts.task == TaskKind::Pose;
    let classification = opts.task == TaskKind::Classification;
    let thresholds: &[f64] = if pose { &opts.thresholds } else { &[] };
    let mut acc = MetricAccumulator::new(thresholds, classification);

    for batch in loader.iter(0) {
        let batch = batch?;
        let output = graph.forward(&batch.inputs, false)?.detach();
        let loss = loss_fn.compute(&output, &batch)?;
        acc.add_loss(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?);

        if let (true, Some(keypoints)) = (pose, &batch.keypoints) {
            let distances = pose_distances(&output, &batch.targets, keypoints, opts.image_size)?;
            acc.add_pose(&distances);
        }
        if classification {
            acc.add_accuracy(top1_accuracy(&output, &batch.targets)?);
        }
    }

    let reduced = ctx.all_reduce_sum(&acc.pack())?;
    Ok(acc.unpack(&reduced)?.summary())
}

/// One epoch's results.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// Epoch index.
    pub epoch: usize,
    /// Training loss.
    pub train: EpochLoss,
    /// Validation metrics.
    pub eval: EvalSummary,
    /// Learning rates after the scheduler step.
    pub learning_rates: Vec<f64>,
}

impl EpochReport {
    /// Flat metric map handed to the sinks.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert(TRAIN_LOSS.to_string(), self.train.mean);
        out.insert(VAL_LOSS.to_string(), self.eval.mean);
        for (key, value) in &self.eval.pck {
            out.insert(format!("pck@{key}"), *value);
        }
        for (key, value) in &self.eval.heatmap_pck {
            out.insert(format!("heatmap_pck@{key}"), *value);
        }
        if let Some(accuracy) = self.eval.accuracy {
            out.insert("accuracy".to_string(), accuracy);
        }
        for (idx, lr) in self.learning_rates.iter().enumerate() {
            out.insert(format!("lr/{idx}"), *lr);
        }
        out
    }
}

/// Mutable state of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Run identifier, naming the checkpoint directory.
    pub run_id: String,
    /// First epoch to run.
    pub start_epoch: usize,
    /// Last completed epoch.
    pub last_epoch: Option<usize>,
    /// Lowest validation loss.
    pub best_loss: BestTracker,
    /// Highest PCK at the tracked threshold (pose only).
    pub best_pck: BestTracker,
    /// Per-epoch results of this process.
    pub history: Vec<EpochReport>,
}

/// Run id picked by rank 0 and broadcast to every rank through a sum in
/// which the other ranks contribute zeros. Both parts fit an f64 exactly.
fn shared_run_id(ctx: &DistributedContext) -> Result<String> {
    if ctx.world_size() == 1 {
        return Ok(generate_run_id());
    }
    let local = if ctx.is_main_process() {
        [chrono::Utc::now().timestamp() as f64, f64::from(rand::random::<u32>())]
    } else {
        [0.0, 0.0]
    };
    let shared = ctx.all_reduce_sum(&local)?;
    Ok(run_id_from_parts(shared[0] as i64, shared[1] as u32))
}

/// Training orchestrator for one process.
pub struct Trainer {
    config: ZooConfig,
    ctx: DistributedContext,
    model: PreparedModel,
    optimizer: Box<dyn Optimizer>,
    scheduler: LRScheduler,
    loss: LossKind,
    sinks: Vec<Box<dyn MetricSink>>,
    labels: Option<Vec<String>>,
    state: RunState,
}

impl Trainer {
    /// Build the model, parameter groups, optimizer and scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model cannot
    /// be prepared.
    pub fn new(config: ZooConfig, ctx: DistributedContext) -> Result<Self> {
        config.validate()?;
        let model = prepare_model(&config, ctx.device())?;
        let groups = partition(
            &model.graph.named_parameters(),
            &config.lr.group_rules(),
            config.lr.base,
        );
        for group in &groups {
            tracing::info!(
                group = %group.name,
                tensors = group.params.len(),
                numel = group.numel(),
                lr = group.lr,
                "Parameter group"
            );
        }
        let optimizer = build_optimizer(&config.optimizer, groups);
        let scheduler = LRScheduler::new(&config.scheduler, optimizer.as_ref(), config.training.epochs);
        let run_id = match &config.run_id {
            Some(id) => id.clone(),
            None => shared_run_id(&ctx)?,
        };

        let state = RunState {
            run_id,
            start_epoch: config.training.start_epoch,
            last_epoch: None,
            best_loss: BestTracker::new(Criterion::Min),
            best_pck: BestTracker::new(Criterion::Max),
            history: Vec::new(),
        };
        Ok(Self {
            loss: LossKind::from(config.task),
            config,
            ctx,
            model,
            optimizer,
            scheduler,
            sinks: vec![Box::new(TracingSink)],
            labels: None,
            state,
        })
    }

    /// Add a metric sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Class names stored in every checkpoint.
    #[must_use]
    pub fn with_labels(mut self, labels: Option<Vec<String>>) -> Self {
        self.labels = labels;
        self
    }

    /// Continue an interrupted run: exact architecture, run id and best
    /// values restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing or does not match.
    pub fn resume_from<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let ckpt = checkpoint::load(path, self.ctx.device())?;
        let outcome = checkpoint::resume(
            &ckpt,
            &self.model.graph,
            self.optimizer.as_mut(),
            Some(&mut self.scheduler),
            ResumeMode::Strict,
        )?;
        self.state.start_epoch = outcome.start_epoch;
        if let Some(run_id) = outcome.run_id {
            self.state.run_id = run_id;
        }
        self.state.best_loss = BestTracker::with_best(Criterion::Min, outcome.best_loss);
        self.state.best_pck = BestTracker::with_best(Criterion::Max, outcome.best_pck);
        Ok(())
    }

    /// Start a new run from a prior run's checkpoint: matching weights,
    /// optimizer state and starting epoch carry over; the run id and best
    /// values stay this run's.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing or unreadable.
    pub fn follow_up_from<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let ckpt = checkpoint::load(path, self.ctx.device())?;
        let outcome = checkpoint::resume(
            &ckpt,
            &self.model.graph,
            self.optimizer.as_mut(),
            Some(&mut self.scheduler),
            ResumeMode::Partial,
        )?;
        self.state.start_epoch = outcome.start_epoch;
        Ok(())
    }

    /// Apply `checkpoint.resume` or `checkpoint.follow_up` from the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the named checkpoint cannot be applied.
    pub fn restore_from_config(&mut self) -> Result<()> {
        if let Some(path) = self.config.checkpoint.resume.clone() {
            tracing::info!(path = %path, "Resuming run");
            self.resume_from(path)?;
        } else if let Some(path) = self.config.checkpoint.follow_up.clone() {
            tracing::info!(path = %path, "Following up on prior run");
            self.follow_up_from(path)?;
        }
        Ok(())
    }

    /// Run every remaining epoch.
    ///
    /// # Errors
    ///
    /// Returns an error if any epoch, collective or checkpoint write fails.
    pub fn fit<S: BatchSource>(&mut self, train: &S, val: &S) -> Result<&RunState> {
        let training = self.config.training.clone();
        let world = self.ctx.world_size();
        let rank = self.ctx.rank();
        let train_loader = ShardedLoader::new(
            train,
            world,
            rank,
            training.shard_policy,
            training.shuffle,
            self.config.seed,
        )?;
        let val_loader = ShardedLoader::new(val, world, rank, training.shard_policy, false, self.config.seed)?;
        let policy = self.policy();
        let eval_opts = EvalOptions {
            task: self.config.task,
            thresholds: training.pck_thresholds.clone(),
            image_size: self.config.model.image_size,
        };
        let main = self.ctx.is_main_process();

        if self.state.start_epoch >= training.epochs {
            tracing::warn!(
                start_epoch = self.state.start_epoch,
                epochs = training.epochs,
                "Nothing to train"
            );
            return Ok(&self.state);
        }
        if main {
            tracing::info!(
                run_id = %self.state.run_id,
                task = %self.config.task,
                world_size = world,
                start_epoch = self.state.start_epoch,
                epochs = training.epochs,
                batches_per_epoch = train_loader.len(),
                optimizer = self.optimizer.kind().as_str(),
                "Starting training"
            );
        }

        let pb = if main {
            let remaining = training.epochs - self.state.start_epoch;
            let pb = ProgressBar::new((remaining * train_loader.len()) as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        for epoch in self.state.start_epoch..training.epochs {
            let train_loss = train_one_epoch(
                &self.model.graph,
                self.optimizer.as_mut(),
                &train_loader,
                self.loss,
                &self.ctx,
                EpochOptions {
                    epoch,
                    max_grad_norm: training.max_grad_norm,
                },
                pb.as_ref(),
            )?;
            let eval = evaluate(
                &self.model.graph,
                self.optimizer.as_mut(),
                &val_loader,
                self.loss,
                &self.ctx,
                &eval_opts,
            )?;
            self.scheduler.step(self.optimizer.as_mut(), Some(eval.mean))?;

            let report = EpochReport {
                epoch,
                train: train_loss,
                eval,
                learning_rates: self.optimizer.learning_rates(),
            };
            if main {
                let metrics = report.metrics();
                for sink in &self.sinks {
                    sink.record(epoch, &metrics)?;
                }
            }
            self.save_epoch_checkpoints(&policy, &report)?;
            self.state.last_epoch = Some(epoch);
            self.state.history.push(report);
            self.ctx.barrier()?;
        }

        if let Some(pb) = &pb {
            pb.finish_with_message("Training complete");
        }
        if let Some(epoch) = self.state.last_epoch {
            if main {
                self.save(&policy.final_path(), epoch, None)?;
            }
        }
        Ok(&self.state)
    }

    /// Best/periodic saves for one epoch. Trackers advance on every rank;
    /// only the main process writes.
    fn save_epoch_checkpoints(&mut self, policy: &CheckpointPolicy, report: &EpochReport) -> Result<()> {
        let main = self.ctx.is_main_process();
        let epoch = report.epoch;

        if self.state.best_loss.update(epoch, report.eval.mean) && main {
            let metric = CheckpointMetric {
                name: VAL_LOSS.to_string(),
                value: report.eval.mean,
            };
            tracing::info!(epoch, val_loss = report.eval.mean, "New best validation loss");
            self.save(&policy.best_loss_path(), epoch, Some(metric))?;
        }

        if self.config.task == TaskKind::Pose {
            let key = pck_key(self.config.training.best_pck_threshold);
            if let Some(pck) = report.eval.pck.get(&key).copied() {
                if self.state.best_pck.update(epoch, pck) && main {
                    let metric = CheckpointMetric {
                        name: format!("pck@{key}"),
                        value: pck,
                    };
                    tracing::info!(epoch, pck, "New best PCK");
                    self.save(&policy.best_pck_path(), epoch, Some(metric))?;
                }
            }
        }

        if policy.is_periodic(epoch) && main {
            self.save(&policy.latest_path(), epoch, None)?;
        }
        Ok(())
    }

    fn save(&self, path: &Path, epoch: usize, metric: Option<CheckpointMetric>) -> Result<()> {
        checkpoint::save(
            path,
            &SaveRequest {
                graph: &self.model.graph,
                optimizer: self.optimizer.as_ref(),
                scheduler: Some(self.scheduler.state()),
                epoch,
                run_id: &self.state.run_id,
                metric,
                labels: self.labels.as_deref(),
                trainable_only: self.config.checkpoint.save_trainable_only,
                task: self.config.task,
                best_loss: self.state.best_loss.best(),
                best_pck: self.state.best_pck.best(),
            },
        )
    }

    /// Checkpoint layout of the current run id.
    #[must_use]
    pub fn policy(&self) -> CheckpointPolicy {
        CheckpointPolicy::new(
            self.config.run_checkpoint_dir(&self.state.run_id),
            self.config.checkpoint.save_every,
        )
    }

    /// Run state.
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Adapted model.
    #[must_use]
    pub fn graph(&self) -> &ModuleGraph {
        &self.model.graph
    }

    /// Optimizer.
    #[must_use]
    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Configuration the run was built from.
    #[must_use]
    pub fn config(&self) -> &ZooConfig {
        &self.config
    }
}
