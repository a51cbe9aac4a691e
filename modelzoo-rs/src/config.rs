//! Configuration parsing and validation.
//!
//! The configuration is loaded once, validated, and never mutated after
//! training starts. Command-line overrides produce a new value through
//! [`ZooConfig::with_overrides`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZooError};

/// Placeholder replaced by the root directory when a config file is loaded.
pub const ROOT_DIR_PLACEHOLDER: &str = "${ROOT_DIR}";

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use modelzoo_rs::ZooConfig;
///
/// # fn main() -> modelzoo_rs::Result<()> {
/// let mut config = ZooConfig::from_preset("pose")?;
/// config.dataset.path = "./data/coco-subset".into();
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZooConfig {
    /// Task the model is adapted for.
    pub task: TaskKind,

    /// Backbone and head dimensions.
    #[serde(default)]
    pub model: ModelSettings,

    /// LoRA adapter settings.
    #[serde(default)]
    pub lora: LoraSettings,

    /// Learning rates and parameter-group rules.
    #[serde(default)]
    pub lr: LrSettings,

    /// Optimizer settings.
    #[serde(default)]
    pub optimizer: OptimizerSettings,

    /// Learning rate scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Training loop settings.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset location.
    pub dataset: DatasetConfig,

    /// Checkpoint policy and resumption.
    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    /// Output directory for logs and merged models.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Stable run identifier. Generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,

    /// Random seed for weight initialization, dropout and shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

/// Task family. Selects the head shape, loss and evaluation metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Image classification.
    #[default]
    Classification,
    /// Bounding-box regression.
    Bbox,
    /// Per-pixel segmentation.
    Segmentation,
    /// Image generation / reconstruction.
    Generation,
    /// Keypoint heatmap estimation.
    Pose,
}

impl TaskKind {
    /// All task kinds, in preset order.
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Classification,
        TaskKind::Bbox,
        TaskKind::Segmentation,
        TaskKind::Generation,
        TaskKind::Pose,
    ];

    /// Config-file name of the task.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Classification => "classification",
            TaskKind::Bbox => "bbox",
            TaskKind::Segmentation => "segmentation",
            TaskKind::Generation => "generation",
            TaskKind::Pose => "pose",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ZooError;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|task| task.as_str() == s)
            .ok_or_else(|| ZooError::Config(format!("unknown task: {s}")))
    }
}

/// Backbone and head dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Flattened input features per sample.
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,

    /// Embedding width of the backbone.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Number of backbone blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Hidden width multiplier of each block's MLP.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,

    /// Output classes (classification, segmentation).
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Keypoints per instance (pose).
    #[serde(default = "default_num_keypoints")]
    pub num_keypoints: usize,

    /// Output map size `[height, width]` (pose heatmaps, segmentation masks).
    #[serde(default = "default_output_size")]
    pub output_size: [usize; 2],

    /// Input image size `[height, width]`, used to map decoded heatmap
    /// coordinates back to image pixels.
    #[serde(default = "default_image_size")]
    pub image_size: [usize; 2],

    /// Optional pretrained backbone weights (safetensors).
    #[serde(default)]
    pub pretrained: Option<String>,
}

fn default_input_dim() -> usize {
    768
}
fn default_embed_dim() -> usize {
    64
}
fn default_depth() -> usize {
    2
}
fn default_mlp_ratio() -> usize {
    2
}
fn default_num_classes() -> usize {
    10
}
fn default_num_keypoints() -> usize {
    17
}
fn default_output_size() -> [usize; 2] {
    [16, 16]
}
fn default_image_size() -> [usize; 2] {
    [64, 64]
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            embed_dim: default_embed_dim(),
            depth: default_depth(),
            mlp_ratio: default_mlp_ratio(),
            num_classes: default_num_classes(),
            num_keypoints: default_num_keypoints(),
            output_size: default_output_size(),
            image_size: default_image_size(),
            pretrained: None,
        }
    }
}

/// LoRA-specific settings.
///
/// # Example
///
/// ```rust
/// use modelzoo_rs::config::LoraSettings;
///
/// let lora = LoraSettings {
///     r: 16,
///     alpha: 32,
///     target_modules: vec!["attn.qkv".to_string(), "attn.proj".to_string()],
///     ..Default::default()
/// };
///
/// assert_eq!(lora.scale(), 2.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Inject adapters at all. When false the unfreeze keywords still apply.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rank of the low-rank decomposition.
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// Scaling numerator; the residual is scaled by `alpha / r`.
    #[serde(default = "default_lora_alpha")]
    pub alpha: usize,

    /// Dropout applied to the adapter input during training.
    #[serde(default = "default_lora_dropout")]
    pub dropout: f32,

    /// Substrings selecting the linear layers to wrap.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Parameter-name substrings that stay trainable. Empty means the task
    /// default.
    #[serde(default)]
    pub unfreeze_keywords: Vec<String>,

    /// Treat a configuration that wraps zero layers as an error.
    #[serde(default)]
    pub require_match: bool,
}

fn default_true() -> bool {
    true
}
fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> usize {
    16
}
fn default_lora_dropout() -> f32 {
    0.1
}
fn default_target_modules() -> Vec<String> {
    vec!["qkv".into()]
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
            unfreeze_keywords: Vec::new(),
            require_match: false,
        }
    }
}

impl LoraSettings {
    /// Residual scale `alpha / r`.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }
}

/// One learning-rate rule: parameters whose name contains `pattern` go to
/// the group `name` with rate `lr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrRule {
    /// Group name.
    pub name: String,
    /// Substring matched against dotted parameter names.
    pub pattern: String,
    /// Learning rate of the group.
    pub lr: f64,
}

/// Learning rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrSettings {
    /// Rate of the default group (everything not matched by a rule).
    #[serde(default = "default_base_lr")]
    pub base: f64,

    /// Rate of adapter parameters when no explicit rules are given.
    #[serde(default = "default_lora_lr")]
    pub lora: f64,

    /// Ordered rules; first match wins. Overrides the `lora` shorthand.
    #[serde(default)]
    pub rules: Vec<LrRule>,
}

fn default_base_lr() -> f64 {
    1e-4
}
fn default_lora_lr() -> f64 {
    1e-3
}

impl Default for LrSettings {
    fn default() -> Self {
        Self {
            base: default_base_lr(),
            lora: default_lora_lr(),
            rules: Vec::new(),
        }
    }
}

impl LrSettings {
    /// Effective ordered rule list.
    #[must_use]
    pub fn group_rules(&self) -> Vec<LrRule> {
        if self.rules.is_empty() {
            vec![LrRule {
                name: "lora".into(),
                pattern: "lora_".into(),
                lr: self.lora,
            }]
        } else {
            self.rules.clone()
        }
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Decoupled weight-decay Adam.
    #[serde(rename = "adamw")]
    AdamW,
    /// Schedule-free AdamW with explicit train/eval parameter modes.
    #[default]
    #[serde(rename = "adamw_schedule_free")]
    AdamWScheduleFree,
    /// SGD with momentum.
    #[serde(rename = "sgd")]
    Sgd,
}

impl OptimizerKind {
    /// Config-file name of the optimizer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::AdamWScheduleFree => "adamw_schedule_free",
            OptimizerKind::Sgd => "sgd",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = ZooError;

    fn from_str(s: &str) -> Result<Self> {
        [
            OptimizerKind::AdamW,
            OptimizerKind::AdamWScheduleFree,
            OptimizerKind::Sgd,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| ZooError::Config(format!("unknown optimizer: {s}")))
    }
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Optimizer family.
    #[serde(default)]
    pub kind: OptimizerKind,
    /// Weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// First-moment coefficient (also the schedule-free interpolation).
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Second-moment coefficient.
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Denominator epsilon.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Schedule-free linear warmup steps.
    #[serde(default)]
    pub warmup_steps: usize,
}

fn default_weight_decay() -> f64 {
    0.01
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}
fn default_momentum() -> f64 {
    0.9
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::default(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            momentum: default_momentum(),
            warmup_steps: 0,
        }
    }
}

/// Learning rate scheduler family. Stepped once per epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Keep the initial rates.
    #[default]
    Constant,
    /// Cosine annealing from the initial rate to `min_lr` over the run.
    Cosine,
    /// Multiply by `gamma` every `step_size` epochs.
    Step,
    /// Multiply by `factor` after `patience` epochs without a new best
    /// validation loss.
    Plateau,
}

impl FromStr for SchedulerKind {
    type Err = ZooError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constant" => Ok(SchedulerKind::Constant),
            "cosine" => Ok(SchedulerKind::Cosine),
            "step" => Ok(SchedulerKind::Step),
            "plateau" => Ok(SchedulerKind::Plateau),
            _ => Err(ZooError::Config(format!("unknown scheduler: {s}"))),
        }
    }
}

/// Scheduler hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Scheduler family.
    #[serde(default)]
    pub kind: SchedulerKind,
    /// Epochs between decays (step).
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    /// Decay factor (step).
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Floor of the cosine schedule.
    #[serde(default)]
    pub min_lr: f64,
    /// Epochs without improvement before decaying (plateau).
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Decay factor (plateau).
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_step_size() -> usize {
    10
}
fn default_gamma() -> f64 {
    0.1
}
fn default_patience() -> usize {
    3
}
fn default_factor() -> f64 {
    0.5
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::default(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            min_lr: 0.0,
            patience: default_patience(),
            factor: default_factor(),
        }
    }
}

/// How uneven shards are equalized across processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardPolicy {
    /// Drop the trailing batches that would make shards uneven.
    #[default]
    Drop,
    /// Wrap around to the start of the dataset to fill short shards.
    Pad,
}

/// Training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Total number of epochs (exclusive upper bound of the epoch counter).
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// First epoch of a fresh run.
    #[serde(default)]
    pub start_epoch: usize,

    /// Training batch size per process.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Validation batch size per process.
    #[serde(default = "default_val_batch_size")]
    pub val_batch_size: usize,

    /// Global gradient-norm clip. Non-positive disables clipping.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// PCK distance thresholds (fraction of the normalization scale).
    #[serde(default = "default_pck_thresholds")]
    pub pck_thresholds: Vec<f64>,

    /// Threshold whose PCK drives the best-accuracy checkpoint.
    #[serde(default = "default_best_pck_threshold")]
    pub best_pck_threshold: f64,

    /// Equalization of per-process shards.
    #[serde(default)]
    pub shard_policy: ShardPolicy,

    /// Shuffle the training shard every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

fn default_epochs() -> usize {
    50
}
fn default_batch_size() -> usize {
    8
}
fn default_val_batch_size() -> usize {
    1
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_pck_thresholds() -> Vec<f64> {
    vec![0.05, 0.1, 0.2]
}
fn default_best_pck_threshold() -> f64 {
    0.1
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            start_epoch: 0,
            batch_size: default_batch_size(),
            val_batch_size: default_val_batch_size(),
            max_grad_norm: default_grad_norm(),
            pck_thresholds: default_pck_thresholds(),
            best_pck_threshold: default_best_pck_threshold(),
            shard_policy: ShardPolicy::default(),
            shuffle: true,
        }
    }
}

/// Dataset location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory holding the split files.
    pub path: String,

    /// Training split file stem.
    #[serde(default = "default_train_split")]
    pub train_split: String,

    /// Validation split file stem.
    #[serde(default = "default_val_split")]
    pub val_split: String,
}

fn default_train_split() -> String {
    "train".into()
}
fn default_val_split() -> String {
    "val".into()
}

impl DatasetConfig {
    /// Path of a split file.
    #[must_use]
    pub fn split_path(&self, split: &str) -> PathBuf {
        Path::new(&self.path).join(format!("{split}.safetensors"))
    }
}

/// Checkpoint policy and resumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Root directory; checkpoints of a run go to `<dir>/<run_id>`.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,

    /// Persist only trainable parameters.
    #[serde(default = "default_true")]
    pub save_trainable_only: bool,

    /// Save `latest` every N epochs. Zero disables periodic saves.
    #[serde(default = "default_save_every")]
    pub save_every: usize,

    /// Resume the same run (same architecture, same run id).
    #[serde(default)]
    pub resume: Option<String>,

    /// Continue from a prior run under the current run id.
    #[serde(default)]
    pub follow_up: Option<String>,
}

fn default_checkpoint_dir() -> String {
    format!("{ROOT_DIR_PLACEHOLDER}/checkpoints/lora_weights")
}
fn default_save_every() -> usize {
    5
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            save_trainable_only: true,
            save_every: default_save_every(),
            resume: None,
            follow_up: None,
        }
    }
}

/// Values that the command line may override.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Dataset directory.
    pub data_path: Option<String>,
    /// Total epochs.
    pub epochs: Option<usize>,
    /// Training batch size.
    pub batch_size: Option<usize>,
    /// Run identifier.
    pub run_id: Option<String>,
    /// Checkpoint to resume.
    pub resume: Option<String>,
    /// Checkpoint to follow up on.
    pub follow_up: Option<String>,
}

impl ZooConfig {
    /// Load configuration from a YAML file, resolving `${ROOT_DIR}` to the
    /// current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = std::env::current_dir()?;
        Self::from_file_with_root(path, &root)
    }

    /// Load configuration from a YAML file, resolving `${ROOT_DIR}` to
    /// `root_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file_with_root<P: AsRef<Path>>(path: P, root_dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_root(&content, root_dir)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or names an unknown kind.
    pub fn from_yaml_with_root(content: &str, root_dir: &Path) -> Result<Self> {
        let root = root_dir.to_string_lossy();
        let resolved = content.replace(ROOT_DIR_PLACEHOLDER, &root);
        let mut config: Self = serde_yaml::from_str(&resolved)?;
        config.resolve_root(&root);
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    // Serde defaults may themselves carry the placeholder.
    fn resolve_root(&mut self, root: &str) {
        self.checkpoint.dir = self.checkpoint.dir.replace(ROOT_DIR_PLACEHOLDER, root);
        self.output_dir = self.output_dir.replace(ROOT_DIR_PLACEHOLDER, root);
        self.dataset.path = self.dataset.path.replace(ROOT_DIR_PLACEHOLDER, root);
    }

    /// Create a configuration from a task preset.
    ///
    /// Available presets: `classification`, `bbox`, `segmentation`,
    /// `generation`, `pose`.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Config`] for an unknown preset.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let task = TaskKind::from_str(preset)
            .map_err(|_| ZooError::Config(format!("Unknown preset: {preset}")))?;
        Ok(Self::preset(task))
    }

    /// Preset for a task.
    #[must_use]
    pub fn preset(task: TaskKind) -> Self {
        let mut config = Self {
            task,
            model: ModelSettings::default(),
            lora: LoraSettings::default(),
            lr: LrSettings::default(),
            optimizer: OptimizerSettings::default(),
            scheduler: SchedulerSettings::default(),
            training: TrainingConfig::default(),
            dataset: DatasetConfig {
                path: "./data".into(),
                ..Default::default()
            },
            checkpoint: CheckpointSettings::default(),
            output_dir: format!("./outputs/{task}"),
            run_id: None,
            seed: default_seed(),
        };
        match task {
            TaskKind::Classification => {
                config.lora.target_modules = vec!["attn.qkv".into()];
            }
            TaskKind::Pose => {
                config.lora.target_modules = vec!["attn.qkv".into(), "attn.proj".into()];
                config.scheduler.kind = SchedulerKind::Plateau;
                config.optimizer.kind = OptimizerKind::AdamW;
            }
            TaskKind::Bbox | TaskKind::Segmentation | TaskKind::Generation => {}
        }
        config
    }

    /// Parameter-name keywords that stay trainable after adaptation.
    #[must_use]
    pub fn unfreeze_keywords(&self) -> Vec<String> {
        if !self.lora.unfreeze_keywords.is_empty() {
            return self.lora.unfreeze_keywords.clone();
        }
        let mut keywords = vec!["lora_a".to_string(), "lora_b".to_string()];
        if self.task != TaskKind::Generation {
            keywords.push("head".into());
        }
        keywords
    }

    /// Checkpoint directory of a run.
    #[must_use]
    pub fn run_checkpoint_dir(&self, run_id: &str) -> PathBuf {
        Path::new(&self.checkpoint.dir).join(run_id)
    }

    /// Apply command-line overrides, returning a new configuration.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(path) = overrides.data_path {
            self.dataset.path = path;
        }
        if let Some(epochs) = overrides.epochs {
            self.training.epochs = epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.training.batch_size = batch_size;
        }
        if overrides.run_id.is_some() {
            self.run_id = overrides.run_id;
        }
        if overrides.resume.is_some() {
            self.checkpoint.resume = overrides.resume;
        }
        if overrides.follow_up.is_some() {
            self.checkpoint.follow_up = overrides.follow_up;
        }
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.path.is_empty() {
            return Err(ZooError::Config("dataset.path is required".into()));
        }
        if self.lora.enabled && self.lora.r == 0 {
            return Err(ZooError::Config("lora.r must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.lora.dropout) {
            return Err(ZooError::Config("lora.dropout must be in [0, 1)".into()));
        }
        if self.training.batch_size == 0 || self.training.val_batch_size == 0 {
            return Err(ZooError::Config("batch sizes must be > 0".into()));
        }
        if self.training.start_epoch >= self.training.epochs {
            return Err(ZooError::Config(format!(
                "training.start_epoch ({}) must be < training.epochs ({})",
                self.training.start_epoch, self.training.epochs
            )));
        }
        if self.model.depth == 0 || self.model.embed_dim == 0 || self.model.input_dim == 0 {
            return Err(ZooError::Config("model dimensions must be > 0".into()));
        }
        if self.lr.base <= 0.0 || self.lr.group_rules().iter().any(|rule| rule.lr <= 0.0) {
            return Err(ZooError::Config("learning rates must be > 0".into()));
        }
        if self.task == TaskKind::Pose {
            if self.training.pck_thresholds.is_empty() {
                return Err(ZooError::Config(
                    "training.pck_thresholds must not be empty for pose".into(),
                ));
            }
            if self
                .training
                .pck_thresholds
                .iter()
                .any(|t| !(*t > 0.0 && *t <= 1.0))
            {
                return Err(ZooError::Config(
                    "training.pck_thresholds must lie in (0, 1]".into(),
                ));
            }
            if !self
                .training
                .pck_thresholds
                .iter()
                .any(|t| (t - self.training.best_pck_threshold).abs() < 1e-12)
            {
                return Err(ZooError::Config(format!(
                    "training.best_pck_threshold {} is not one of the PCK thresholds",
                    self.training.best_pck_threshold
                )));
            }
        }
        if self.checkpoint.resume.is_some() && self.checkpoint.follow_up.is_some() {
            return Err(ZooError::Config(
                "checkpoint.resume and checkpoint.follow_up are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Generate a fresh run identifier: UTC timestamp plus a random suffix.
#[must_use]
pub fn generate_run_id() -> String {
    use rand::Rng;

    run_id_from_parts(chrono::Utc::now().timestamp(), rand::thread_rng().gen())
}

/// Format a run identifier from a UNIX timestamp (seconds) and a suffix.
#[must_use]
pub fn run_id_from_parts(timestamp: i64, suffix: u32) -> String {
    let stamp = chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map_or_else(|| timestamp.to_string(), |t| t.format("%Y%m%d-%H%M%S").to_string());
    format!("run-{stamp}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_serialization() {
        let config = ZooConfig::preset(TaskKind::Pose);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: ZooConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.task, restored.task);
        assert_eq!(config.lora.target_modules, restored.lora.target_modules);
        assert_eq!(config.optimizer.kind, restored.optimizer.kind);
    }

    #[test]
    fn test_presets() {
        for task in TaskKind::ALL {
            let config = ZooConfig::from_preset(task.as_str()).unwrap();
            assert_eq!(config.task, task);
            assert!(config.validate().is_ok());
        }
        assert!(ZooConfig::from_preset("invalid").is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = "task: classification\ndataset:\n  path: ./data\n";
        let config = ZooConfig::from_yaml_with_root(yaml, Path::new("/srv/zoo")).unwrap();
        assert_eq!(config.lora.r, 8);
        assert_eq!(config.lora.alpha, 16);
        assert_eq!(config.optimizer.kind, OptimizerKind::AdamWScheduleFree);
        assert_eq!(config.training.pck_thresholds, vec![0.05, 0.1, 0.2]);
        assert_eq!(config.checkpoint.dir, "/srv/zoo/checkpoints/lora_weights");
    }

    #[test]
    fn test_root_dir_substitution() {
        let yaml = "task: pose\ndataset:\n  path: ${ROOT_DIR}/datasets/pose\noutput_dir: ${ROOT_DIR}/out\n";
        let config = ZooConfig::from_yaml_with_root(yaml, Path::new("/work")).unwrap();
        assert_eq!(config.dataset.path, "/work/datasets/pose");
        assert_eq!(config.output_dir, "/work/out");
    }

    #[test]
    fn test_unknown_optimizer_is_config_error() {
        let yaml = "task: pose\ndataset:\n  path: ./d\noptimizer:\n  kind: lamb\n";
        let err = ZooConfig::from_yaml_with_root(yaml, Path::new(".")).unwrap_err();
        assert!(err.is_config());

        let err = "lamb".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, ZooError::Config(_)));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert_eq!(
            "adamw_schedule_free".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::AdamWScheduleFree
        );
        assert_eq!("plateau".parse::<SchedulerKind>().unwrap(), SchedulerKind::Plateau);
        assert!("linear".parse::<SchedulerKind>().is_err());
        assert_eq!("bbox".parse::<TaskKind>().unwrap(), TaskKind::Bbox);
    }

    #[test]
    fn test_default_lr_rules() {
        let lr = LrSettings::default();
        let rules = lr.group_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "lora");
        assert_eq!(rules[0].lr, 1e-3);
    }

    #[test]
    fn test_explicit_lr_rules_replace_shorthand() {
        let lr = LrSettings {
            rules: vec![
                LrRule {
                    name: "head".into(),
                    pattern: "head".into(),
                    lr: 5e-4,
                },
                LrRule {
                    name: "adapters".into(),
                    pattern: "lora_".into(),
                    lr: 2e-3,
                },
            ],
            ..Default::default()
        };
        let names: Vec<_> = lr.group_rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["head", "adapters"]);
    }

    #[test]
    fn test_unfreeze_keywords_per_task() {
        let classification = ZooConfig::preset(TaskKind::Classification);
        assert_eq!(
            classification.unfreeze_keywords(),
            vec!["lora_a", "lora_b", "head"]
        );

        let generation = ZooConfig::preset(TaskKind::Generation);
        assert_eq!(generation.unfreeze_keywords(), vec!["lora_a", "lora_b"]);

        let mut custom = ZooConfig::preset(TaskKind::Pose);
        custom.lora.unfreeze_keywords = vec!["lora".into(), "norm".into()];
        assert_eq!(custom.unfreeze_keywords(), vec!["lora", "norm"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.dataset.path = String::new();
        assert!(config.validate().is_err());

        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.lora.r = 0;
        assert!(config.validate().is_err());

        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.training.best_pck_threshold = 0.3;
        assert!(config.validate().is_err());

        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.training.start_epoch = config.training.epochs;
        assert!(config.validate().is_err());

        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.checkpoint.resume = Some("a".into());
        config.checkpoint.follow_up = Some("b".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_produce_new_value() {
        let config = ZooConfig::preset(TaskKind::Classification).with_overrides(ConfigOverrides {
            data_path: Some("/data/cats".into()),
            epochs: Some(3),
            run_id: Some("deploy-7".into()),
            ..Default::default()
        });
        assert_eq!(config.dataset.path, "/data/cats");
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.run_id.as_deref(), Some("deploy-7"));
        assert_eq!(config.training.batch_size, 8);
        assert!(config
            .run_checkpoint_dir("deploy-7")
            .ends_with("lora_weights/deploy-7"));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(ZooConfig::from_file("/nonexistent/path/config.yaml").is_err());
    }

    #[test]
    fn test_load_config_malformed_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "invalid: yaml: content: [[[").unwrap();
        assert!(ZooConfig::from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_save_config_roundtrip() {
        let config = ZooConfig::preset(TaskKind::Segmentation);
        let temp_file = NamedTempFile::new().unwrap();
        config.to_file(temp_file.path()).unwrap();
        let loaded = ZooConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.task, loaded.task);
        assert_eq!(config.lora.r, loaded.lora.r);
        assert_eq!(config.lr.base, loaded.lr.base);
    }

    #[test]
    fn test_generated_run_ids_differ() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_id_from_parts() {
        assert_eq!(run_id_from_parts(0, 0xbeef), "run-19700101-000000-0000beef");
    }
}
