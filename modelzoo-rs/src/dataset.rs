//! Dataset boundary, per-process sharding and the safetensors-backed dataset.
//!
//! Decoding and augmentation happen outside this crate; a split arrives as a
//! safetensors file of stacked sample tensors:
//!
//! | tensor | shape | tasks |
//! |---|---|---|
//! | `inputs` | `(N, input_dim)` | all |
//! | `targets` | per task | all but pose |
//! | `heatmaps` | `(N, K, H, W)` | pose |
//! | `keypoints` | `(N, K, 2)` image pixels | pose |
//! | `visibility` | `(N, K)` | pose |
//! | `scale` | `(N,)` | pose |
//!
//! Class names may be stored as a JSON list under the `labels` metadata key.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{ShardPolicy, TaskKind, ZooConfig};
use crate::error::{Result, ZooError};

/// Metadata key holding the class-name list.
pub const LABELS_KEY: &str = "labels";

/// Keypoint ground truth of a pose batch.
#[derive(Debug, Clone)]
pub struct KeypointTargets {
    /// Joint positions in input-image pixels, `(B, K, 2)` as `(x, y)`.
    pub joints: Tensor,
    /// Visibility flags, `(B, K)`; positive means the joint counts.
    pub visibility: Tensor,
    /// Per-sample normalization scale, `(B,)`.
    pub scale: Tensor,
}

/// One batch of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Model inputs, `(B, input_dim)`.
    pub inputs: Tensor,
    /// Loss targets (class ids, boxes, masks, images or heatmaps).
    pub targets: Tensor,
    /// Keypoint ground truth for pose batches.
    pub keypoints: Option<KeypointTargets>,
}

impl Batch {
    /// Number of samples.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }
}

/// Indexed source of batches with a stable length.
pub trait BatchSource {
    /// Number of batches.
    fn len(&self) -> usize;

    /// Whether there are no batches.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range index or a tensor failure.
    fn get(&self, index: usize) -> Result<Batch>;
}

/// Which batches a process visits. Every rank gets the same count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    total: usize,
    world_size: usize,
    rank: usize,
    per_rank: usize,
}

impl ShardPlan {
    /// Plan `total` batches over `world_size` ranks.
    ///
    /// # Errors
    ///
    /// Returns an error if `rank` is outside the world.
    pub fn new(total: usize, world_size: usize, rank: usize, policy: ShardPolicy) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ZooError::Dataset(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        let per_rank = match policy {
            ShardPolicy::Drop => total / world_size,
            ShardPolicy::Pad => total.div_ceil(world_size),
        };
        if per_rank * world_size != total {
            tracing::debug!(
                total,
                world_size,
                per_rank,
                ?policy,
                "Equalizing uneven shards"
            );
        }
        if per_rank == 0 && total > 0 {
            tracing::warn!(total, world_size, "Shard is empty; every rank skips this split");
        }
        Ok(Self {
            total,
            world_size,
            rank,
            per_rank,
        })
    }

    /// Batches per rank.
    #[must_use]
    pub fn per_rank(&self) -> usize {
        self.per_rank
    }

    /// This rank's batch indices, strided over `order`. Positions past the
    /// end wrap to the start.
    #[must_use]
    pub fn indices(&self, order: &[usize]) -> Vec<usize> {
        if self.total == 0 {
            return Vec::new();
        }
        (0..self.per_rank)
            .map(|i| order[(self.rank + i * self.world_size) % self.total])
            .collect()
    }
}

/// Iterates one rank's shard of a [`BatchSource`].
#[derive(Debug)]
pub struct ShardedLoader<'a, S: BatchSource> {
    source: &'a S,
    plan: ShardPlan,
    shuffle: bool,
    seed: u64,
}

impl<'a, S: BatchSource> ShardedLoader<'a, S> {
    /// Loader for `rank` of `world_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard plan is invalid.
    pub fn new(
        source: &'a S,
        world_size: usize,
        rank: usize,
        policy: ShardPolicy,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        Ok(Self {
            source,
            plan: ShardPlan::new(source.len(), world_size, rank, policy)?,
            shuffle,
            seed,
        })
    }

    /// Batches this rank visits per epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plan.per_rank()
    }

    /// Whether this rank visits no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch indices for `epoch`. The permutation depends only on the seed
    /// and the epoch, so all ranks agree on it.
    #[must_use]
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        self.plan.indices(&order)
    }

    /// Batches of `epoch` in order.
    pub fn iter(&self, epoch: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        self.epoch_indices(epoch)
            .into_iter()
            .map(move |index| self.source.get(index))
    }
}

/// In-memory dataset of stacked sample tensors, served in fixed-size
/// batches.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Tensor,
    targets: Tensor,
    keypoints: Option<KeypointTargets>,
    labels: Option<Vec<String>>,
    batch_size: usize,
}

impl TensorDataset {
    /// Build from tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if the leading dimensions disagree or the batch size
    /// is zero.
    pub fn new(
        inputs: Tensor,
        targets: Tensor,
        keypoints: Option<KeypointTargets>,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ZooError::Dataset("batch size must be > 0".into()));
        }
        let n = inputs.dims().first().copied().unwrap_or(0);
        let mut lengths = vec![("targets", targets.dims().first().copied().unwrap_or(0))];
        if let Some(kp) = &keypoints {
            lengths.push(("keypoints", kp.joints.dims()[0]));
            lengths.push(("visibility", kp.visibility.dims()[0]));
            lengths.push(("scale", kp.scale.dims()[0]));
        }
        for (name, len) in lengths {
            if len != n {
                return Err(ZooError::Dataset(format!(
                    "{name} has {len} samples, inputs have {n}"
                )));
            }
        }
        Ok(Self {
            inputs,
            targets,
            keypoints,
            labels: None,
            batch_size,
        })
    }

    /// Attach class names.
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Class names, if the split carries them.
    #[must_use]
    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Number of samples.
    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.inputs.dims()[0]
    }

    /// Load a split file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or lacks required tensors.
    pub fn load<P: AsRef<Path>>(path: P, batch_size: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ZooError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(path)?;
        let mut tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
        let mut take = |name: &str| tensors.remove(name);

        let inputs = take("inputs")
            .ok_or_else(|| ZooError::Dataset(format!("{}: missing 'inputs'", path.display())))?;
        let heatmaps = take("heatmaps");
        let keypoints = match (take("keypoints"), take("visibility"), take("scale")) {
            (Some(joints), Some(visibility), Some(scale)) => Some(KeypointTargets {
                joints: joints.to_dtype(DType::F32)?,
                visibility: visibility.to_dtype(DType::F32)?,
                scale: scale.to_dtype(DType::F32)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ZooError::Dataset(format!(
                    "{}: keypoints, visibility and scale must be stored together",
                    path.display()
                )))
            }
        };
        let targets = heatmaps.or_else(|| take("targets")).ok_or_else(|| {
            ZooError::Dataset(format!(
                "{}: missing 'targets' (or 'heatmaps')",
                path.display()
            ))
        })?;

        let mut dataset = Self::new(inputs.to_dtype(DType::F32)?, targets, keypoints, batch_size)?;
        let (_, metadata) = safetensors::SafeTensors::read_metadata(&bytes)?;
        if let Some(raw) = metadata.metadata().as_ref().and_then(|m| m.get(LABELS_KEY)) {
            dataset.labels = Some(serde_json::from_str(raw)?);
        }
        tracing::info!(
            path = %path.display(),
            samples = dataset.num_samples(),
            batches = dataset.len(),
            "Loaded dataset split"
        );
        Ok(dataset)
    }

    /// Write the dataset as a split file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: Vec<(&str, Tensor)> = vec![("inputs", self.inputs.clone())];
        match &self.keypoints {
            Some(kp) => {
                tensors.push(("heatmaps", self.targets.clone()));
                tensors.push(("keypoints", kp.joints.clone()));
                tensors.push(("visibility", kp.visibility.clone()));
                tensors.push(("scale", kp.scale.clone()));
            }
            None => tensors.push(("targets", self.targets.clone())),
        }
        let metadata = match &self.labels {
            Some(labels) => Some(HashMap::from([(
                LABELS_KEY.to_string(),
                serde_json::to_string(labels)?,
            )])),
            None => None,
        };
        safetensors::tensor::serialize_to_file(tensors, &metadata, path.as_ref())?;
        Ok(())
    }

    /// Synthetic, learnable samples shaped for `config`'s task and model.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn synthetic(config: &ZooConfig, samples: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let model = &config.model;
        let d = model.input_dim;
        let mut inputs: Vec<f32> = (0..samples * d)
            .map(|_| rng.gen_range(-0.5f32..0.5))
            .collect();
        let batch_size = config.training.batch_size;

        let dataset = match config.task {
            TaskKind::Classification => {
                let classes: Vec<u32> = (0..samples)
                    .map(|_| rng.gen_range(0..model.num_classes as u32))
                    .collect();
                for (i, class) in classes.iter().enumerate() {
                    inputs[i * d + (*class as usize % d)] += 2.0;
                }
                let labels = (0..model.num_classes).map(|c| format!("class_{c}")).collect();
                Self::new(
                    Tensor::from_vec(inputs, (samples, d), device)?,
                    Tensor::from_vec(classes, samples, device)?,
                    None,
                    batch_size,
                )?
                .with_labels(labels)
            }
            TaskKind::Bbox => {
                let boxes: Vec<f32> = (0..samples * 4).map(|_| rng.gen_range(0.0f32..1.0)).collect();
                Self::new(
                    Tensor::from_vec(inputs, (samples, d), device)?,
                    Tensor::from_vec(boxes, (samples, 4), device)?,
                    None,
                    batch_size,
                )?
            }
            TaskKind::Segmentation => {
                let pixels = model.output_size[0] * model.output_size[1];
                let mask: Vec<u32> = (0..samples * pixels)
                    .map(|_| rng.gen_range(0..model.num_classes as u32))
                    .collect();
                Self::new(
                    Tensor::from_vec(inputs, (samples, d), device)?,
                    Tensor::from_vec(mask, (samples, pixels), device)?,
                    None,
                    batch_size,
                )?
            }
            TaskKind::Generation => {
                let inputs = Tensor::from_vec(inputs, (samples, d), device)?;
                Self::new(inputs.clone(), inputs, None, batch_size)?
            }
            TaskKind::Pose => synthetic_pose(config, inputs, samples, &mut rng, device)?,
        };
        Ok(dataset)
    }
}

fn synthetic_pose(
    config: &ZooConfig,
    inputs: Vec<f32>,
    samples: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<TensorDataset> {
    let model = &config.model;
    let k = model.num_keypoints;
    let [h, w] = model.output_size;
    let [img_h, img_w] = model.image_size;
    let stride_x = img_w as f32 / w as f32;
    let stride_y = img_h as f32 / h as f32;

    let mut heatmaps = Vec::with_capacity(samples * k * h * w);
    let mut joints = Vec::with_capacity(samples * k * 2);
    let mut visibility = Vec::with_capacity(samples * k);
    for _ in 0..samples {
        for _ in 0..k {
            let cx = rng.gen_range(0..w);
            let cy = rng.gen_range(0..h);
            heatmaps.extend(render_heatmap(cx as f32, cy as f32, h, w, 1.0));
            joints.push(cx as f32 * stride_x);
            joints.push(cy as f32 * stride_y);
            visibility.push(if rng.gen_bool(0.9) { 1.0f32 } else { 0.0 });
        }
    }
    let scale = vec![img_h.max(img_w) as f32; samples];
    TensorDataset::new(
        Tensor::from_vec(inputs, (samples, model.input_dim), device)?,
        Tensor::from_vec(heatmaps, (samples, k, h, w), device)?,
        Some(KeypointTargets {
            joints: Tensor::from_vec(joints, (samples, k, 2), device)?,
            visibility: Tensor::from_vec(visibility, (samples, k), device)?,
            scale: Tensor::from_vec(scale, samples, device)?,
        }),
        config.training.batch_size,
    )
}

/// Unnormalized Gaussian heatmap of size `h × w` centred at `(cx, cy)`.
#[must_use]
pub fn render_heatmap(cx: f32, cy: f32, h: usize, w: usize, sigma: f32) -> Vec<f32> {
    let denom = 2.0 * sigma * sigma;
    let mut map = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            map.push((-(dx * dx + dy * dy) / denom).exp());
        }
    }
    map
}

impl BatchSource for TensorDataset {
    fn len(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    fn get(&self, index: usize) -> Result<Batch> {
        let n = self.num_samples();
        let start = index * self.batch_size;
        if start >= n {
            return Err(ZooError::Dataset(format!(
                "batch {index} out of range ({} batches)",
                self.len()
            )));
        }
        let len = self.batch_size.min(n - start);
        let keypoints = match &self.keypoints {
            Some(kp) => Some(KeypointTargets {
                joints: kp.joints.narrow(0, start, len)?,
                visibility: kp.visibility.narrow(0, start, len)?,
                scale: kp.scale.narrow(0, start, len)?,
            }),
            None => None,
        };
        Ok(Batch {
            inputs: self.inputs.narrow(0, start, len)?,
            targets: self.targets.narrow(0, start, len)?,
            keypoints,
        })
    }
}

/// Load the training and validation splits named in `config`.
///
/// # Errors
///
/// Returns an error if either split cannot be loaded.
pub fn load_splits(config: &ZooConfig, device: &Device) -> Result<(TensorDataset, TensorDataset)> {
    let dataset = &config.dataset;
    let train = TensorDataset::load(
        dataset.split_path(&dataset.train_split),
        config.training.batch_size,
        device,
    )?;
    let val = TensorDataset::load(
        dataset.split_path(&dataset.val_split),
        config.training.val_batch_size,
        device,
    )?;
    Ok((train, val))
}
