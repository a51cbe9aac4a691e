//! Model zoo: per-task backbones built as module graphs, weight loading and
//! the adaptation pipeline.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::adapter::{apply_trainable_mask, inject_adapters, AdapterReport};
use crate::config::{TaskKind, ZooConfig};
use crate::error::{Result, ZooError};
use crate::graph::{Activation, LinearNode, ModuleGraph, NodeKind};

/// Flat output width of the head for the configured task.
#[must_use]
pub fn head_dim(config: &ZooConfig) -> usize {
    let model = &config.model;
    let pixels = model.output_size[0] * model.output_size[1];
    match config.task {
        TaskKind::Classification => model.num_classes,
        TaskKind::Bbox => 4,
        TaskKind::Segmentation => model.num_classes * pixels,
        TaskKind::Generation => model.input_dim,
        TaskKind::Pose => model.num_keypoints * pixels,
    }
}

/// Build the backbone and task head.
///
/// Layout: `patch_embed`, then `blocks.{i}` each holding a residual
/// `attn` (`qkv`, `act`, `proj`) and a residual `mlp` (`fc1`, `act`, `fc2`),
/// then `head`.
///
/// # Errors
///
/// Returns an error if tensor creation fails.
pub fn build_model(config: &ZooConfig, rng: &mut StdRng, device: &Device) -> Result<ModuleGraph> {
    let model = &config.model;
    let e = model.embed_dim;
    let hidden = e * model.mlp_ratio.max(1);

    let mut graph = ModuleGraph::new(device.clone());
    let root = graph.root();
    let linear = |rng: &mut StdRng, i: usize, o: usize| -> Result<NodeKind> {
        Ok(NodeKind::Linear(LinearNode::init(i, o, true, rng, device)?))
    };

    let patch_embed = linear(rng, model.input_dim, e)?;
    graph.add_child(root, "patch_embed", patch_embed)?;
    let blocks = graph.add_container(root, "blocks", false)?;
    for i in 0..model.depth {
        let block = graph.add_container(blocks, &i.to_string(), false)?;

        let attn = graph.add_container(block, "attn", true)?;
        graph.add_child(attn, "qkv", linear(rng, e, 3 * e)?)?;
        graph.add_child(attn, "act", NodeKind::Activation(Activation::Gelu))?;
        graph.add_child(attn, "proj", linear(rng, 3 * e, e)?)?;

        let mlp = graph.add_container(block, "mlp", true)?;
        graph.add_child(mlp, "fc1", linear(rng, e, hidden)?)?;
        graph.add_child(mlp, "act", NodeKind::Activation(Activation::Gelu))?;
        graph.add_child(mlp, "fc2", linear(rng, hidden, e)?)?;
    }
    graph.add_child(root, "head", linear(rng, e, head_dim(config))?)?;

    tracing::debug!(
        task = %config.task,
        depth = model.depth,
        embed_dim = e,
        head = head_dim(config),
        "Built model"
    );
    Ok(graph)
}

/// Outcome of [`load_named_tensors`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Parameters overwritten.
    pub loaded: Vec<String>,
    /// Stored tensors with no matching parameter or a different shape.
    pub skipped: Vec<String>,
    /// Parameters with no stored tensor.
    pub missing: Vec<String>,
}

/// Copy tensors into the graph's parameters by name.
///
/// With `strict`, every stored tensor must match a parameter of the same
/// shape; otherwise mismatches are skipped and logged.
///
/// # Errors
///
/// Returns [`ZooError::Checkpoint`] on a strict mismatch, or a tensor error.
pub fn load_named_tensors(
    graph: &ModuleGraph,
    tensors: &HashMap<String, Tensor>,
    strict: bool,
) -> Result<LoadReport> {
    let params = graph.param_map();
    let mut report = LoadReport::default();

    let mut names: Vec<_> = tensors.keys().collect();
    names.sort();
    for name in names {
        let tensor = &tensors[name];
        match params.get(name) {
            Some(var) if var.as_tensor().dims() == tensor.dims() => {
                let value = tensor.to_dtype(DType::F32)?.to_device(var.device())?;
                var.set(&value)?;
                report.loaded.push(name.clone());
            }
            Some(var) => {
                let msg = format!(
                    "'{name}' has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                );
                if strict {
                    return Err(ZooError::Checkpoint(msg));
                }
                tracing::warn!("Skipping tensor: {msg}");
                report.skipped.push(name.clone());
            }
            None => {
                if strict {
                    return Err(ZooError::Checkpoint(format!(
                        "unexpected tensor '{name}' for this architecture"
                    )));
                }
                tracing::warn!(tensor = %name, "Skipping tensor with no matching parameter");
                report.skipped.push(name.clone());
            }
        }
    }

    report.missing = graph
        .named_parameters()
        .into_iter()
        .map(|p| p.name)
        .filter(|name| !tensors.contains_key(name))
        .collect();
    Ok(report)
}

/// Load pretrained weights into a freshly built (unadapted) graph. Every
/// stored tensor must match; parameters absent from the file (typically a
/// new task head) keep their initialization.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match.
pub fn load_pretrained<P: AsRef<Path>>(graph: &ModuleGraph, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ZooError::Model(format!(
            "pretrained weights not found: {}",
            path.display()
        )));
    }
    let tensors = candle_core::safetensors::load(path, graph.device())?;
    let report = load_named_tensors(graph, &tensors, true)?;
    tracing::info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        "Loaded pretrained weights"
    );
    Ok(report)
}

/// Write every parameter of the graph to a safetensors file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_weights<P: AsRef<Path>>(graph: &ModuleGraph, path: P) -> Result<()> {
    let tensors: HashMap<String, Tensor> = graph
        .named_parameters()
        .into_iter()
        .map(|p| (p.name, p.var.as_tensor().detach()))
        .collect();
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}

/// A model ready for training.
#[derive(Debug)]
pub struct PreparedModel {
    /// Adapted graph.
    pub graph: ModuleGraph,
    /// Wrapped layers.
    pub adapters: AdapterReport,
    /// Number of trainable parameters (tensors).
    pub trainable: usize,
}

impl PreparedModel {
    /// Trainable scalar count.
    #[must_use]
    pub fn trainable_param_count(&self) -> usize {
        self.graph
            .trainable_parameters()
            .iter()
            .map(|p| p.var.as_tensor().elem_count())
            .sum()
    }
}

/// Build, load pretrained weights, inject adapters and apply the trainable
/// mask.
///
/// # Errors
///
/// Returns an error if any stage fails.
pub fn prepare_model(config: &ZooConfig, device: &Device) -> Result<PreparedModel> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut graph = build_model(config, &mut rng, device)?;
    if let Some(path) = &config.model.pretrained {
        load_pretrained(&graph, path)?;
    }
    let adapters = if config.lora.enabled {
        inject_adapters(&mut graph, &config.lora, &mut rng)?
    } else {
        AdapterReport::default()
    };
    let trainable = apply_trainable_mask(&mut graph, &config.unfreeze_keywords());
    let prepared = PreparedModel {
        graph,
        adapters,
        trainable,
    };
    tracing::info!(
        adapters = prepared.adapters.count(),
        trainable_params = prepared.trainable_param_count(),
        "Model prepared"
    );
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config(task: TaskKind) -> ZooConfig {
        let mut config = ZooConfig::preset(task);
        config.model.input_dim = 12;
        config.model.embed_dim = 8;
        config.model.depth = 2;
        config.model.num_keypoints = 2;
        config.model.output_size = [4, 4];
        config
    }

    #[test]
    fn test_head_dims_per_task() {
        assert_eq!(head_dim(&small_config(TaskKind::Classification)), 10);
        assert_eq!(head_dim(&small_config(TaskKind::Bbox)), 4);
        assert_eq!(head_dim(&small_config(TaskKind::Segmentation)), 160);
        assert_eq!(head_dim(&small_config(TaskKind::Generation)), 12);
        assert_eq!(head_dim(&small_config(TaskKind::Pose)), 32);
    }

    #[test]
    fn test_forward_shape_for_every_task() {
        for task in TaskKind::ALL {
            let config = small_config(task);
            let mut rng = StdRng::seed_from_u64(0);
            let graph = build_model(&config, &mut rng, &Device::Cpu).unwrap();
            let x = Tensor::zeros((3, 12), DType::F32, &Device::Cpu).unwrap();
            let y = graph.forward(&x, false).unwrap();
            assert_eq!(y.dims(), &[3, head_dim(&config)], "task {task}");
        }
    }

    #[test]
    fn test_parameter_names() {
        let config = small_config(TaskKind::Pose);
        let mut rng = StdRng::seed_from_u64(0);
        let graph = build_model(&config, &mut rng, &Device::Cpu).unwrap();
        let names: Vec<_> = graph.named_parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(names[0], "patch_embed.weight");
        assert!(names.contains(&"blocks.1.attn.qkv.weight".to_string()));
        assert!(names.contains(&"blocks.0.mlp.fc2.bias".to_string()));
        assert_eq!(names.last().unwrap(), "head.bias");
    }

    #[test]
    fn test_prepare_model_trains_adapters_and_head() {
        let config = small_config(TaskKind::Classification);
        let prepared = prepare_model(&config, &Device::Cpu).unwrap();
        assert_eq!(
            prepared.adapters.replaced,
            vec!["blocks.0.attn.qkv", "blocks.1.attn.qkv"]
        );
        let trainable: Vec<_> = prepared
            .graph
            .trainable_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            trainable,
            vec![
                "blocks.0.attn.qkv.lora_a",
                "blocks.0.attn.qkv.lora_b",
                "blocks.1.attn.qkv.lora_a",
                "blocks.1.attn.qkv.lora_b",
                "head.weight",
                "head.bias"
            ]
        );
        assert_eq!(prepared.trainable, 6);
    }

    #[test]
    fn test_pretrained_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backbone.safetensors");
        let config = small_config(TaskKind::Generation);
        let mut rng = StdRng::seed_from_u64(1);
        let source = build_model(&config, &mut rng, &Device::Cpu).unwrap();
        save_weights(&source, &path).unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let target = build_model(&config, &mut rng, &Device::Cpu).unwrap();
        let report = load_pretrained(&target, &path).unwrap();
        assert!(report.missing.is_empty());

        let x = Tensor::ones((1, 12), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(
            source.forward(&x, false).unwrap().to_vec2::<f32>().unwrap(),
            target.forward(&x, false).unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_strict_load_rejects_shape_mismatch() {
        let config = small_config(TaskKind::Bbox);
        let mut rng = StdRng::seed_from_u64(3);
        let graph = build_model(&config, &mut rng, &Device::Cpu).unwrap();
        let tensors = HashMap::from([(
            "head.weight".to_string(),
            Tensor::zeros((5, 8), DType::F32, &Device::Cpu).unwrap(),
        )]);
        assert!(load_named_tensors(&graph, &tensors, true).is_err());
        let report = load_named_tensors(&graph, &tensors, false).unwrap();
        assert_eq!(report.skipped, vec!["head.weight"]);
    }

    #[test]
    fn test_missing_pretrained_file() {
        let config = small_config(TaskKind::Bbox);
        let mut rng = StdRng::seed_from_u64(3);
        let graph = build_model(&config, &mut rng, &Device::Cpu).unwrap();
        assert!(load_pretrained(&graph, "/nonexistent/weights.safetensors").is_err());
    }
}
