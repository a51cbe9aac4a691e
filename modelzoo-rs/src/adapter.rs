//! LoRA injection and trainable masks over a [`ModuleGraph`].

use rand::Rng;

use crate::config::LoraSettings;
use crate::error::{Result, ZooError};
use crate::graph::{uniform_tensor, zeros, AdapterNode, LinearNode, ModuleGraph, NodeKind, Param};

/// Outcome of [`inject_adapters`].
#[derive(Debug, Clone, Default)]
pub struct AdapterReport {
    /// Dotted paths of the wrapped layers, in graph order.
    pub replaced: Vec<String>,
}

impl AdapterReport {
    /// Number of wrapped layers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.replaced.len()
    }
}

/// Wrap every linear layer whose path contains one of the target patterns.
///
/// The up-projection starts at zero, so the wrapped layer reproduces the
/// base output exactly until the first update.
///
/// # Errors
///
/// Returns [`ZooError::Config`] when nothing matched and
/// `settings.require_match` is set, or when the rank is zero.
pub fn inject_adapters<R: Rng>(
    graph: &mut ModuleGraph,
    settings: &LoraSettings,
    rng: &mut R,
) -> Result<AdapterReport> {
    if settings.r == 0 {
        return Err(ZooError::Config("lora.r must be > 0".into()));
    }

    let targets: Vec<_> = graph
        .walk()
        .into_iter()
        .filter(|info| {
            matches!(graph.kind(info.id), Ok(NodeKind::Linear(_)))
                && settings
                    .target_modules
                    .iter()
                    .any(|pattern| info.path.contains(pattern.as_str()))
        })
        .collect();

    let mut report = AdapterReport::default();
    for info in targets {
        let Some(parent) = info.parent else {
            continue;
        };
        let NodeKind::Linear(base) = graph.kind(info.id)?.clone() else {
            continue;
        };
        let adapter = wrap_linear(base, settings, rng, graph.device())?;
        graph.set_child(parent, &info.name, NodeKind::Adapter(adapter))?;
        tracing::debug!(path = %info.path, rank = settings.r, "Wrapped linear layer");
        report.replaced.push(info.path);
    }

    if report.replaced.is_empty() {
        if settings.require_match {
            return Err(ZooError::Config(format!(
                "no linear layer matched target modules {:?}",
                settings.target_modules
            )));
        }
        tracing::warn!(
            targets = ?settings.target_modules,
            "No linear layer matched the adapter target modules"
        );
    } else {
        tracing::info!(count = report.count(), "Injected LoRA adapters");
    }
    Ok(report)
}

fn wrap_linear<R: Rng>(
    mut base: LinearNode,
    settings: &LoraSettings,
    rng: &mut R,
    device: &candle_core::Device,
) -> Result<AdapterNode> {
    let in_features = base.in_features();
    let out_features = base.out_features();
    let bound = 1.0 / (in_features as f64).sqrt();

    base.weight.trainable = false;
    if let Some(bias) = &mut base.bias {
        bias.trainable = false;
    }

    Ok(AdapterNode {
        base,
        lora_a: Param::new(&uniform_tensor(rng, (in_features, settings.r), bound, device)?)?,
        lora_b: Param::new(&zeros((settings.r, out_features), device)?)?,
        scale: settings.scale(),
        dropout: settings.dropout,
    })
}

/// Mark a parameter trainable iff its name contains one of `keywords`, then
/// force every adapter base frozen. Returns the number of trainable
/// parameters.
pub fn apply_trainable_mask(graph: &mut ModuleGraph, keywords: &[String]) -> usize {
    graph.visit_params_mut(|name, param| {
        param.trainable = keywords.iter().any(|k| name.contains(k.as_str()));
    });
    let adapters: Vec<_> = graph
        .walk()
        .into_iter()
        .filter(|info| matches!(graph.kind(info.id), Ok(NodeKind::Adapter(_))))
        .map(|info| info.id)
        .collect();
    for id in adapters {
        if let Ok(NodeKind::Adapter(adapter)) = graph.kind_mut(id) {
            adapter.base.weight.trainable = false;
            if let Some(bias) = &mut adapter.base.bias {
                bias.trainable = false;
            }
        }
    }
    let trainable = graph.trainable_parameters().len();
    tracing::info!(trainable, "Applied trainable mask");
    trainable
}

/// Fold every adapter into its base weight (`W + scale · (A·B)ᵀ`) and turn it
/// back into a plain linear layer. Returns the merged paths.
///
/// # Errors
///
/// Returns an error if a tensor operation fails.
pub fn merge_adapters(graph: &mut ModuleGraph) -> Result<Vec<String>> {
    let adapters: Vec<_> = graph
        .walk()
        .into_iter()
        .filter(|info| matches!(graph.kind(info.id), Ok(NodeKind::Adapter(_))))
        .collect();

    let mut merged = Vec::with_capacity(adapters.len());
    for info in adapters {
        let Some(parent) = info.parent else {
            continue;
        };
        let NodeKind::Adapter(adapter) = graph.kind(info.id)?.clone() else {
            continue;
        };
        let delta = adapter
            .lora_a
            .var
            .as_tensor()
            .matmul(adapter.lora_b.var.as_tensor())?
            .t()?
            .affine(adapter.scale, 0.0)?;
        let weight = (adapter.base.weight.var.as_tensor() + delta)?;
        let bias = adapter.base.bias.as_ref().map(|b| b.var.as_tensor().clone());
        let linear = LinearNode::from_tensors(&weight, bias.as_ref())?;
        graph.set_child(parent, &info.name, NodeKind::Linear(linear))?;
        merged.push(info.path);
    }
    tracing::info!(count = merged.len(), "Merged LoRA adapters");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Activation;
    use candle_core::{DType, Device, Tensor};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vit_like(rng: &mut StdRng) -> ModuleGraph {
        let device = Device::Cpu;
        let mut graph = ModuleGraph::new(device.clone());
        let root = graph.root();
        let attn = graph.add_container(root, "attn", false).unwrap();
        let qkv = LinearNode::init(6, 6, true, rng, &device).unwrap();
        graph.add_child(attn, "qkv", NodeKind::Linear(qkv)).unwrap();
        graph
            .add_child(attn, "act", NodeKind::Activation(Activation::Gelu))
            .unwrap();
        let proj = LinearNode::init(6, 6, true, rng, &device).unwrap();
        graph.add_child(attn, "proj", NodeKind::Linear(proj)).unwrap();
        let head = LinearNode::init(6, 3, true, rng, &device).unwrap();
        graph.add_child(root, "head", NodeKind::Linear(head)).unwrap();
        graph
    }

    fn settings(targets: &[&str]) -> LoraSettings {
        LoraSettings {
            r: 2,
            alpha: 4,
            dropout: 0.0,
            target_modules: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wrapped_output_equals_base_at_init() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut graph = vit_like(&mut rng);
        let x = Tensor::randn(0f32, 1.0, (5, 6), &Device::Cpu).unwrap();
        let before = graph.forward(&x, false).unwrap();

        let report = inject_adapters(&mut graph, &settings(&["qkv", "proj"]), &mut rng).unwrap();
        assert_eq!(report.replaced, vec!["attn.qkv", "attn.proj"]);

        let after = graph.forward(&x, false).unwrap();
        assert_eq!(
            before.to_vec2::<f32>().unwrap(),
            after.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_adapter_parameter_names_and_shapes() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut graph = vit_like(&mut rng);
        inject_adapters(&mut graph, &settings(&["attn.qkv"]), &mut rng).unwrap();
        let params = graph.param_map();
        assert_eq!(params["attn.qkv.lora_a"].as_tensor().dims(), &[6, 2]);
        assert_eq!(params["attn.qkv.lora_b"].as_tensor().dims(), &[2, 6]);
        assert!(params.contains_key("attn.qkv.base.weight"));
        assert!(params.contains_key("attn.qkv.base.bias"));
        assert!(!params.contains_key("attn.qkv.weight"));

        let b_sum = params["attn.qkv.lora_b"]
            .as_tensor()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(b_sum, 0.0);
    }

    #[test]
    fn test_zero_matches_warns_by_default() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut graph = vit_like(&mut rng);
        let report = inject_adapters(&mut graph, &settings(&["mlp.fc1"]), &mut rng).unwrap();
        assert_eq!(report.count(), 0);
    }

    #[test]
    fn test_zero_matches_errors_when_required() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut graph = vit_like(&mut rng);
        let mut lora = settings(&["mlp.fc1"]);
        lora.require_match = true;
        let err = inject_adapters(&mut graph, &lora, &mut rng).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_trainable_mask_matches_keywords() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut graph = vit_like(&mut rng);
        inject_adapters(&mut graph, &settings(&["qkv"]), &mut rng).unwrap();
        let keywords = vec!["lora_a".to_string(), "lora_b".to_string(), "head".to_string()];
        let count = apply_trainable_mask(&mut graph, &keywords);

        let trainable: Vec<_> = graph
            .trainable_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            trainable,
            vec![
                "attn.qkv.lora_a",
                "attn.qkv.lora_b",
                "head.weight",
                "head.bias"
            ]
        );
        assert_eq!(count, 4);
    }

    #[test]
    fn test_mask_never_unfreezes_adapter_base() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut graph = vit_like(&mut rng);
        inject_adapters(&mut graph, &settings(&["qkv"]), &mut rng).unwrap();
        apply_trainable_mask(&mut graph, &["qkv".to_string()]);
        let trainable: Vec<_> = graph
            .trainable_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(trainable, vec!["attn.qkv.lora_a", "attn.qkv.lora_b"]);
    }

    #[test]
    fn test_plain_module_named_base_follows_keywords() {
        let mut rng = StdRng::seed_from_u64(8);
        let device = Device::Cpu;
        let mut graph = ModuleGraph::new(device.clone());
        let root = graph.root();
        let backbone = graph.add_container(root, "backbone", false).unwrap();
        let base = graph.add_container(backbone, "base", false).unwrap();
        let fc = LinearNode::init(6, 6, true, &mut rng, &device).unwrap();
        graph.add_child(base, "fc", NodeKind::Linear(fc)).unwrap();
        let qkv = LinearNode::init(6, 6, false, &mut rng, &device).unwrap();
        graph.add_child(root, "qkv", NodeKind::Linear(qkv)).unwrap();
        inject_adapters(&mut graph, &settings(&["qkv"]), &mut rng).unwrap();

        let keywords = vec!["backbone.base.fc".to_string(), "qkv".to_string()];
        let trainable = apply_trainable_mask(&mut graph, &keywords);
        let mut names: Vec<String> = graph
            .trainable_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "backbone.base.fc.bias",
                "backbone.base.fc.weight",
                "qkv.lora_a",
                "qkv.lora_b"
            ]
        );
        assert_eq!(trainable, 4);
    }

    #[test]
    fn test_merge_preserves_output() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut graph = vit_like(&mut rng);
        inject_adapters(&mut graph, &settings(&["qkv"]), &mut rng).unwrap();
        let params = graph.param_map();
        let b = Tensor::ones((2, 6), DType::F32, &Device::Cpu).unwrap();
        params["attn.qkv.lora_b"].set(&b).unwrap();

        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let adapted = graph.forward(&x, false).unwrap();
        let merged = merge_adapters(&mut graph).unwrap();
        assert_eq!(merged, vec!["attn.qkv"]);
        let plain = graph.forward(&x, false).unwrap();

        let diff = (adapted - plain)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
        assert!(graph.param_map().contains_key("attn.qkv.weight"));
    }
}
