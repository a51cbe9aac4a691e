//! Split trainable parameters into named learning-rate groups.

use candle_core::Var;

use crate::config::LrRule;
use crate::graph::NamedParam;

/// Name of the group collecting parameters no rule matched.
pub const DEFAULT_GROUP: &str = "default";

/// A named set of parameters sharing one learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name.
    pub name: String,
    /// `(name, variable)` pairs in graph order.
    pub params: Vec<(String, Var)>,
    /// Current learning rate.
    pub lr: f64,
    /// Learning rate at construction; schedulers decay from it.
    pub initial_lr: f64,
}

impl ParamGroup {
    fn new(name: &str, lr: f64) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            lr,
            initial_lr: lr,
        }
    }

    /// Number of scalar elements in the group.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.params.iter().map(|(_, v)| v.as_tensor().elem_count()).sum()
    }
}

/// Partition trainable parameters by ordered rules; first match wins and
/// unmatched parameters go to the default group.
///
/// Groups come out in rule order followed by the default group. Empty groups
/// are kept so the group list always has `rules.len() + 1` entries.
#[must_use]
pub fn partition(params: &[NamedParam], rules: &[LrRule], default_lr: f64) -> Vec<ParamGroup> {
    let mut groups: Vec<ParamGroup> = rules
        .iter()
        .map(|rule| ParamGroup::new(&rule.name, rule.lr))
        .collect();
    groups.push(ParamGroup::new(DEFAULT_GROUP, default_lr));
    let default_idx = groups.len() - 1;

    for param in params.iter().filter(|p| p.trainable) {
        let idx = rules
            .iter()
            .position(|rule| param.name.contains(rule.pattern.as_str()))
            .unwrap_or(default_idx);
        groups[idx].params.push((param.name.clone(), param.var.clone()));
    }

    for group in &groups {
        tracing::debug!(
            group = %group.name,
            params = group.params.len(),
            lr = group.lr,
            "Parameter group"
        );
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn param(name: &str, trainable: bool) -> NamedParam {
        let t = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        NamedParam {
            name: name.to_string(),
            var: Var::from_tensor(&t).unwrap(),
            trainable,
        }
    }

    fn rules() -> Vec<LrRule> {
        vec![
            LrRule {
                name: "lora".into(),
                pattern: "lora_".into(),
                lr: 1e-3,
            },
            LrRule {
                name: "head".into(),
                pattern: "head".into(),
                lr: 5e-4,
            },
        ]
    }

    fn names(group: &ParamGroup) -> Vec<&str> {
        group.params.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_first_match_wins_and_frozen_excluded() {
        let params = vec![
            param("blocks.0.attn.qkv.base.weight", false),
            param("blocks.0.attn.qkv.lora_a", true),
            param("blocks.0.attn.qkv.lora_b", true),
            param("head.lora_a", true),
            param("head.weight", true),
            param("norm.weight", true),
        ];
        let groups = partition(&params, &rules(), 1e-4);
        assert_eq!(groups.len(), 3);
        assert_eq!(
            names(&groups[0]),
            vec!["blocks.0.attn.qkv.lora_a", "blocks.0.attn.qkv.lora_b", "head.lora_a"]
        );
        assert_eq!(names(&groups[1]), vec!["head.weight"]);
        assert_eq!(names(&groups[2]), vec!["norm.weight"]);
        assert_eq!(groups[2].name, DEFAULT_GROUP);
        assert_eq!(groups[2].lr, 1e-4);
    }

    #[test]
    fn test_empty_groups_are_kept() {
        let params = vec![param("head.weight", true)];
        let groups = partition(&params, &rules(), 1e-4);
        assert_eq!(groups.len(), 3);
        assert!(groups[0].params.is_empty());
        assert!(groups[2].params.is_empty());
    }

    #[test]
    fn test_partition_is_deterministic() {
        let params = vec![
            param("a.lora_a", true),
            param("b.weight", true),
            param("c.lora_b", true),
            param("head.bias", true),
        ];
        let first = partition(&params, &rules(), 1e-4);
        let second = partition(&params, &rules(), 1e-4);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(names(a), names(b));
            assert_eq!(a.initial_lr, b.initial_lr);
        }
    }

    #[test]
    fn test_numel() {
        let params = vec![param("x.lora_a", true), param("y.lora_b", true)];
        let groups = partition(&params, &rules(), 1e-4);
        assert_eq!(groups[0].numel(), 8);
    }
}
