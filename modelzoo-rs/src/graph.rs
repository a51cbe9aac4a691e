//! Module graph: an arena tree of named nodes with parameters.
//!
//! Nodes are addressed by [`NodeId`] and named by dotted paths built from
//! their local names (`blocks.0.attn.qkv`). Parameter enumeration walks the
//! tree depth-first in child order, so names and order are deterministic.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Dropout;
use rand::Rng;

use crate::error::{Result, ZooError};

/// Stable handle of a node in a [`ModuleGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A parameter: a candle variable plus a trainable flag.
#[derive(Debug, Clone)]
pub struct Param {
    /// Backing variable. Clones share storage.
    pub var: Var,
    /// Whether gradients flow into this parameter.
    pub trainable: bool,
}

impl Param {
    /// Wrap a tensor as a trainable parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot back a variable.
    pub fn new(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            var: Var::from_tensor(tensor)?,
            trainable: true,
        })
    }

    /// Tensor used in forward passes. Frozen parameters are detached so
    /// backward never reaches them.
    #[must_use]
    pub fn tensor(&self) -> Tensor {
        if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }
}

/// Elementwise activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(x, 0)`.
    Relu,
    /// Gaussian error linear unit.
    Gelu,
    /// Hyperbolic tangent.
    Tanh,
    /// Pass-through.
    Identity,
}

impl Activation {
    fn apply(self, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            Activation::Relu => x.relu()?,
            Activation::Gelu => x.gelu()?,
            Activation::Tanh => x.tanh()?,
            Activation::Identity => x.clone(),
        };
        Ok(out)
    }
}

/// Fully connected layer: weight `(out, in)`, optional bias `(out,)`.
#[derive(Debug, Clone)]
pub struct LinearNode {
    /// Weight matrix.
    pub weight: Param,
    /// Bias vector.
    pub bias: Option<Param>,
}

impl LinearNode {
    /// Build from explicit tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight is not 2-D or the bias length differs
    /// from the weight's output dimension.
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        let (out_features, _) = weight.dims2()?;
        if let Some(bias) = bias {
            if bias.dims() != [out_features] {
                return Err(ZooError::Model(format!(
                    "bias shape {:?} does not match {out_features} output features",
                    bias.dims()
                )));
            }
        }
        Ok(Self {
            weight: Param::new(weight)?,
            bias: bias.map(Param::new).transpose()?,
        })
    }

    /// Kaiming-uniform initialized layer (`bound = 1/sqrt(in)`).
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn init<R: Rng>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = uniform_tensor(rng, (out_features, in_features), bound, device)?;
        let bias = if bias {
            Some(uniform_tensor(rng, out_features, bound, device)?)
        } else {
            None
        };
        Self::from_tensors(&weight, bias.as_ref())
    }

    /// Input features.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.var.as_tensor().dims()[1]
    }

    /// Output features.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.var.as_tensor().dims()[0]
    }

    /// `x · Wᵀ + b` over the last dimension of `x`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = x.broadcast_matmul(&self.weight.tensor().t()?)?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(&bias.tensor())?),
            None => Ok(out),
        }
    }
}

/// Low-rank adapter around a frozen linear layer.
#[derive(Debug, Clone)]
pub struct AdapterNode {
    /// Wrapped layer. Its parameters stay frozen.
    pub base: LinearNode,
    /// Down-projection `(in_features, r)`.
    pub lora_a: Param,
    /// Up-projection `(r, out_features)`.
    pub lora_b: Param,
    /// Residual scale `alpha / r`.
    pub scale: f64,
    /// Dropout on the adapter input while training.
    pub dropout: f32,
}

impl AdapterNode {
    /// Adapter rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.lora_a.var.as_tensor().dims()[1]
    }

    /// `base(x) + scale · (dropout(x) · A) · B`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let base = self.base.forward(x)?;
        let h = Dropout::new(self.dropout).forward(x, train)?;
        let residual = h
            .broadcast_matmul(&self.lora_a.tensor())?
            .broadcast_matmul(&self.lora_b.tensor())?
            .affine(self.scale, 0.0)?;
        Ok((base + residual)?)
    }
}

/// Payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Ordered named children applied in sequence. With `residual`, the
    /// container input is added to its output.
    Container {
        /// Child handles in forward order.
        children: Vec<NodeId>,
        /// Add the input back to the output.
        residual: bool,
    },
    /// Fully connected layer.
    Linear(LinearNode),
    /// Elementwise activation.
    Activation(Activation),
    /// LoRA-wrapped linear layer.
    Adapter(AdapterNode),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
}

/// Position of a node in the tree, as produced by [`ModuleGraph::walk`].
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node handle.
    pub id: NodeId,
    /// Parent container (`None` for the root).
    pub parent: Option<NodeId>,
    /// Local name within the parent.
    pub name: String,
    /// Dotted path from the root.
    pub path: String,
}

/// Named parameter as yielded by [`ModuleGraph::named_parameters`].
#[derive(Debug, Clone)]
pub struct NamedParam {
    /// Dotted parameter name.
    pub name: String,
    /// Backing variable (shares storage with the graph).
    pub var: Var,
    /// Trainable flag.
    pub trainable: bool,
}

/// Arena tree of named modules.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    nodes: Vec<Node>,
    root: NodeId,
    device: Device,
}

impl ModuleGraph {
    /// Empty graph with a root container.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                kind: NodeKind::Container {
                    children: Vec::new(),
                    residual: false,
                },
            }],
            root: NodeId(0),
            device,
        }
    }

    /// Root container.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Device holding the parameters.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Node payload.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown handle.
    pub fn kind(&self, id: NodeId) -> Result<&NodeKind> {
        self.nodes
            .get(id.0)
            .map(|node| &node.kind)
            .ok_or_else(|| ZooError::Model(format!("unknown node {}", id.0)))
    }

    /// Mutable node payload.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown handle.
    pub fn kind_mut(&mut self, id: NodeId) -> Result<&mut NodeKind> {
        self.nodes
            .get_mut(id.0)
            .map(|node| &mut node.kind)
            .ok_or_else(|| ZooError::Model(format!("unknown node {}", id.0)))
    }

    fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        match self.kind(id)? {
            NodeKind::Container { children, .. } => Ok(children),
            _ => Err(ZooError::Model(format!(
                "node '{}' is not a container",
                self.nodes[id.0].name
            ))),
        }
    }

    fn child_slot(&self, parent: NodeId, name: &str) -> Result<Option<usize>> {
        Ok(self
            .children(parent)?
            .iter()
            .position(|child| self.nodes[child.0].name == name))
    }

    /// Append a new child to a container.
    ///
    /// # Errors
    ///
    /// Returns an error if `parent` is not a container, the name contains a
    /// dot, or a sibling already uses the name.
    pub fn add_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        if name.is_empty() || name.contains('.') {
            return Err(ZooError::Model(format!("invalid module name '{name}'")));
        }
        if self.child_slot(parent, name)?.is_some() {
            return Err(ZooError::Model(format!("duplicate module name '{name}'")));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
        });
        if let NodeKind::Container { children, .. } = self.kind_mut(parent)? {
            children.push(id);
        }
        Ok(id)
    }

    /// Append a child container.
    ///
    /// # Errors
    ///
    /// See [`ModuleGraph::add_child`].
    pub fn add_container(&mut self, parent: NodeId, name: &str, residual: bool) -> Result<NodeId> {
        self.add_child(
            parent,
            name,
            NodeKind::Container {
                children: Vec::new(),
                residual,
            },
        )
    }

    /// Replace the child named `name` in the same slot, returning the new
    /// handle. The previous node becomes unreachable.
    ///
    /// # Errors
    ///
    /// Returns an error if `parent` has no child with that name.
    pub fn set_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        let slot = self.child_slot(parent, name)?.ok_or_else(|| {
            ZooError::Model(format!(
                "no child '{name}' under '{}'",
                self.nodes[parent.0].name
            ))
        })?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
        });
        if let NodeKind::Container { children, .. } = self.kind_mut(parent)? {
            children[slot] = id;
        }
        Ok(id)
    }

    /// Every reachable node, depth-first in child order, root first.
    #[must_use]
    pub fn walk(&self) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        self.walk_from(self.root, None, String::new(), &mut out);
        out
    }

    fn walk_from(&self, id: NodeId, parent: Option<NodeId>, path: String, out: &mut Vec<NodeInfo>) {
        let node = &self.nodes[id.0];
        out.push(NodeInfo {
            id,
            parent,
            name: node.name.clone(),
            path: path.clone(),
        });
        if let NodeKind::Container { children, .. } = &node.kind {
            for child in children {
                let child_path = join_path(&path, &self.nodes[child.0].name);
                self.walk_from(*child, Some(id), child_path, out);
            }
        }
    }

    /// Look up a node by dotted path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|info| info.path == path)
            .map(|info| info.id)
    }

    /// All parameters with dotted names, depth-first.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<NamedParam> {
        let mut out = Vec::new();
        for info in self.walk() {
            for (suffix, param) in params_of(&self.nodes[info.id.0].kind) {
                out.push(NamedParam {
                    name: join_path(&info.path, suffix),
                    var: param.var.clone(),
                    trainable: param.trainable,
                });
            }
        }
        out
    }

    /// Trainable parameters only, in enumeration order.
    #[must_use]
    pub fn trainable_parameters(&self) -> Vec<NamedParam> {
        self.named_parameters()
            .into_iter()
            .filter(|p| p.trainable)
            .collect()
    }

    /// Name to variable map over all parameters.
    #[must_use]
    pub fn param_map(&self) -> HashMap<String, Var> {
        self.named_parameters()
            .into_iter()
            .map(|p| (p.name, p.var))
            .collect()
    }

    /// Visit every parameter mutably with its dotted name.
    pub fn visit_params_mut<F: FnMut(&str, &mut Param)>(&mut self, mut f: F) {
        for info in self.walk() {
            let kind = &mut self.nodes[info.id.0].kind;
            for (suffix, param) in params_of_mut(kind) {
                f(&join_path(&info.path, suffix), param);
            }
        }
    }

    /// Set the trainable flag of one parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if no parameter has that name.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        let mut found = false;
        self.visit_params_mut(|param_name, param| {
            if param_name == name {
                param.trainable = trainable;
                found = true;
            }
        });
        if found {
            Ok(())
        } else {
            Err(ZooError::Model(format!("unknown parameter '{name}'")))
        }
    }

    /// Forward pass from the root.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_node(self.root, x, train)
    }

    fn forward_node(&self, id: NodeId, x: &Tensor, train: bool) -> Result<Tensor> {
        match &self.nodes[id.0].kind {
            NodeKind::Container { children, residual } => {
                let mut h = x.clone();
                for child in children {
                    h = self.forward_node(*child, &h, train)?;
                }
                if *residual {
                    h = (h + x)?;
                }
                Ok(h)
            }
            NodeKind::Linear(linear) => linear.forward(x),
            NodeKind::Activation(act) => act.apply(x),
            NodeKind::Adapter(adapter) => adapter.forward(x, train),
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn params_of(kind: &NodeKind) -> Vec<(&'static str, &Param)> {
    match kind {
        NodeKind::Linear(linear) => {
            let mut out = vec![("weight", &linear.weight)];
            if let Some(bias) = &linear.bias {
                out.push(("bias", bias));
            }
            out
        }
        NodeKind::Adapter(adapter) => {
            let mut out = vec![("base.weight", &adapter.base.weight)];
            if let Some(bias) = &adapter.base.bias {
                out.push(("base.bias", bias));
            }
            out.push(("lora_a", &adapter.lora_a));
            out.push(("lora_b", &adapter.lora_b));
            out
        }
        NodeKind::Container { .. } | NodeKind::Activation(_) => Vec::new(),
    }
}

fn params_of_mut(kind: &mut NodeKind) -> Vec<(&'static str, &mut Param)> {
    match kind {
        NodeKind::Linear(linear) => {
            let mut out = vec![("weight", &mut linear.weight)];
            if let Some(bias) = &mut linear.bias {
                out.push(("bias", bias));
            }
            out
        }
        NodeKind::Adapter(adapter) => {
            let mut out = vec![("base.weight", &mut adapter.base.weight)];
            if let Some(bias) = &mut adapter.base.bias {
                out.push(("base.bias", bias));
            }
            out.push(("lora_a", &mut adapter.lora_a));
            out.push(("lora_b", &mut adapter.lora_b));
            out
        }
        NodeKind::Container { .. } | NodeKind::Activation(_) => Vec::new(),
    }
}

/// Tensor with entries drawn uniformly from `[-bound, bound)`.
pub(crate) fn uniform_tensor<R: Rng, S: Into<candle_core::Shape>>(
    rng: &mut R,
    shape: S,
    bound: f64,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let bound = bound as f32;
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// All-zero `f32` tensor.
pub(crate) fn zeros<S: Into<candle_core::Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, DType::F32, device)?)
}
