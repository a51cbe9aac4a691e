//! # modelzoo-rs
//!
//! LoRA adaptation and multi-process training orchestration for a zoo of
//! vision models.
//!
//! A run takes a named module graph, wraps selected linear layers with
//! low-rank adapters, freezes everything except the adapters and task head,
//! splits the trainable parameters into learning-rate groups, and trains on
//! one or more worker processes with collective reduction of gradients and
//! metrics.
//!
//! ## Features
//!
//! - **YAML Configuration** - one file per run, `${ROOT_DIR}` substitution
//! - **Adapters** - rank-`r` LoRA on any linear layer selected by name
//! - **Parameter groups** - per-pattern learning rates, first match wins
//! - **Multi-process** - thread and TCP collectives with identical results on
//!   every rank
//! - **Pose metrics** - PCK under a heatmap and a coordinate estimator
//! - **Checkpoints** - atomic safetensors files with best/latest/final policy,
//!   strict resume and partial follow-up
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! modelzoo init --task pose config.yaml
//!
//! # Validate it
//! modelzoo validate config.yaml
//!
//! # Train, resuming later if interrupted
//! modelzoo train config.yaml --root-dir /srv/zoo
//! modelzoo train config.yaml --resume /srv/zoo/checkpoints/lora_weights/run-1/latest.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use modelzoo_rs::{DistributedContext, Trainer, ZooConfig};
//! use modelzoo_rs::dataset::load_splits;
//!
//! # fn main() -> modelzoo_rs::Result<()> {
//! let config = ZooConfig::from_file("config.yaml")?;
//! let ctx = modelzoo_rs::distributed::init()?;
//! let (train, val) = load_splits(&config, ctx.device())?;
//!
//! let mut trainer = Trainer::new(config, ctx)?;
//! trainer.restore_from_config()?;
//! trainer.fit(&train, &val)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use modelzoo_rs::ZooConfig;
//!
//! # fn main() -> modelzoo_rs::Result<()> {
//! let mut config = ZooConfig::from_preset("classification")?;
//! config.training.epochs = 5;
//! config.lr.lora = 5e-4;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod graph;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod partition;
pub mod scheduler;
pub mod sink;
pub mod trainer;

pub use config::{TaskKind, ZooConfig};
pub use distributed::DistributedContext;
pub use error::{Result, ZooError};
pub use graph::ModuleGraph;
pub use trainer::Trainer;
