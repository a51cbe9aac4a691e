//! CLI entry point for modelzoo-rs.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modelzoo_rs::adapter::merge_adapters;
use modelzoo_rs::checkpoint;
use modelzoo_rs::config::ConfigOverrides;
use modelzoo_rs::dataset::{load_splits, BatchSource, TensorDataset};
use modelzoo_rs::distributed::{self, select_device};
use modelzoo_rs::metrics::{argmax_location, refine_quarter};
use modelzoo_rs::model::{load_named_tensors, prepare_model, save_weights};
use modelzoo_rs::sink::PipeSink;
use modelzoo_rs::{Result, TaskKind, Trainer, ZooConfig, ZooError};

#[derive(Parser)]
#[command(name = "modelzoo")]
#[command(about = "LoRA fine-tuning and multi-process training for vision models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
        /// Directory substituted for ${ROOT_DIR}
        #[arg(long)]
        root_dir: Option<PathBuf>,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Dataset directory
        #[arg(long)]
        data_path: Option<String>,
        /// Total epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Training batch size
        #[arg(long)]
        batch_size: Option<usize>,
        /// Run identifier
        #[arg(long)]
        run_id: Option<String>,
        /// Resume this run from a checkpoint
        #[arg(long, conflicts_with = "follow_up")]
        resume: Option<String>,
        /// Start a new run from a prior run's checkpoint
        #[arg(long)]
        follow_up: Option<String>,
        /// Directory substituted for ${ROOT_DIR}
        #[arg(long)]
        root_dir: Option<PathBuf>,
        /// Print `pipe:` metric lines on stdout
        #[arg(long)]
        pipe: bool,
        /// Train on this many generated samples instead of the dataset
        #[arg(long)]
        synthetic: Option<usize>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Task preset (classification, bbox, segmentation, generation, pose)
        #[arg(long, default_value = "classification")]
        task: String,
    },
    /// Run a checkpoint over the validation split
    Infer {
        /// Path to configuration file
        config: String,
        /// Checkpoint file
        #[arg(long)]
        checkpoint: String,
        /// Directory substituted for ${ROOT_DIR}
        #[arg(long)]
        root_dir: Option<PathBuf>,
    },
    /// Merge adapter weights into the base layers
    Merge {
        /// Path to configuration file
        config: String,
        /// Checkpoint file
        #[arg(long)]
        checkpoint: String,
        /// Output safetensors file for the merged weights
        #[arg(long)]
        output: String,
        /// Directory substituted for ${ROOT_DIR}
        #[arg(long)]
        root_dir: Option<PathBuf>,
    },
}

fn load_config(path: &str, root_dir: Option<&Path>) -> Result<ZooConfig> {
    match root_dir {
        Some(root) => ZooConfig::from_file_with_root(path, root),
        None => ZooConfig::from_file(path),
    }
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results and pipe lines.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, root_dir } => {
            tracing::info!("Validating configuration: {}", config);
            let config = load_config(&config, root_dir.as_deref())?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Task: {}", config.task);
            println!("  Optimizer: {}", config.optimizer.kind.as_str());
            println!("  Adapter targets: {}", config.lora.target_modules.join(", "));
            println!("  Dataset: {}", config.dataset.path);
        }
        Commands::Train {
            config,
            data_path,
            epochs,
            batch_size,
            run_id,
            resume,
            follow_up,
            root_dir,
            pipe,
            synthetic,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = load_config(&config, root_dir.as_deref())?.with_overrides(ConfigOverrides {
                data_path,
                epochs,
                batch_size,
                run_id,
                resume,
                follow_up,
            });
            config.validate()?;

            let ctx = distributed::init()?;
            let (train, val) = match synthetic {
                Some(samples) => (
                    TensorDataset::synthetic(&config, samples, config.seed, ctx.device())?,
                    TensorDataset::synthetic(&config, samples, config.seed + 1, ctx.device())?,
                ),
                None => load_splits(&config, ctx.device())?,
            };
            let labels = train.labels().map(<[String]>::to_vec);

            let mut trainer = Trainer::new(config, ctx)?.with_labels(labels);
            if pipe {
                trainer = trainer.with_sink(Box::new(PipeSink::stdout()));
            }
            trainer.restore_from_config()?;
            let state = trainer.fit(&train, &val)?;
            if let Some(best) = state.best_loss.best() {
                tracing::info!(run_id = %state.run_id, best_val_loss = best, "Training complete");
            }
        }
        Commands::Init { output, task } => {
            tracing::info!("Generating config for task: {}", task);
            let config = ZooConfig::from_preset(&task)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Infer {
            config,
            checkpoint,
            root_dir,
        } => {
            let config = load_config(&config, root_dir.as_deref())?;
            let device = select_device(0);
            infer(&config, &checkpoint, &device)?;
        }
        Commands::Merge {
            config,
            checkpoint,
            output,
            root_dir,
        } => {
            tracing::info!("Merging adapters to: {}", output);
            let config = load_config(&config, root_dir.as_deref())?;
            let device = select_device(0);
            let mut prepared = prepare_model(&config, &device)?;
            let ckpt = checkpoint::load(&checkpoint, &device)?;
            load_named_tensors(&prepared.graph, &ckpt.model, true)?;
            let merged = merge_adapters(&mut prepared.graph)?;
            save_weights(&prepared.graph, &output)?;
            println!("✓ Merged {} adapters into: {output}", merged.len());
        }
    }

    Ok(())
}

/// Print one prediction per validation sample.
fn infer(config: &ZooConfig, checkpoint_path: &str, device: &Device) -> Result<()> {
    let prepared = prepare_model(config, device)?;
    let ckpt = checkpoint::load(checkpoint_path, device)?;
    if let Some(task) = ckpt.header.task {
        if task != config.task {
            tracing::warn!(
                checkpoint = %task,
                config = %config.task,
                "Checkpoint was trained for a different task"
            );
        }
    }
    load_named_tensors(&prepared.graph, &ckpt.model, true)?;

    let split = config.dataset.split_path(&config.dataset.val_split);
    let data = TensorDataset::load(split, 1, device)?;
    let labels = ckpt
        .header
        .labels
        .clone()
        .or_else(|| data.labels().map(<[String]>::to_vec));
    let [out_h, out_w] = config.model.output_size;
    let [img_h, img_w] = config.model.image_size;

    for index in 0..data.len() {
        let batch = data.get(index)?;
        let output = prepared
            .graph
            .forward(&batch.inputs, false)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let line = match config.task {
            TaskKind::Classification => {
                let (class, _) = output
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
                labels
                    .as_ref()
                    .and_then(|names| names.get(class).cloned())
                    .unwrap_or_else(|| class.to_string())
            }
            TaskKind::Bbox => format!("{output:?}"),
            TaskKind::Pose => output
                .chunks(out_h * out_w)
                .map(|map| {
                    let (peak, _) = argmax_location(map, out_w);
                    let [x, y] = refine_quarter(map, out_h, out_w, peak);
                    format!(
                        "({:.1}, {:.1})",
                        x * img_w as f64 / out_w as f64,
                        y * img_h as f64 / out_h as f64
                    )
                })
                .collect::<Vec<_>>()
                .join(" "),
            TaskKind::Segmentation => {
                format!("pixels per class {:?}", pixels_per_class(&output, out_h * out_w)?)
            }
            TaskKind::Generation => {
                let mean = output.iter().sum::<f32>() / output.len().max(1) as f32;
                format!("{} values, mean {mean:.4}", output.len())
            }
        };
        println!("{index}: {line}");
    }
    Ok(())
}

/// Count the pixels whose highest logit belongs to each class. `output` is
/// laid out class-major over `pixels` positions.
fn pixels_per_class(output: &[f32], pixels: usize) -> Result<Vec<usize>> {
    if pixels == 0 || output.len() < pixels || output.len() % pixels != 0 {
        return Err(ZooError::Model(format!(
            "segmentation output of {} values does not cover {pixels} pixels",
            output.len()
        )));
    }
    let classes = output.len() / pixels;
    let mut counts = vec![0usize; classes];
    for p in 0..pixels {
        let class = (0..classes)
            .max_by(|a, b| output[a * pixels + p].total_cmp(&output[b * pixels + p]))
            .unwrap_or(0);
        counts[class] += 1;
    }
    Ok(counts)
}
