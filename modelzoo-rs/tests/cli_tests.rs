//! Integration tests for the modelzoo CLI.

use assert_cmd::Command;
use candle_core::Device;
use modelzoo_rs::dataset::TensorDataset;
use modelzoo_rs::ZooConfig;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` as `config.yaml` under `dir`.
fn create_test_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// The modelzoo binary with `args`, pinned to a single CPU process.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("modelzoo").expect("Failed to find modelzoo binary");
    cmd.args(args)
        .env("WORLD_SIZE", "1")
        .env("RANK", "0")
        .env("MODELZOO_FORCE_CPU", "1");
    cmd
}

/// A small classification run whose paths hang off `${ROOT_DIR}`.
fn valid_config_yaml() -> &'static str {
    r#"
task: classification
run_id: cli-run

model:
  input_dim: 8
  embed_dim: 8
  depth: 1
  num_classes: 3

lora:
  r: 2
  alpha: 4
  target_modules:
    - attn.qkv

training:
  epochs: 2
  batch_size: 4

dataset:
  path: "${ROOT_DIR}/data"

checkpoint:
  dir: "${ROOT_DIR}/ckpt"
  save_every: 1
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), valid_config_yaml());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("classification"));
}

#[test]
fn test_validate_command_unknown_task() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(
        temp_dir.path(),
        "task: depth\ndataset:\n  path: ./data\n",
    );

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_train_command_help() {
    run_cli(&["train", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Start training"))
        .stdout(predicates::str::contains("--resume"))
        .stdout(predicates::str::contains("--follow-up"))
        .stdout(predicates::str::contains("--root-dir"));
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("pose.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--task", "pose"])
        .assert()
        .success();

    let content = fs::read_to_string(&output_path).expect("Failed to read generated config");
    assert!(content.contains("task: pose"));
    assert!(content.contains("attn.proj"));
    assert!(content.contains("${ROOT_DIR}"));
}

#[test]
fn test_init_command_unknown_task() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("x.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--task", "depth"])
        .assert()
        .failure();
    assert!(!output_path.exists());
}

#[test]
fn test_train_pipe_then_infer_and_merge() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let config_path = create_test_config(root, valid_config_yaml());
    let config = config_path.to_str().unwrap();
    let root_arg = root.to_str().unwrap();

    let output = run_cli(&[
        "train",
        config,
        "--root-dir",
        root_arg,
        "--synthetic",
        "8",
        "--pipe",
    ])
    .output()
    .expect("Failed to run train");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let pipe_lines: Vec<_> = stdout.lines().filter(|l| l.starts_with("pipe:")).collect();
    assert_eq!(pipe_lines.len(), 2);
    assert!(pipe_lines[0].contains("\"epoch\":0"));
    assert!(pipe_lines[1].contains("\"val_loss\""));

    let run_dir = root.join("ckpt").join("cli-run");
    for name in ["best_loss", "latest", "final"] {
        assert!(run_dir.join(format!("{name}.safetensors")).exists(), "{name} missing");
    }

    // Resuming a finished run has nothing left to do.
    let latest = run_dir.join("latest.safetensors");
    run_cli(&[
        "train",
        config,
        "--root-dir",
        root_arg,
        "--synthetic",
        "8",
        "--resume",
        latest.to_str().unwrap(),
    ])
    .assert()
    .success();

    let parsed = ZooConfig::from_file_with_root(&config_path, root).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    TensorDataset::synthetic(&parsed, 3, 7, &Device::Cpu)
        .unwrap()
        .save(root.join("data").join("val.safetensors"))
        .unwrap();
    let infer = run_cli(&[
        "infer",
        config,
        "--root-dir",
        root_arg,
        "--checkpoint",
        run_dir.join("best_loss.safetensors").to_str().unwrap(),
    ])
    .output()
    .expect("Failed to run infer");
    assert!(infer.status.success(), "{}", String::from_utf8_lossy(&infer.stderr));
    let predictions: Vec<_> = String::from_utf8_lossy(&infer.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(predictions.len(), 3);
    assert!(predictions[0].starts_with("0: "));
    // Class names come from the checkpoint header.
    assert!(predictions.iter().all(|l| l.contains(": class_")));

    let merged = root.join("merged.safetensors");
    run_cli(&[
        "merge",
        config,
        "--root-dir",
        root_arg,
        "--checkpoint",
        latest.to_str().unwrap(),
        "--output",
        merged.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicates::str::contains("Merged 1 adapters"));
    assert!(merged.exists());
}

#[test]
fn test_train_resume_missing_checkpoint_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), valid_config_yaml());

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--root-dir",
        temp_dir.path().to_str().unwrap(),
        "--synthetic",
        "8",
        "--resume",
        "/nonexistent/latest.safetensors",
    ])
    .assert()
    .failure()
    .stderr(predicates::str::contains("CheckpointNotFound"));
}

#[test]
fn test_cli_version() {
    run_cli(&["--version"])
        .assert()
        .success()
        .stdout(predicates::str::contains("modelzoo"));
}

#[test]
fn test_cli_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("LoRA fine-tuning"))
        .stdout(predicates::str::contains("validate"))
        .stdout(predicates::str::contains("train"))
        .stdout(predicates::str::contains("infer"))
        .stdout(predicates::str::contains("merge"))
        .stdout(predicates::str::contains("init"));
}
