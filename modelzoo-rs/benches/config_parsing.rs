use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use modelzoo_rs::config::{TaskKind, ZooConfig};
use modelzoo_rs::dataset::{render_heatmap, KeypointTargets};
use modelzoo_rs::metrics::{pck_at_threshold, pose_distances};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const POSE_YAML: &str = r#"
task: pose
run_id: bench

model:
  input_dim: 768
  embed_dim: 192
  depth: 12
  num_keypoints: 17
  output_size: [64, 48]
  image_size: [256, 192]
  pretrained: "${ROOT_DIR}/weights/vit_small.safetensors"

lora:
  r: 8
  alpha: 16
  dropout: 0.1
  target_modules:
    - attn.qkv
    - attn.proj

lr:
  base: 1.0e-4
  lora: 1.0e-3
  rules:
    - name: lora
      pattern: lora_
      lr: 1.0e-3
    - name: head
      pattern: head
      lr: 5.0e-4

optimizer:
  kind: adamw
  weight_decay: 0.01

scheduler:
  kind: plateau
  patience: 3
  factor: 0.5

training:
  epochs: 50
  batch_size: 8
  pck_thresholds: [0.05, 0.1, 0.2]
  best_pck_threshold: 0.1

dataset:
  path: "${ROOT_DIR}/data/coco"

checkpoint:
  dir: "${ROOT_DIR}/checkpoints/lora_weights"
  save_every: 5
"#;

fn generate_large_yaml(num_rules: usize) -> String {
    let mut yaml = String::from(POSE_YAML);
    yaml.push_str("\n# Extra learning-rate rules:\n");
    for i in 0..num_rules {
        yaml.push_str(&format!("# - {{ name: block_{i}, pattern: blocks.{i}., lr: 1.0e-4 }}\n"));
    }
    yaml
}

fn bench_config_from_yaml(c: &mut Criterion) {
    let root = Path::new("/srv/zoo");
    c.bench_function("config_from_yaml_pose", |b| {
        b.iter(|| {
            let config = black_box(ZooConfig::from_yaml_with_root(POSE_YAML, root).unwrap());
            black_box(config);
        });
    });
}

fn bench_config_from_yaml_large(c: &mut Criterion) {
    let root = Path::new("/srv/zoo");
    let mut group = c.benchmark_group("config_from_yaml_large");

    for size in [100, 500, 1000].iter() {
        let large_yaml = generate_large_yaml(*size);
        group.bench_with_input(format!("rules_{size}"), size, |b, _| {
            b.iter(|| {
                let config = black_box(ZooConfig::from_yaml_with_root(&large_yaml, root).unwrap());
                black_box(config);
            });
        });
    }

    group.finish();
}

fn bench_config_validate(c: &mut Criterion) {
    c.bench_function("config_validate", |b| {
        let config = ZooConfig::preset(TaskKind::Pose);
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result).unwrap();
        });
    });
}

fn bench_config_validate_invalid(c: &mut Criterion) {
    c.bench_function("config_validate_invalid", |b| {
        let mut config = ZooConfig::preset(TaskKind::Pose);
        config.dataset.path = String::new();
        config.training.best_pck_threshold = 0.3;

        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result.is_err());
        });
    });
}

fn bench_presets(c: &mut Criterion) {
    let mut group = c.benchmark_group("preset");
    for task in TaskKind::ALL {
        group.bench_function(task.as_str(), |b| {
            b.iter(|| black_box(ZooConfig::from_preset(task.as_str()).unwrap()));
        });
    }
    group.finish();
}

fn bench_config_file_io(c: &mut Criterion) {
    c.bench_function("config_file_io", |b| {
        let config = ZooConfig::preset(TaskKind::Classification);

        b.iter(|| {
            let mut temp_file = NamedTempFile::new().unwrap();
            let yaml = serde_yaml::to_string(&config).unwrap();
            temp_file.write_all(yaml.as_bytes()).unwrap();
            temp_file.flush().unwrap();

            let loaded = black_box(ZooConfig::from_file(temp_file.path()).unwrap());
            black_box(loaded);
        });
    });
}

/// A batch of 17-joint heatmaps with the prediction shifted by one cell.
fn pose_batch(batch: usize) -> (Tensor, Tensor, KeypointTargets) {
    let (k, h, w) = (17, 64, 48);
    let mut target = Vec::with_capacity(batch * k * h * w);
    let mut pred = Vec::with_capacity(batch * k * h * w);
    let mut joints = Vec::with_capacity(batch * k * 2);
    for s in 0..batch {
        for j in 0..k {
            let cx = ((s * 7 + j * 3) % (w - 2)) as f32 + 1.0;
            let cy = ((s * 5 + j * 11) % (h - 2)) as f32 + 1.0;
            target.extend(render_heatmap(cx, cy, h, w, 2.0));
            pred.extend(render_heatmap(cx + 1.0, cy, h, w, 2.0));
            joints.extend([cx * 4.0, cy * 4.0]);
        }
    }
    let device = Device::Cpu;
    (
        Tensor::from_vec(pred, (batch, k * h * w), &device).unwrap(),
        Tensor::from_vec(target, (batch, k, h, w), &device).unwrap(),
        KeypointTargets {
            joints: Tensor::from_vec(joints, (batch, k, 2), &device).unwrap(),
            visibility: Tensor::ones((batch, k), DType::F32, &device).unwrap(),
            scale: Tensor::full(64f32, batch, &device).unwrap(),
        },
    )
}

fn bench_pck(c: &mut Criterion) {
    let mut group = c.benchmark_group("pck");
    for batch in [1, 8, 32] {
        let (pred, target, keypoints) = pose_batch(batch);
        group.bench_function(format!("batch_{batch}"), |b| {
            b.iter(|| {
                let d = pose_distances(&pred, &target, &keypoints, [256, 192]).unwrap();
                for thr in [0.05, 0.1, 0.2] {
                    black_box(pck_at_threshold(&d.coordinate, thr));
                    black_box(pck_at_threshold(&d.heatmap, thr));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_config_from_yaml,
    bench_config_from_yaml_large,
    bench_config_validate,
    bench_config_validate_invalid,
    bench_presets,
    bench_config_file_io,
    bench_pck,
);
criterion_main!(benches);
