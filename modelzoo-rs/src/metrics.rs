//! Keypoint accuracy (PCK) and the evaluation accumulator.
//!
//! Two estimators are computed per threshold. The heatmap estimator compares
//! argmax locations of predicted and target heatmaps in heatmap cells,
//! normalized per axis by the heatmap extent. The coordinate estimator
//! decodes predictions with quarter-pixel refinement, maps them to
//! input-image pixels and compares them with the raw joints, normalized by
//! the per-sample scale. Joints with non-positive visibility never count.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::dataset::KeypointTargets;
use crate::error::{Result, ZooError};

/// Map key of a PCK threshold (`0.1` → `"0.1"`).
#[must_use]
pub fn pck_key(threshold: f64) -> String {
    format!("{threshold}")
}

/// Location and value of the maximum of one `h × w` heatmap, as `(x, y)`.
/// Non-positive maxima decode to the origin.
#[must_use]
pub fn argmax_location(map: &[f32], width: usize) -> ([f64; 2], f32) {
    let (idx, max) = map
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    if max <= 0.0 {
        return ([0.0, 0.0], max);
    }
    ([(idx % width) as f64, (idx / width) as f64], max)
}

/// Shift an argmax location a quarter cell towards the higher neighbour on
/// each axis. Locations on the border are left as is.
#[must_use]
pub fn refine_quarter(map: &[f32], height: usize, width: usize, coord: [f64; 2]) -> [f64; 2] {
    let px = (coord[0] + 0.5).floor() as isize;
    let py = (coord[1] + 0.5).floor() as isize;
    let (w, h) = (width as isize, height as isize);
    if !(1 < px && px < w - 1 && 1 < py && py < h - 1) {
        return coord;
    }
    let at = |x: isize, y: isize| map[(y * w + x) as usize];
    let dx = at(px + 1, py) - at(px - 1, py);
    let dy = at(px, py + 1) - at(px, py - 1);
    let step = |d: f32| {
        if d > 0.0 {
            0.25
        } else if d < 0.0 {
            -0.25
        } else {
            0.0
        }
    };
    [coord[0] + step(dx), coord[1] + step(dy)]
}

/// Fraction of valid distances within `threshold` (`d <= threshold`).
/// Zero when nothing is valid.
#[must_use]
pub fn pck_at_threshold(distances: &[Option<f64>], threshold: f64) -> f64 {
    let (correct, total) = distances
        .iter()
        .flatten()
        .fold((0usize, 0usize), |(c, t), d| (c + usize::from(*d <= threshold), t + 1));
    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}

/// Normalized per-joint distances of one pose batch under both estimators.
#[derive(Debug, Clone, Default)]
pub struct PoseDistances {
    /// Heatmap estimator, one entry per `(sample, joint)`.
    pub heatmap: Vec<Option<f64>>,
    /// Coordinate estimator, one entry per `(sample, joint)`.
    pub coordinate: Vec<Option<f64>>,
}

/// Compute both estimators' distances for one batch.
///
/// `pred` is the flat model output `(B, K·H·W)`, `target` the heatmaps
/// `(B, K, H, W)`, and `image_size` the input size as `[height, width]`.
///
/// # Errors
///
/// Returns an error on shape mismatch.
pub fn pose_distances(
    pred: &Tensor,
    target: &Tensor,
    keypoints: &KeypointTargets,
    image_size: [usize; 2],
) -> Result<PoseDistances> {
    let (b, k, h, w) = target.dims4()?;
    if keypoints.joints.dims() != [b, k, 2]
        || keypoints.visibility.dims() != [b, k]
        || keypoints.scale.dims() != [b]
    {
        return Err(ZooError::Training(format!(
            "keypoint targets {:?}/{:?}/{:?} do not match {b} samples of {k} joints",
            keypoints.joints.dims(),
            keypoints.visibility.dims(),
            keypoints.scale.dims()
        )));
    }
    let pred = pred
        .reshape((b, k, h * w))?
        .to_dtype(DType::F32)?
        .to_vec3::<f32>()?;
    let target = target
        .reshape((b, k, h * w))?
        .to_dtype(DType::F32)?
        .to_vec3::<f32>()?;
    let joints = keypoints.joints.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let visibility = keypoints.visibility.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let scale = keypoints.scale.to_dtype(DType::F32)?.to_vec1::<f32>()?;

    let stride_x = image_size[1] as f64 / w as f64;
    let stride_y = image_size[0] as f64 / h as f64;
    let mut out = PoseDistances {
        heatmap: Vec::with_capacity(b * k),
        coordinate: Vec::with_capacity(b * k),
    };
    for s in 0..b {
        for j in 0..k {
            if visibility[s][j] <= 0.0 {
                out.heatmap.push(None);
                out.coordinate.push(None);
                continue;
            }
            let (p, _) = argmax_location(&pred[s][j], w);
            let (t, _) = argmax_location(&target[s][j], w);
            let dx = (p[0] - t[0]) / w as f64;
            let dy = (p[1] - t[1]) / h as f64;
            out.heatmap.push(Some(dx.hypot(dy)));

            let refined = refine_quarter(&pred[s][j], h, w, p);
            let x = refined[0] * stride_x;
            let y = refined[1] * stride_y;
            let gx = f64::from(joints[s][j][0]);
            let gy = f64::from(joints[s][j][1]);
            let norm = f64::from(scale[s]);
            out.coordinate.push(if norm > 0.0 {
                Some((x - gx).hypot(y - gy) / norm)
            } else {
                None
            });
        }
    }
    Ok(out)
}

/// Result of one evaluation pass, identical on every rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalSummary {
    /// Global mean loss.
    pub mean: f64,
    /// Global loss sum.
    pub total: f64,
    /// Coordinate-estimator PCK by threshold key.
    pub pck: BTreeMap<String, f64>,
    /// Heatmap-estimator PCK by threshold key.
    pub heatmap_pck: BTreeMap<String, f64>,
    /// Top-1 accuracy (classification).
    pub accuracy: Option<f64>,
}

/// Running sums of an evaluation pass.
///
/// Packs to `[loss_sum, count, hm_0..hm_n, coord_0..coord_n]`, followed by an
/// accuracy sum when accuracy is tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricAccumulator {
    thresholds: Vec<f64>,
    track_accuracy: bool,
    loss_sum: f64,
    count: f64,
    heatmap: Vec<f64>,
    coordinate: Vec<f64>,
    accuracy: f64,
}

impl MetricAccumulator {
    /// Empty accumulator.
    #[must_use]
    pub fn new(thresholds: &[f64], track_accuracy: bool) -> Self {
        Self {
            thresholds: thresholds.to_vec(),
            track_accuracy,
            loss_sum: 0.0,
            count: 0.0,
            heatmap: vec![0.0; thresholds.len()],
            coordinate: vec![0.0; thresholds.len()],
            accuracy: 0.0,
        }
    }

    /// Record one batch's loss.
    pub fn add_loss(&mut self, loss: f64) {
        self.loss_sum += loss;
        self.count += 1.0;
    }

    /// Record one pose batch's per-threshold accuracies.
    pub fn add_pose(&mut self, distances: &PoseDistances) {
        for (i, thr) in self.thresholds.iter().enumerate() {
            self.heatmap[i] += pck_at_threshold(&distances.heatmap, *thr);
            self.coordinate[i] += pck_at_threshold(&distances.coordinate, *thr);
        }
    }

    /// Record one batch's top-1 accuracy.
    pub fn add_accuracy(&mut self, accuracy: f64) {
        self.accuracy += accuracy;
    }

    /// Length of the packed vector.
    #[must_use]
    pub fn packed_len(&self) -> usize {
        2 + 2 * self.thresholds.len() + usize::from(self.track_accuracy)
    }

    /// Flatten for a single all-reduce.
    #[must_use]
    pub fn pack(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.packed_len());
        out.push(self.loss_sum);
        out.push(self.count);
        out.extend(&self.heatmap);
        out.extend(&self.coordinate);
        if self.track_accuracy {
            out.push(self.accuracy);
        }
        out
    }

    /// Rebuild from a (reduced) packed vector.
    ///
    /// # Errors
    ///
    /// Returns [`ZooError::CollectiveMismatch`] if the length is wrong.
    pub fn unpack(&self, packed: &[f64]) -> Result<Self> {
        if packed.len() != self.packed_len() {
            return Err(ZooError::CollectiveMismatch {
                expected: self.packed_len(),
                actual: packed.len(),
            });
        }
        let n = self.thresholds.len();
        Ok(Self {
            thresholds: self.thresholds.clone(),
            track_accuracy: self.track_accuracy,
            loss_sum: packed[0],
            count: packed[1],
            heatmap: packed[2..2 + n].to_vec(),
            coordinate: packed[2 + n..2 + 2 * n].to_vec(),
            accuracy: if self.track_accuracy { packed[2 + 2 * n] } else { 0.0 },
        })
    }

    /// Averages over the batch count (zero when nothing was seen).
    #[must_use]
    pub fn summary(&self) -> EvalSummary {
        let avg = |sum: f64| if self.count > 0.0 { sum / self.count } else { 0.0 };
        let table = |sums: &[f64]| -> BTreeMap<String, f64> {
            self.thresholds
                .iter()
                .zip(sums)
                .map(|(t, s)| (pck_key(*t), avg(*s)))
                .collect()
        };
        EvalSummary {
            mean: avg(self.loss_sum),
            total: self.loss_sum,
            pck: table(&self.coordinate),
            heatmap_pck: table(&self.heatmap),
            accuracy: self.track_accuracy.then(|| avg(self.accuracy)),
        }
    }
}

/// Fraction of rows whose argmax equals the target class.
///
/// # Errors
///
/// Returns an error on shape mismatch.
pub fn top1_accuracy(logits: &Tensor, targets: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(candle_core::D::Minus1)?.to_dtype(DType::U32)?;
    let targets = targets.flatten_all()?.to_dtype(DType::U32)?;
    let n = targets.dims()[0];
    if n == 0 {
        return Ok(0.0);
    }
    let correct = predicted
        .eq(&targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(f64::from(correct) / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::render_heatmap;
    use candle_core::Device;

    const H: usize = 8;
    const W: usize = 8;
    const IMAGE: [usize; 2] = [32, 32];

    // Two samples, two joints; joint (1, 1) invisible.
    fn pose_targets(centres: &[[usize; 2]; 4]) -> (Tensor, KeypointTargets) {
        let device = Device::Cpu;
        let mut maps = Vec::new();
        let mut joints = Vec::new();
        for [x, y] in centres {
            maps.extend(render_heatmap(*x as f32, *y as f32, H, W, 1.0));
            joints.push((*x * 4) as f32);
            joints.push((*y * 4) as f32);
        }
        (
            Tensor::from_vec(maps, (2, 2, H, W), &device).unwrap(),
            KeypointTargets {
                joints: Tensor::from_vec(joints, (2, 2, 2), &device).unwrap(),
                visibility: Tensor::new(&[[1f32, 1.], [1., 0.]], &device).unwrap(),
                scale: Tensor::new(&[32f32, 32.], &device).unwrap(),
            },
        )
    }

    const CENTRES: [[usize; 2]; 4] = [[3, 3], [5, 2], [2, 6], [4, 4]];

    #[test]
    fn test_exact_predictions_score_one() {
        let (target, kp) = pose_targets(&CENTRES);
        let pred = target.reshape((2, 2 * H * W)).unwrap();
        let dists = pose_distances(&pred, &target, &kp, IMAGE).unwrap();
        for thr in [0.05, 0.1, 0.2] {
            assert_eq!(pck_at_threshold(&dists.heatmap, thr), 1.0);
            assert_eq!(pck_at_threshold(&dists.coordinate, thr), 1.0);
        }
        assert!(dists.heatmap[3].is_none());
    }

    #[test]
    fn test_displaced_predictions_score_zero() {
        let (target, kp) = pose_targets(&CENTRES);
        let (far, _) = pose_targets(&[[7, 0], [0, 7], [7, 0], [0, 0]]);
        let pred = far.reshape((2, 2 * H * W)).unwrap();
        let dists = pose_distances(&pred, &target, &kp, IMAGE).unwrap();
        assert_eq!(pck_at_threshold(&dists.heatmap, 0.2), 0.0);
        assert_eq!(pck_at_threshold(&dists.coordinate, 0.2), 0.0);
    }

    #[test]
    fn test_short_keypoint_targets_rejected() {
        let (target, kp) = pose_targets(&CENTRES);
        let pred = target.reshape((2, 2 * H * W)).unwrap();
        let device = Device::Cpu;
        let one_joint = KeypointTargets {
            joints: Tensor::zeros((2, 1, 2), DType::F32, &device).unwrap(),
            visibility: Tensor::ones((2, 1), DType::F32, &device).unwrap(),
            scale: kp.scale.clone(),
        };
        let err = pose_distances(&pred, &target, &one_joint, IMAGE).unwrap_err();
        assert!(matches!(err, ZooError::Training(_)));

        let short_visibility = KeypointTargets {
            visibility: Tensor::ones((2, 1), DType::F32, &device).unwrap(),
            ..kp
        };
        assert!(pose_distances(&pred, &target, &short_visibility, IMAGE).is_err());
    }

    #[test]
    fn test_no_valid_joints_scores_zero() {
        assert_eq!(pck_at_threshold(&[None, None], 0.5), 0.0);
        assert_eq!(pck_at_threshold(&[], 0.5), 0.0);
    }

    #[test]
    fn test_refine_quarter() {
        let mut map = vec![0f32; 25];
        map[2 * 5 + 2] = 1.0;
        map[2 * 5 + 3] = 0.5;
        map[1 * 5 + 2] = 0.5;
        assert_eq!(refine_quarter(&map, 5, 5, [2.0, 2.0]), [2.25, 1.75]);
        // border locations are not refined
        assert_eq!(refine_quarter(&map, 5, 5, [0.0, 2.0]), [0.0, 2.0]);
    }

    #[test]
    fn test_argmax_non_positive_is_origin() {
        let map = vec![-1f32, -0.5, -2.0, -3.0];
        assert_eq!(argmax_location(&map, 2).0, [0.0, 0.0]);
        let map = vec![0f32, 0.1, 0.9, 0.2];
        assert_eq!(argmax_location(&map, 2).0, [0.0, 1.0]);
    }

    #[test]
    fn test_accumulator_pack_unpack() {
        let mut acc = MetricAccumulator::new(&[0.05, 0.1], false);
        acc.add_loss(2.0);
        acc.add_loss(4.0);
        acc.add_pose(&PoseDistances {
            heatmap: vec![Some(0.01), Some(0.08)],
            coordinate: vec![Some(0.2), None],
        });
        let packed = acc.pack();
        assert_eq!(packed, vec![6.0, 2.0, 0.5, 1.0, 0.0, 0.0]);
        let restored = acc.unpack(&packed).unwrap();
        assert_eq!(restored, acc);

        let summary = restored.summary();
        assert_eq!(summary.mean, 3.0);
        assert_eq!(summary.heatmap_pck["0.05"], 0.25);
        assert_eq!(summary.heatmap_pck["0.1"], 0.5);
        assert!(summary.accuracy.is_none());
        assert!(acc.unpack(&packed[..3]).is_err());
    }

    #[test]
    fn test_accumulator_empty_pass() {
        let acc = MetricAccumulator::new(&[0.1], true);
        assert_eq!(acc.packed_len(), 5);
        let summary = acc.summary();
        assert_eq!(summary.mean, 0.0);
        assert_eq!(summary.pck["0.1"], 0.0);
        assert_eq!(summary.accuracy, Some(0.0));
    }

    #[test]
    fn test_top1_accuracy() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 0, 0], &Device::Cpu).unwrap();
        let acc = top1_accuracy(&logits, &targets).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-9);
    }
}
