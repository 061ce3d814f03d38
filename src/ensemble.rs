//! Fold ensemble inference
//!
//! One network instance is shared by every fold: `EnsembleArena::load` swaps a
//! fold's weights into it, so only one fold is ever resident. Each fold runs
//! sliding-window inference with Gaussian blending and mirror test-time
//! augmentation; per-fold softmax volumes are stacked and averaged.

use crate::aggregate::mean_over_folds;
use crate::error::{Result, SegmentationError};
use crate::metrics::{Timer, FOLD_INFERENCE_LATENCY};
use crate::plan::Plan;
use anyhow::anyhow;
use ndarray::{s, Array3, Array4, Array5, ArrayView4, ArrayView5, Axis};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One member of the cross-validation ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldMember {
    pub fold: u8,
    pub checkpoint: PathBuf,
}

/// The network forward pass, as provided by an inference backend.
pub trait PatchNetwork: Send {
    fn load_weights(&mut self, member: &FoldMember) -> anyhow::Result<()>;

    fn release_weights(&mut self);

    /// Maps a `[1, modalities, z, y, x]` patch to logits `[1, classes, z, y, x]`.
    fn forward(&mut self, patch: ArrayView5<f32>) -> anyhow::Result<Array5<f32>>;

    /// Drop cached device allocations.
    fn clear_cache(&mut self) {}
}

/// Brings up the network and resolves the fold checkpoints of a model directory.
pub trait EnsembleLoader: Send + Sync {
    fn load(
        &self,
        model_path: &Path,
        folds: &[u8],
    ) -> anyhow::Result<(Box<dyn PatchNetwork>, Vec<FoldMember>)>;
}

/// `<model_path>/fold_<k>/<checkpoint_name>`, failing on the first missing file.
pub fn checkpoint_members(
    model_path: &Path,
    folds: &[u8],
    checkpoint_name: &str,
) -> anyhow::Result<Vec<FoldMember>> {
    folds
        .iter()
        .map(|&fold| {
            let checkpoint = model_path
                .join(format!("fold_{}", fold))
                .join(checkpoint_name);
            if checkpoint.is_file() {
                Ok(FoldMember { fold, checkpoint })
            } else {
                Err(anyhow!(
                    "checkpoint for fold {} not found at {}",
                    fold,
                    checkpoint.display()
                ))
            }
        })
        .collect()
}

/// Holds the shared network and the single active-weights slot.
pub struct EnsembleArena {
    network: Box<dyn PatchNetwork>,
    members: Vec<FoldMember>,
    active: Option<usize>,
}

impl EnsembleArena {
    pub fn new(network: Box<dyn PatchNetwork>, members: Vec<FoldMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(SegmentationError::Config(
                "ensemble needs at least one fold".to_string(),
            ));
        }
        Ok(Self {
            network,
            members,
            active: None,
        })
    }

    pub fn members(&self) -> &[FoldMember] {
        &self.members
    }

    pub fn active_fold(&self) -> Option<u8> {
        self.active.map(|i| self.members[i].fold)
    }

    /// Swap member `index` into the network. The previous fold's weights are
    /// released before the new ones are loaded.
    pub fn load(&mut self, index: usize) -> anyhow::Result<&mut dyn PatchNetwork> {
        let member = self
            .members
            .get(index)
            .ok_or_else(|| anyhow!("no ensemble member at index {}", index))?;

        if self.active != Some(index) {
            if self.active.take().is_some() {
                self.network.release_weights();
            }
            debug!(fold = member.fold, checkpoint = %member.checkpoint.display(), "Loading fold weights");
            self.network.load_weights(member)?;
            self.active = Some(index);
        }
        Ok(self.network.as_mut())
    }

    pub fn clear_cache(&mut self) {
        self.network.clear_cache();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindowConfig {
    pub patch_size: [usize; 3],
    pub num_classes: usize,
    /// Window stride as a fraction of the patch size.
    pub step_size: f32,
    pub use_gaussian: bool,
    /// Spatial axes flipped for test-time augmentation; empty disables it.
    pub mirror_axes: Vec<usize>,
}

impl SlidingWindowConfig {
    pub fn from_plan(plan: &Plan, step_size: f32, use_gaussian: bool, do_mirroring: bool) -> Self {
        Self {
            patch_size: plan.patch_size,
            num_classes: plan.num_classes,
            step_size,
            use_gaussian,
            mirror_axes: if do_mirroring {
                plan.mirror_axes.clone()
            } else {
                Vec::new()
            },
        }
    }
}

/// Window start offsets along each axis of an image at least as large as the patch.
pub fn compute_steps(patch: [usize; 3], image: [usize; 3], step_size: f32) -> [Vec<usize>; 3] {
    let axis_steps = |d: usize| -> Vec<usize> {
        let max_step = image[d].saturating_sub(patch[d]);
        let target = patch[d] as f64 * step_size as f64;
        let num_steps = (max_step as f64 / target).ceil() as usize + 1;
        if num_steps > 1 {
            let actual = max_step as f64 / (num_steps - 1) as f64;
            (0..num_steps)
                .map(|i| (actual * i as f64).round_ties_even() as usize)
                .collect()
        } else {
            vec![0]
        }
    };
    [axis_steps(0), axis_steps(1), axis_steps(2)]
}

/// Separable Gaussian centred on the patch with sigma = patch / 8, peak 1.
pub fn gaussian_importance_map(patch: [usize; 3], sigma_scale: f64) -> Array3<f32> {
    let axis_weights = |d: usize| -> Vec<f64> {
        let center = (patch[d] / 2) as f64;
        let sigma = patch[d] as f64 * sigma_scale;
        (0..patch[d])
            .map(|i| {
                let offset = i as f64 - center;
                (-(offset * offset) / (2.0 * sigma * sigma)).exp()
            })
            .collect()
    };
    let (wz, wy, wx) = (axis_weights(0), axis_weights(1), axis_weights(2));
    let mut map = Array3::from_shape_fn((patch[0], patch[1], patch[2]), |(z, y, x)| {
        (wz[z] * wy[y] * wx[x]) as f32
    });

    // Zero weights would leave uncovered voxels undefined
    let min_positive = map
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .fold(f32::INFINITY, f32::min);
    if min_positive.is_finite() {
        map.mapv_inplace(|v| if v > 0.0 { v } else { min_positive });
    }
    map
}

/// In-place softmax over the class axis of `[classes, z, y, x]`.
pub fn softmax_classes(logits: &mut Array4<f32>) {
    for mut lane in logits.lanes_mut(Axis(0)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
}

/// Zero-pad `[c, z, y, x]` so each spatial axis is at least the patch size.
/// Returns the padded volume and the `[start, end)` of the original data.
fn pad_to_patch(data: ArrayView4<f32>, patch: [usize; 3]) -> (Array4<f32>, [[usize; 2]; 3]) {
    let (c, z, y, x) = data.dim();
    let shape = [z, y, x];
    let mut region = [[0usize; 2]; 3];
    let mut padded_shape = [0usize; 3];
    for d in 0..3 {
        padded_shape[d] = shape[d].max(patch[d]);
        let below = (padded_shape[d] - shape[d]) / 2;
        region[d] = [below, below + shape[d]];
    }
    if padded_shape == shape {
        return (data.to_owned(), region);
    }

    let mut padded = Array4::<f32>::zeros((c, padded_shape[0], padded_shape[1], padded_shape[2]));
    padded
        .slice_mut(s![
            ..,
            region[0][0]..region[0][1],
            region[1][0]..region[1][1],
            region[2][0]..region[2][1]
        ])
        .assign(&data);
    (padded, region)
}

/// Softmax prediction of one patch averaged over every mirror combination.
fn predict_patch_mirrored(
    network: &mut dyn PatchNetwork,
    patch: ArrayView4<f32>,
    num_classes: usize,
    mirror_axes: &[usize],
) -> anyhow::Result<Array4<f32>> {
    let (_, pz, py, px) = patch.dim();
    let combinations = 1usize << mirror_axes.len();
    let mut accumulated = Array4::<f32>::zeros((num_classes, pz, py, px));

    for mask in 0..combinations {
        let flips: Vec<usize> = mirror_axes
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, &axis)| axis)
            .collect();

        let mut input = patch.view();
        for &axis in &flips {
            input.invert_axis(Axis(axis + 1));
        }
        let batch = input.as_standard_layout().into_owned().insert_axis(Axis(0));

        let logits = network.forward(batch.view())?;
        if logits.dim() != (1, num_classes, pz, py, px) {
            return Err(anyhow!(
                "network returned {:?}, expected {:?}",
                logits.shape(),
                [1, num_classes, pz, py, px]
            ));
        }
        let mut probabilities = logits.index_axis_move(Axis(0), 0);
        softmax_classes(&mut probabilities);

        let mut restored = probabilities.view();
        for &axis in &flips {
            restored.invert_axis(Axis(axis + 1));
        }
        accumulated += &restored;
    }

    let scale = 1.0 / combinations as f32;
    accumulated.mapv_inplace(|v| v * scale);
    Ok(accumulated)
}

/// Class probabilities `[classes, z, y, x]` of a whole volume for the loaded fold.
pub fn predict_sliding_window(
    network: &mut dyn PatchNetwork,
    data: ArrayView4<f32>,
    config: &SlidingWindowConfig,
    gaussian: &Array3<f32>,
) -> anyhow::Result<Array4<f32>> {
    let patch = config.patch_size;
    let (padded, region) = pad_to_patch(data, patch);
    let (_, nz, ny, nx) = padded.dim();
    let steps = compute_steps(patch, [nz, ny, nx], config.step_size);

    let uniform;
    let weights_map = if config.use_gaussian {
        gaussian
    } else {
        uniform = Array3::<f32>::ones((patch[0], patch[1], patch[2]));
        &uniform
    };

    let mut aggregated = Array4::<f32>::zeros((config.num_classes, nz, ny, nx));
    let mut weights = Array3::<f32>::zeros((nz, ny, nx));

    for &z in &steps[0] {
        for &y in &steps[1] {
            for &x in &steps[2] {
                let window = padded.slice(s![.., z..z + patch[0], y..y + patch[1], x..x + patch[2]]);
                let probabilities =
                    predict_patch_mirrored(network, window, config.num_classes, &config.mirror_axes)?;
                let weighted = probabilities * weights_map;

                let mut target =
                    aggregated.slice_mut(s![.., z..z + patch[0], y..y + patch[1], x..x + patch[2]]);
                target += &weighted;
                let mut target_weights =
                    weights.slice_mut(s![z..z + patch[0], y..y + patch[1], x..x + patch[2]]);
                target_weights += weights_map;
            }
        }
    }

    aggregated /= &weights;
    Ok(aggregated
        .slice(s![
            ..,
            region[0][0]..region[0][1],
            region[1][0]..region[1][1],
            region[2][0]..region[2][1]
        ])
        .to_owned())
}

/// Runs every fold over a case and averages their probabilities.
pub struct EnsemblePredictor {
    arena: EnsembleArena,
    window: SlidingWindowConfig,
    gaussian: Array3<f32>,
}

impl EnsemblePredictor {
    pub fn new(arena: EnsembleArena, window: SlidingWindowConfig) -> Self {
        let gaussian = gaussian_importance_map(window.patch_size, 1.0 / 8.0);
        Self {
            arena,
            window,
            gaussian,
        }
    }

    pub fn arena(&self) -> &EnsembleArena {
        &self.arena
    }

    pub fn clear_cache(&mut self) {
        self.arena.clear_cache();
    }

    /// Per-fold probabilities stacked as `[folds, classes, z, y, x]`.
    pub fn predict_folds(&mut self, case_id: &str, data: ArrayView4<f32>) -> Result<Array5<f32>> {
        let mut per_fold = Vec::with_capacity(self.arena.members().len());

        for index in 0..self.arena.members().len() {
            let fold = self.arena.members()[index].fold;
            let timer = Timer::new();
            let network = self
                .arena
                .load(index)
                .map_err(|source| SegmentationError::EnsembleFailure {
                    case_id: case_id.to_string(),
                    fold,
                    source,
                })?;
            let probabilities = predict_sliding_window(network, data, &self.window, &self.gaussian)
                .map_err(|source| SegmentationError::EnsembleFailure {
                    case_id: case_id.to_string(),
                    fold,
                    source,
                })?;
            timer.observe_duration_seconds(&FOLD_INFERENCE_LATENCY);
            debug!(case_id, fold, "Fold inference finished");
            per_fold.push(probabilities);
        }

        let views: Vec<_> = per_fold.iter().map(|p| p.view()).collect();
        ndarray::stack(Axis(0), &views)
            .map_err(|e| SegmentationError::InvalidVolume(format!("stacking folds: {}", e)))
    }

    /// Averaged probabilities `[classes, z, y, x]` in the network's axis order.
    pub fn predict(&mut self, case_id: &str, data: ArrayView4<f32>) -> Result<Array4<f32>> {
        info!(case_id, folds = self.arena.members().len(), "predicting {}", case_id);
        let stacked = self.predict_folds(case_id, data)?;
        mean_over_folds(stacked.view())
    }
}
