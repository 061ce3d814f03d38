//! Ensemble plan stored next to the fold checkpoints (`plans.json`).

use crate::error::{Result, SegmentationError};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PLAN_FILE: &str = "plans.json";

/// Parameters handed to the label writer for every exported case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportParams {
    pub force_separate_z: Option<bool>,
    pub interpolation_order: u8,
    pub interpolation_order_z: u8,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            force_separate_z: None,
            interpolation_order: 1,
            interpolation_order_z: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub num_modalities: usize,
    pub num_classes: usize,
    /// Network patch size in `[z, y, x]`; a 2D network uses `z = 1`.
    pub patch_size: [usize; 3],
    /// Spatial axes (0 = z) flipped for test-time augmentation.
    #[serde(default = "default_mirror_axes")]
    pub mirror_axes: Vec<usize>,
    #[serde(default)]
    pub transpose_forward: Option<[usize; 3]>,
    #[serde(default)]
    pub transpose_backward: Option<[usize; 3]>,
    #[serde(default)]
    pub segmentation_export_params: Option<ExportParams>,
    #[serde(default)]
    pub regions_class_order: Option<Vec<u8>>,
}

fn default_mirror_axes() -> Vec<usize> {
    vec![0, 1, 2]
}

impl Plan {
    pub fn load(model_path: &Path) -> Result<Self> {
        let path = model_path.join(PLAN_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| SegmentationError::io(&path, e))?;
        let plan: Plan = serde_json::from_str(&raw)
            .map_err(|e| SegmentationError::Plan(format!("{}: {}", path.display(), e)))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_modalities == 0 {
            return Err(SegmentationError::Plan(
                "num_modalities must be positive".to_string(),
            ));
        }
        // Labels are written as u8
        if self.num_classes == 0 || self.num_classes > 256 {
            return Err(SegmentationError::Plan(format!(
                "num_classes must be in 1..=256, got {}",
                self.num_classes
            )));
        }
        if self.patch_size.iter().any(|&p| p == 0) {
            return Err(SegmentationError::Plan(format!(
                "patch_size {:?} has an empty axis",
                self.patch_size
            )));
        }
        let mut axes = self.mirror_axes.clone();
        axes.sort_unstable();
        axes.dedup();
        if axes.len() != self.mirror_axes.len() || axes.iter().any(|&a| a > 2) {
            return Err(SegmentationError::Plan(format!(
                "mirror_axes {:?} must be distinct spatial axes",
                self.mirror_axes
            )));
        }
        for perm in [self.transpose_forward, self.transpose_backward]
            .iter()
            .flatten()
        {
            if !is_permutation(perm) {
                return Err(SegmentationError::Plan(format!(
                    "{:?} is not a permutation of the spatial axes",
                    perm
                )));
            }
        }
        if let (Some(forward), Some(backward)) = (self.transpose_forward, self.transpose_backward) {
            if invert_permutation(forward) != backward {
                return Err(SegmentationError::Plan(format!(
                    "transpose_backward {:?} does not invert transpose_forward {:?}",
                    backward, forward
                )));
            }
        }
        if let Some(order) = &self.regions_class_order {
            if order.len() != self.num_classes {
                return Err(SegmentationError::Plan(format!(
                    "regions_class_order has {} entries for {} output channels",
                    order.len(),
                    self.num_classes
                )));
            }
        }
        Ok(())
    }

    pub fn export_params(&self) -> ExportParams {
        self.segmentation_export_params.unwrap_or_default()
    }

    /// Inverse spatial permutation, only when a forward transpose was recorded.
    pub fn transpose_backward(&self) -> Option<[usize; 3]> {
        self.transpose_forward
            .map(|forward| self.transpose_backward.unwrap_or_else(|| invert_permutation(forward)))
    }
}

pub fn is_permutation(perm: &[usize; 3]) -> bool {
    let mut seen = [false; 3];
    for &axis in perm {
        if axis > 2 || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

/// `inverse[perm[i]] = i`
pub fn invert_permutation(perm: [usize; 3]) -> [usize; 3] {
    let mut inverse = [0; 3];
    for (i, &axis) in perm.iter().enumerate() {
        inverse[axis] = i;
    }
    inverse
}
