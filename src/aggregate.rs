//! Fold averaging and spatial axis remapping of probability volumes.

use crate::error::{Result, SegmentationError};
use crate::plan::{invert_permutation, Plan};
use ndarray::{Array4, ArrayView5, Axis};

/// Arithmetic mean over the leading fold axis of `[folds, classes, z, y, x]`.
pub fn mean_over_folds(stacked: ArrayView5<f32>) -> Result<Array4<f32>> {
    stacked.mean_axis(Axis(0)).ok_or_else(|| {
        SegmentationError::InvalidVolume("cannot average an empty fold stack".to_string())
    })
}

/// Reorder the spatial axes of `[c, z, y, x]`; axis `i` of the result is
/// spatial axis `perm[i]` of the input. The channel axis stays first.
pub fn permute_spatial(volume: Array4<f32>, perm: [usize; 3]) -> Array4<f32> {
    if perm == [0, 1, 2] {
        return volume;
    }
    let permuted = volume.permuted_axes([0, perm[0] + 1, perm[1] + 1, perm[2] + 1]);
    if permuted.is_standard_layout() {
        permuted
    } else {
        permuted.as_standard_layout().into_owned()
    }
}

/// Undoes the forward transpose recorded by preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisRemapper {
    backward: Option<[usize; 3]>,
}

impl AxisRemapper {
    pub fn new(transpose_forward: Option<[usize; 3]>) -> Self {
        Self {
            backward: transpose_forward.map(invert_permutation),
        }
    }

    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            backward: plan.transpose_backward(),
        }
    }

    pub fn backward(&self) -> Option<[usize; 3]> {
        self.backward
    }

    pub fn remap(&self, volume: Array4<f32>) -> Array4<f32> {
        match self.backward {
            Some(backward) => permute_spatial(volume, backward),
            None => volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{stack, Array5};

    fn fold_volume(seed: usize) -> Array4<f32> {
        Array4::from_shape_fn((3, 2, 4, 5), |(c, z, y, x)| {
            ((seed * 31 + c * 7 + z * 5 + y * 3 + x) % 17) as f32 / 17.0
        })
    }

    #[test]
    fn test_mean_matches_arithmetic_mean() {
        let folds: Vec<Array4<f32>> = (0..5).map(fold_volume).collect();
        let views: Vec<_> = folds.iter().map(|f| f.view()).collect();
        let stacked = stack(Axis(0), &views).unwrap();

        let mean = mean_over_folds(stacked.view()).unwrap();
        let mut expected = Array4::<f32>::zeros((3, 2, 4, 5));
        for f in &folds {
            expected += f;
        }
        expected /= 5.0;

        for (a, b) in mean.iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-6 * b.abs().max(1.0));
        }
    }

    #[test]
    fn test_mean_independent_of_fold_order() {
        let folds: Vec<Array4<f32>> = (0..4).map(fold_volume).collect();
        let forward: Vec<_> = folds.iter().map(|f| f.view()).collect();
        let reversed: Vec<_> = folds.iter().rev().map(|f| f.view()).collect();

        let a = mean_over_folds(stack(Axis(0), &forward).unwrap().view()).unwrap();
        let b = mean_over_folds(stack(Axis(0), &reversed).unwrap().view()).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= 1e-6);
        }
    }

    #[test]
    fn test_single_fold_is_identity() {
        let fold = fold_volume(3);
        let stacked = fold.clone().insert_axis(Axis(0));
        assert_eq!(mean_over_folds(stacked.view()).unwrap(), fold);
    }

    #[test]
    fn test_empty_stack_is_error() {
        let empty = Array5::<f32>::zeros((0, 2, 1, 1, 1));
        assert!(mean_over_folds(empty.view()).is_err());
    }

    #[test]
    fn test_remap_roundtrip_for_every_permutation() {
        let original = Array4::from_shape_fn((2, 3, 4, 5), |(c, z, y, x)| {
            (c * 1000 + z * 100 + y * 10 + x) as f32
        });
        let perms = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for forward in perms {
            let transposed = permute_spatial(original.clone(), forward);
            let restored = AxisRemapper::new(Some(forward)).remap(transposed);
            assert_eq!(restored, original, "forward {:?}", forward);
            assert!(restored.is_standard_layout());
        }
    }

    #[test]
    fn test_remap_keeps_class_axis() {
        let original = Array4::from_shape_fn((2, 3, 4, 5), |(c, z, y, x)| {
            (c * 1000 + z * 100 + y * 10 + x) as f32
        });
        let remapped = AxisRemapper::new(Some([1, 2, 0])).remap(original.clone());
        // backward of [1, 2, 0] is [2, 0, 1]
        assert_eq!(remapped.dim(), (2, 5, 3, 4));
        assert_eq!(remapped[[1, 4, 2, 3]], original[[1, 2, 3, 4]]);
    }

    #[test]
    fn test_no_transpose_is_noop() {
        let original = fold_volume(1);
        assert_eq!(AxisRemapper::default().remap(original.clone()), original);
    }
}
