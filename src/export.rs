//! Bounded background export of label maps
//!
//! Export tasks run on blocking threads tracked by a `JoinSet`. `submit`
//! only waits when the pool is full, and then for a single task; everything
//! left is awaited once by `drain`.

use crate::error::{Result, SegmentationError};
use crate::memory_guard::ExportHandle;
use crate::metrics::{EXPORTS_COMPLETED, EXPORTS_IN_FLIGHT};
use crate::plan::ExportParams;
use crate::preprocessing::CaseProperties;
use crate::volume::{write_atomic_with, LabelMap, VolumeIo};
use anyhow::anyhow;
use ndarray::{s, Array3, Array4, ArrayView4, Axis};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Probability above which a region channel claims a voxel.
pub const REGION_THRESHOLD: f32 = 0.5;

/// Everything an export worker needs for one case. Consumed exactly once.
#[derive(Debug)]
pub struct PendingExport {
    pub case_id: String,
    pub handle: ExportHandle,
    pub output_path: PathBuf,
    pub properties: CaseProperties,
    pub export_params: ExportParams,
    pub region_class_order: Option<Vec<u8>>,
    /// Where to write the raw probabilities, when requested.
    pub probability_path: Option<PathBuf>,
}

/// Argmax over classes, or region assignment in `order` when given.
pub fn probabilities_to_labels(
    probabilities: ArrayView4<f32>,
    region_class_order: Option<&[u8]>,
) -> anyhow::Result<Array3<u8>> {
    let (classes, z, y, x) = probabilities.dim();
    if classes == 0 {
        return Err(anyhow!("probability volume has no classes"));
    }

    match region_class_order {
        Some(order) => {
            if order.len() != classes {
                return Err(anyhow!(
                    "region order has {} entries for {} channels",
                    order.len(),
                    classes
                ));
            }
            let mut labels = Array3::<u8>::zeros((z, y, x));
            for (channel, &label) in probabilities.axis_iter(Axis(0)).zip(order) {
                labels.zip_mut_with(&channel, |out, &p| {
                    if p > REGION_THRESHOLD {
                        *out = label;
                    }
                });
            }
            Ok(labels)
        }
        None => {
            if classes > u8::MAX as usize + 1 {
                return Err(anyhow!("{} classes do not fit in u8 labels", classes));
            }
            let mut labels = Array3::<u8>::zeros((z, y, x));
            let mut best = probabilities.index_axis(Axis(0), 0).to_owned();
            for (class, channel) in probabilities.axis_iter(Axis(0)).enumerate().skip(1) {
                ndarray::Zip::from(&mut labels)
                    .and(&mut best)
                    .and(&channel)
                    .for_each(|label, best, &p| {
                        if p > *best {
                            *best = p;
                            *label = class as u8;
                        }
                    });
            }
            Ok(labels)
        }
    }
}

/// Place `labels` back into a zero volume of the scan's original shape.
pub fn restore_crop(labels: Array3<u8>, properties: &CaseProperties) -> anyhow::Result<Array3<u8>> {
    let bbox = properties.crop_bbox;
    for (axis, (range, &extent)) in bbox.iter().zip(&properties.original_shape).enumerate() {
        if range[0] > range[1] || range[1] > extent {
            return Err(anyhow!(
                "crop {:?} on axis {} does not fit original extent {}",
                range,
                axis,
                extent
            ));
        }
    }

    let cropped = properties.cropped_shape();
    let got = labels.dim();
    if [got.0, got.1, got.2] != cropped {
        return Err(anyhow!(
            "label map has shape {:?}, cropped region is {:?}",
            got,
            cropped
        ));
    }
    if cropped == properties.original_shape {
        return Ok(labels);
    }

    let [sz, sy, sx] = properties.original_shape;
    let mut full = Array3::<u8>::zeros((sz, sy, sx));
    full.slice_mut(s![
        bbox[0][0]..bbox[0][1],
        bbox[1][0]..bbox[1][1],
        bbox[2][0]..bbox[2][1]
    ])
    .assign(&labels);
    Ok(full)
}

fn write_probabilities(path: &Path, probabilities: &Array4<f32>) -> anyhow::Result<()> {
    write_atomic_with(path, |writer| {
        bincode::serialize_into(writer, probabilities).map_err(|e| anyhow!(e))
    })
}

/// Runs one export to completion on the calling thread.
pub fn run_export(task: PendingExport, io: &dyn VolumeIo) -> Result<PathBuf> {
    let PendingExport {
        case_id,
        handle,
        output_path,
        properties,
        export_params,
        region_class_order,
        probability_path,
    } = task;

    let export = || -> anyhow::Result<()> {
        let probabilities = handle.resolve()?;
        if let Some(path) = &probability_path {
            write_probabilities(path, &probabilities)?;
            debug!(case_id = %case_id, path = %path.display(), "Wrote probability sidecar");
        }
        let labels = probabilities_to_labels(probabilities.view(), region_class_order.as_deref())?;
        let labels = restore_crop(labels, &properties)?;
        let map = LabelMap {
            spacing: properties.original_spacing,
            labels,
        };
        io.write_labels(&output_path, &map, &export_params)
    };
    export().map_err(|source| SegmentationError::ExportFailure {
        path: output_path.clone(),
        source,
    })?;

    info!(case_id = %case_id, path = %output_path.display(), "Exported label map");
    Ok(output_path)
}

/// Keeps `EXPORTS_IN_FLIGHT` accurate even when a task panics.
struct InFlightGuard;

impl InFlightGuard {
    fn new() -> Self {
        EXPORTS_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        EXPORTS_IN_FLIGHT.dec();
    }
}

pub struct ExportScheduler {
    pool_num: usize,
    io: Arc<dyn VolumeIo>,
    in_flight: JoinSet<Result<PathBuf>>,
    completed: Vec<PathBuf>,
}

impl ExportScheduler {
    pub fn new(pool_num: usize, io: Arc<dyn VolumeIo>) -> Self {
        Self {
            pool_num: pool_num.max(1),
            io,
            in_flight: JoinSet::new(),
            completed: Vec::new(),
        }
    }

    pub fn pool_num(&self) -> usize {
        self.pool_num
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Hand `task` to a worker, first waiting for one slot if the pool is full.
    pub async fn submit(&mut self, task: PendingExport) -> Result<()> {
        while self.in_flight.len() >= self.pool_num {
            self.reap_one().await?;
        }

        debug!(case_id = %task.case_id, in_flight = self.in_flight.len(), "Submitting export");
        let io = self.io.clone();
        self.in_flight.spawn_blocking(move || {
            let _guard = InFlightGuard::new();
            run_export(task, io.as_ref())
        });
        Ok(())
    }

    async fn reap_one(&mut self) -> Result<()> {
        match self.in_flight.join_next().await {
            Some(joined) => {
                let path = joined.map_err(|source| SegmentationError::TaskJoin {
                    stage: "export",
                    source,
                })??;
                EXPORTS_COMPLETED.inc();
                self.completed.push(path);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Await every outstanding export and return the paths written since the
    /// last drain. Later tasks are still awaited when one fails; the first
    /// error is returned.
    pub async fn drain(&mut self) -> Result<Vec<PathBuf>> {
        let mut first_error = None;
        while !self.in_flight.is_empty() {
            if let Err(e) = self.reap_one().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                self.completed.clear();
                Err(e)
            }
            None => Ok(std::mem::take(&mut self.completed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_guard::ArrayHandle;

    fn properties(original: [usize; 3], bbox: [[usize; 2]; 3]) -> CaseProperties {
        CaseProperties {
            original_shape: original,
            original_spacing: [1.0, 1.0, 1.0],
            crop_bbox: bbox,
            transpose_forward: None,
        }
    }

    #[test]
    fn test_argmax_labels() {
        let mut p = Array4::<f32>::zeros((3, 1, 1, 3));
        p[[0, 0, 0, 0]] = 0.7;
        p[[1, 0, 0, 0]] = 0.2;
        p[[1, 0, 0, 1]] = 0.6;
        p[[2, 0, 0, 2]] = 0.9;
        let labels = probabilities_to_labels(p.view(), None).unwrap();
        assert_eq!(labels.as_slice().unwrap(), &[0, 1, 2]);
    }

    #[test]
    fn test_region_labels_later_regions_win() {
        let mut p = Array4::<f32>::zeros((2, 1, 1, 3));
        p[[0, 0, 0, 0]] = 0.9;
        p[[0, 0, 0, 1]] = 0.9;
        p[[1, 0, 0, 1]] = 0.6;
        p[[1, 0, 0, 2]] = 0.5;
        let labels = probabilities_to_labels(p.view(), Some(&[1, 2])).unwrap();
        assert_eq!(labels.as_slice().unwrap(), &[1, 2, 0]);
        assert!(probabilities_to_labels(p.view(), Some(&[1])).is_err());
    }

    #[test]
    fn test_restore_crop() {
        let labels = Array3::<u8>::ones((1, 2, 2));
        let props = properties([2, 4, 4], [[1, 2], [1, 3], [2, 4]]);
        let full = restore_crop(labels, &props).unwrap();
        assert_eq!(full.dim(), (2, 4, 4));
        assert_eq!(full.iter().filter(|&&v| v == 1).count(), 4);
        assert_eq!(full[[1, 2, 3]], 1);
        assert_eq!(full[[0, 2, 3]], 0);

        let wrong = Array3::<u8>::ones((1, 1, 1));
        assert!(restore_crop(wrong, &props).is_err());
    }

    #[test]
    fn test_restore_crop_rejects_bbox_outside_original() {
        let labels = Array3::<u8>::ones((1, 2, 2));
        let props = properties([2, 4, 4], [[1, 2], [3, 5], [0, 2]]);
        let err = restore_crop(labels, &props).unwrap_err();
        assert!(err.to_string().contains("axis 1"));

        let reversed = properties([2, 4, 4], [[1, 2], [3, 1], [0, 2]]);
        assert!(restore_crop(Array3::<u8>::ones((1, 2, 2)), &reversed).is_err());
    }

    #[test]
    fn test_run_export_writes_labels_and_sidecar() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("out").join("eye.vol");
        let sidecar = dir.path().join("out").join("eye.prob");
        let mut p = Array4::<f32>::zeros((2, 1, 2, 2));
        p.index_axis_mut(Axis(0), 1).fill(1.0);

        let task = PendingExport {
            case_id: "eye".to_string(),
            handle: ArrayHandle::Inline(p.clone()),
            output_path: output.clone(),
            properties: properties([1, 3, 3], [[0, 1], [0, 2], [1, 3]]),
            export_params: ExportParams::default(),
            region_class_order: None,
            probability_path: Some(sidecar.clone()),
        };
        let io = crate::volume::BincodeVolumeIo;
        assert_eq!(run_export(task, &io).unwrap(), output);

        let map = io.read_labels(&output).unwrap();
        assert_eq!(map.shape(), [1, 3, 3]);
        assert_eq!(map.labels.iter().filter(|&&v| v == 1).count(), 4);
        assert_eq!(map.labels[[0, 2, 0]], 0);

        let file = std::fs::File::open(&sidecar).unwrap();
        let stored: Array4<f32> = bincode::deserialize_from(file).unwrap();
        assert_eq!(stored, p);
    }
}
