//! Preprocessing collaborator and the read-ahead stream feeding the ensemble.

use crate::aggregate::permute_spatial;
use crate::discovery::{Case, INPUT_SPILL_SUFFIX};
use crate::error::{Result, SegmentationError};
use crate::memory_guard::{ArrayHandle, MemoryGuard};
use crate::volume::VolumeIo;
use anyhow::anyhow;
use futures::{Stream, StreamExt};
use ndarray::{s, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// What export needs to put a prediction back onto the scan grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseProperties {
    /// Spatial shape of the scan as read, `[z, y, x]`.
    pub original_shape: [usize; 3],
    pub original_spacing: [f64; 3],
    /// `[start, end)` per axis of the region kept after cropping.
    pub crop_bbox: [[usize; 2]; 3],
    pub transpose_forward: Option<[usize; 3]>,
}

impl CaseProperties {
    pub fn cropped_shape(&self) -> [usize; 3] {
        [
            self.crop_bbox[0][1] - self.crop_bbox[0][0],
            self.crop_bbox[1][1] - self.crop_bbox[1][0],
            self.crop_bbox[2][1] - self.crop_bbox[2][0],
        ]
    }
}

#[derive(Debug)]
pub struct PreprocessedCase {
    pub case: Case,
    pub data: ArrayHandle,
    pub properties: CaseProperties,
}

pub trait Preprocessor: Send + Sync {
    /// Returns the network input `[modalities, z, y, x]` in internal axis order.
    fn preprocess(&self, case: &Case) -> anyhow::Result<(Array4<f32>, CaseProperties)>;
}

/// Stacks modalities, crops to the non-zero box, z-scores each channel and
/// applies the plan's forward transpose.
pub struct StandardPreprocessor {
    io: Arc<dyn VolumeIo>,
    transpose_forward: Option<[usize; 3]>,
}

impl StandardPreprocessor {
    pub fn new(io: Arc<dyn VolumeIo>, transpose_forward: Option<[usize; 3]>) -> Self {
        Self {
            io,
            transpose_forward,
        }
    }
}

impl Preprocessor for StandardPreprocessor {
    fn preprocess(&self, case: &Case) -> anyhow::Result<(Array4<f32>, CaseProperties)> {
        let mut scans = Vec::with_capacity(case.input_paths.len());
        for path in &case.input_paths {
            scans.push(self.io.read_scan(path)?);
        }
        let first = scans
            .first()
            .ok_or_else(|| anyhow!("case {} has no modalities", case.case_id))?;
        let shape = first.data.dim();
        let spacing = first.spacing;
        if shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(anyhow!("case {} has an empty volume {:?}", case.case_id, shape));
        }
        if let Some(bad) = scans.iter().position(|s| s.data.dim() != shape) {
            return Err(anyhow!(
                "modality {} of case {} has shape {:?}, expected {:?}",
                bad,
                case.case_id,
                scans[bad].data.dim(),
                shape
            ));
        }

        let stacked = {
            let views: Vec<_> = scans.iter().map(|s| s.data.view()).collect();
            ndarray::stack(Axis(0), &views)?
        };
        drop(scans);

        let bbox = nonzero_bbox(&stacked);
        let mut cropped = stacked
            .slice(s![
                ..,
                bbox[0][0]..bbox[0][1],
                bbox[1][0]..bbox[1][1],
                bbox[2][0]..bbox[2][1]
            ])
            .to_owned();
        for mut channel in cropped.axis_iter_mut(Axis(0)) {
            let mean = channel.mean().unwrap_or(0.0);
            let std = channel.std(0.0);
            let scale = if std > 1e-8 { 1.0 / std } else { 1.0 };
            channel.mapv_inplace(|v| (v - mean) * scale);
        }

        let data = match self.transpose_forward {
            Some(forward) => permute_spatial(cropped, forward),
            None => cropped,
        };

        let properties = CaseProperties {
            original_shape: [shape.0, shape.1, shape.2],
            original_spacing: spacing,
            crop_bbox: bbox,
            transpose_forward: self.transpose_forward,
        };
        Ok((data, properties))
    }
}

/// Smallest box holding every voxel that is non-zero in any channel; the full
/// extent when the volume is entirely zero.
pub fn nonzero_bbox(volume: &Array4<f32>) -> [[usize; 2]; 3] {
    let (_, nz, ny, nx) = volume.dim();
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut any = false;

    for ((_, z, y, x), &v) in volume.indexed_iter() {
        if v != 0.0 {
            any = true;
            for (axis, idx) in [z, y, x].into_iter().enumerate() {
                lo[axis] = lo[axis].min(idx);
                hi[axis] = hi[axis].max(idx + 1);
            }
        }
    }

    if !any {
        return [[0, nz], [0, ny], [0, nx]];
    }
    [[lo[0], hi[0]], [lo[1], hi[1]], [lo[2], hi[2]]]
}

fn prepare_case(
    case: Case,
    preprocessor: &dyn Preprocessor,
    guard: &MemoryGuard,
) -> Result<PreprocessedCase> {
    debug!(case_id = %case.case_id, "Preprocessing case");
    let (volume, properties) =
        preprocessor
            .preprocess(&case)
            .map_err(|source| SegmentationError::PreprocessingFailure {
                case_id: case.case_id.clone(),
                source,
            })?;
    if volume.iter().any(|v| !v.is_finite()) {
        return Err(SegmentationError::PreprocessingFailure {
            case_id: case.case_id.clone(),
            source: anyhow!("preprocessed volume contains non-finite values"),
        });
    }
    let data = guard.guard(volume, case.sibling(INPUT_SPILL_SUFFIX))?;
    Ok(PreprocessedCase {
        case,
        data,
        properties,
    })
}

/// Ordered, read-ahead stream of preprocessed cases.
///
/// At most `num_workers` cases are preprocessed concurrently and at most
/// `num_workers` finished cases wait in the queue. The stream ends after the
/// first error.
pub struct PreprocessingStream {
    inner: ReceiverStream<Result<PreprocessedCase>>,
    producer: JoinHandle<()>,
}

impl PreprocessingStream {
    pub fn spawn(
        cases: Vec<Case>,
        preprocessor: Arc<dyn Preprocessor>,
        guard: MemoryGuard,
        num_workers: usize,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let (tx, rx) = mpsc::channel(num_workers);
        let stopped = Arc::new(AtomicBool::new(false));

        let producer = tokio::spawn(async move {
            let pending_stopped = stopped.clone();
            let mut prepared = futures::stream::iter(cases.into_iter().map(move |case| {
                let preprocessor = preprocessor.clone();
                let stopped = pending_stopped.clone();
                async move {
                    if stopped.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = match tokio::task::spawn_blocking(move || {
                        prepare_case(case, preprocessor.as_ref(), &guard)
                    })
                    .await
                    {
                        Ok(result) => result,
                        Err(source) => Err(SegmentationError::TaskJoin {
                            stage: "preprocessing",
                            source,
                        }),
                    };
                    Some(result)
                }
            }))
            .buffered(num_workers);

            while let Some(item) = prepared.next().await {
                let Some(item) = item else { break };
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!("Preprocessing consumer went away");
                    break;
                }
                if failed {
                    break;
                }
            }

            // Let workers already started finish so their spills are dropped here
            stopped.store(true, Ordering::SeqCst);
            while prepared.next().await.is_some() {}
        });

        Self {
            inner: ReceiverStream::new(rx),
            producer,
        }
    }

    /// Stop reading ahead, wait for running workers and discard every
    /// prepared case that was not consumed.
    pub async fn shutdown(&mut self) {
        self.inner.close();
        while self.inner.next().await.is_some() {}
        if let Err(e) = (&mut self.producer).await {
            if !e.is_cancelled() {
                debug!("Preprocessing producer ended abnormally: {}", e);
            }
        }
    }
}

impl Stream for PreprocessingStream {
    type Item = Result<PreprocessedCase>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for PreprocessingStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
