pub mod aggregate;
pub mod config;
pub mod discovery;
pub mod ensemble;
pub mod error;
pub mod export;
pub mod memory_guard;
pub mod metrics;
pub mod onnx;
pub mod pipeline;
pub mod plan;
pub mod preprocessing;
pub mod volume;

// Re-export commonly used types for easier testing
pub use crate::aggregate::{mean_over_folds, AxisRemapper};
pub use crate::config::{Config, ImgSize};
pub use crate::discovery::{Case, CaseDiscovery, ResumeFilter};
pub use crate::ensemble::{EnsembleArena, EnsembleLoader, EnsemblePredictor, FoldMember, PatchNetwork, SlidingWindowConfig};
pub use crate::error::{Result, SegmentationError};
pub use crate::export::{ExportScheduler, PendingExport};
pub use crate::memory_guard::{ArrayHandle, ExportHandle, MemoryGuard, SpillFile};
pub use crate::onnx::{OnnxEnsembleLoader, OnnxNetwork};
pub use crate::pipeline::{CohortSummary, RunSummary, SegmentationPipeline};
pub use crate::plan::{ExportParams, Plan};
pub use crate::preprocessing::{CaseProperties, PreprocessedCase, PreprocessingStream, Preprocessor, StandardPreprocessor};
pub use crate::volume::{BincodeVolumeIo, LabelMap, ScanVolume, VolumeIo};
