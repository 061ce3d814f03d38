//! Error types for the segmentation pipeline
//!
//! Every failure is fatal to a run. Collaborator traits report `anyhow::Error`,
//! which is wrapped here together with the case, fold or path it concerns.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Case {case_id} has {found} modality files, plan expects {expected}")]
    DiscoveryMismatch {
        case_id: String,
        expected: usize,
        found: usize,
    },

    #[error("Ensemble inference failed for case {case_id} on fold {fold}: {source}")]
    EnsembleFailure {
        case_id: String,
        fold: u8,
        #[source]
        source: anyhow::Error,
    },

    #[error("Export failed for {}: {source}", .path.display())]
    ExportFailure {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Preprocessing failed for case {case_id}: {source}")]
    PreprocessingFailure {
        case_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Model loading failed from {}: {source}", .path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Scratch spill failed at {}: {source}", .path.display())]
    Spill {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background {stage} task failed: {source}")]
    TaskJoin {
        stage: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl SegmentationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegmentationError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SegmentationError::DiscoveryMismatch { .. } => "discovery_mismatch",
            SegmentationError::EnsembleFailure { .. } => "ensemble_failure",
            SegmentationError::ExportFailure { .. } => "export_failure",
            SegmentationError::PreprocessingFailure { .. } => "preprocessing_failure",
            SegmentationError::ModelLoad { .. } => "model_load",
            SegmentationError::Spill { .. } => "spill",
            SegmentationError::Plan(_) => "plan",
            SegmentationError::Config(_) => "config",
            SegmentationError::InvalidVolume(_) => "invalid_volume",
            SegmentationError::Io { .. } => "io",
            SegmentationError::TaskJoin { .. } => "task_join",
        }
    }
}

pub type Result<T> = std::result::Result<T, SegmentationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = SegmentationError::DiscoveryMismatch {
            case_id: "case_007".to_string(),
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Case case_007 has 1 modality files, plan expects 2"
        );
        assert_eq!(err.kind(), "discovery_mismatch");

        let err = SegmentationError::ExportFailure {
            path: PathBuf::from("/out/case_007.vol"),
            source: anyhow::anyhow!("disk full"),
        };
        assert!(err.to_string().contains("/out/case_007.vol"));
        assert!(err.to_string().contains("disk full"));
    }
}
