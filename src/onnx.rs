//! ONNX Runtime backend for the fold ensemble
//!
//! Each fold is exported as `fold_<k>/model_best.onnx`. The network keeps at
//! most one session alive; loading a fold replaces it.

use crate::ensemble::{checkpoint_members, EnsembleLoader, FoldMember, PatchNetwork};
use anyhow::{anyhow, Context};
use ndarray::{Array5, ArrayView5, IxDyn};
use ort::session::{Session, SessionInputs};
use ort::value::TensorRef;
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_CHECKPOINT: &str = "model_best";

pub struct OnnxNetwork {
    session: Option<Session>,
    input_name: String,
    output_name: String,
    intra_threads: usize,
}

impl OnnxNetwork {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            session: None,
            input_name: String::new(),
            output_name: String::new(),
            intra_threads: intra_threads.max(1),
        }
    }
}

impl PatchNetwork for OnnxNetwork {
    fn load_weights(&mut self, member: &FoldMember) -> anyhow::Result<()> {
        let session = Session::builder()
            .map_err(|e| anyhow!("creating session builder: {}", e))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| anyhow!("setting intra-op threads: {}", e))?
            .commit_from_file(&member.checkpoint)
            .map_err(|e| anyhow!("loading {}: {}", member.checkpoint.display(), e))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| anyhow!("{} declares no inputs", member.checkpoint.display()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| anyhow!("{} declares no outputs", member.checkpoint.display()))?;

        debug!(
            fold = member.fold,
            input = %input_name,
            output = %output_name,
            "ONNX session ready"
        );
        self.session = Some(session);
        self.input_name = input_name;
        self.output_name = output_name;
        Ok(())
    }

    fn release_weights(&mut self) {
        self.session = None;
    }

    fn forward(&mut self, patch: ArrayView5<f32>) -> anyhow::Result<Array5<f32>> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("forward called without loaded weights"))?;

        let contiguous = patch.as_standard_layout();
        let dims: Vec<i64> = contiguous.shape().iter().map(|&d| d as i64).collect();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| anyhow!("patch is not contiguous in memory"))?;
        let tensor = TensorRef::from_array_view((dims, data))
            .map_err(|e| anyhow!("building input tensor: {}", e))?;

        let inputs: SessionInputs<'_, '_, 0> =
            SessionInputs::ValueMap(vec![(Cow::Borrowed(self.input_name.as_str()), tensor.into())]);
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("forward pass failed: {}", e))?;

        let (shape, values) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("extracting output {}: {}", self.output_name, e))?;
        let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if shape.len() != 5 {
            return Err(anyhow!("expected 5-d logits, got shape {:?}", shape));
        }

        let logits = ndarray::ArrayD::from_shape_vec(IxDyn(&shape), values.to_vec())
            .context("reshaping logits")?;
        logits
            .into_dimensionality()
            .context("converting logits to 5-d")
    }
}

/// Resolves fold checkpoints and hands out a single `OnnxNetwork`.
#[derive(Debug, Clone)]
pub struct OnnxEnsembleLoader {
    checkpoint_name: String,
    intra_threads: usize,
}

impl OnnxEnsembleLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            checkpoint_name: DEFAULT_CHECKPOINT.to_string(),
            intra_threads,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_name: impl Into<String>) -> Self {
        self.checkpoint_name = checkpoint_name.into();
        self
    }

    pub fn checkpoint_file(&self) -> String {
        format!("{}.onnx", self.checkpoint_name)
    }
}

impl EnsembleLoader for OnnxEnsembleLoader {
    fn load(
        &self,
        model_path: &Path,
        folds: &[u8],
    ) -> anyhow::Result<(Box<dyn PatchNetwork>, Vec<FoldMember>)> {
        let members = checkpoint_members(model_path, folds, &self.checkpoint_file())?;
        info!(
            model_path = %model_path.display(),
            folds = ?folds,
            checkpoint = %self.checkpoint_file(),
            "Resolved ONNX fold checkpoints"
        );
        Ok((Box::new(OnnxNetwork::new(self.intra_threads)), members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;

    #[test]
    fn test_forward_without_weights_fails() {
        let mut network = OnnxNetwork::new(1);
        let patch = Array5::<f32>::zeros((1, 1, 1, 2, 2));
        assert!(network.forward(patch.view()).is_err());
    }

    #[test]
    fn test_loader_reports_missing_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let loader = OnnxEnsembleLoader::new(1);
        let err = loader.load(dir.path(), &[0]).err().unwrap();
        assert!(err.to_string().contains("fold 0"));
    }

    #[test]
    fn test_loader_resolves_custom_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let fold_dir = dir.path().join("fold_3");
        std::fs::create_dir_all(&fold_dir).unwrap();
        std::fs::write(fold_dir.join("model_final_checkpoint.onnx"), b"onnx").unwrap();

        let loader = OnnxEnsembleLoader::new(2).with_checkpoint("model_final_checkpoint");
        let (_, members) = loader.load(dir.path(), &[3]).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].checkpoint, fold_dir.join("model_final_checkpoint.onnx"));
    }
}
