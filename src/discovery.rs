//! Case discovery and resume filtering
//!
//! Input files are named `<case_id>_<dddd><ext>`, one per modality. Cases are
//! returned in case-identifier order so every run walks them identically.

use crate::error::{Result, SegmentationError};
use crate::metrics::{CASES_DISCOVERED, CASES_SKIPPED};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Width of `_dddd`.
pub const MODALITY_SUFFIX_LEN: usize = 5;

pub const PROBABILITY_SUFFIX: &str = ".prob";
pub const SPILL_SUFFIX: &str = ".spill";
pub const INPUT_SPILL_SUFFIX: &str = ".input.spill";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub case_id: String,
    /// One path per modality, ordered by modality index.
    pub input_paths: Vec<PathBuf>,
    pub output_path: PathBuf,
}

impl Case {
    /// `<output_dir>/<case_id><suffix>`
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        self.output_path
            .with_file_name(format!("{}{}", self.case_id, suffix))
    }

    pub fn probability_path(&self) -> PathBuf {
        self.sibling(PROBABILITY_SUFFIX)
    }
}

pub struct CaseDiscovery {
    input_dir: PathBuf,
    output_dir: PathBuf,
    extension: String,
    expected_modalities: usize,
}

impl CaseDiscovery {
    pub fn new(
        input_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        extension: &str,
        expected_modalities: usize,
    ) -> Self {
        Self {
            input_dir: input_dir.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            extension: extension.to_string(),
            expected_modalities,
        }
    }

    /// Sorted names of regular, non-hidden files carrying the volume extension.
    pub fn list_volume_files(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.input_dir).map_err(|e| SegmentationError::io(&self.input_dir, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SegmentationError::io(&self.input_dir, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| SegmentationError::io(entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(&self.extension) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn discover(&self) -> Result<Vec<Case>> {
        let files = self.list_volume_files()?;
        let pattern = Regex::new(&format!(
            r"^(?P<case>.+)_(?P<modality>\d{{4}}){}$",
            regex::escape(&self.extension)
        ))
        .map_err(|e| SegmentationError::Config(format!("bad extension pattern: {}", e)))?;

        let mut case_ids = BTreeSet::new();
        for name in &files {
            match pattern.captures(name) {
                Some(caps) => {
                    case_ids.insert(caps["case"].to_string());
                }
                None => warn!(file = %name, "Ignoring volume without a modality suffix"),
            }
        }

        let suffix_len = MODALITY_SUFFIX_LEN + self.extension.len();
        let mut cases = Vec::with_capacity(case_ids.len());
        for case_id in case_ids {
            // Exact length match keeps `case1` from claiming `case10_0000`
            let modality_files: Vec<&String> = files
                .iter()
                .filter(|name| name.starts_with(&case_id) && name.len() == case_id.len() + suffix_len)
                .collect();

            let expected_names: Vec<String> = (0..self.expected_modalities)
                .map(|i| format!("{}_{:04}{}", case_id, i, self.extension))
                .collect();
            let complete = modality_files.len() == self.expected_modalities
                && expected_names
                    .iter()
                    .zip(modality_files.iter())
                    .all(|(expected, found)| expected == *found);
            if !complete {
                return Err(SegmentationError::DiscoveryMismatch {
                    case_id,
                    expected: self.expected_modalities,
                    found: modality_files.len(),
                });
            }

            cases.push(Case {
                input_paths: modality_files
                    .iter()
                    .map(|name| self.input_dir.join(name.as_str()))
                    .collect(),
                output_path: self
                    .output_dir
                    .join(format!("{}{}", case_id, self.extension)),
                case_id,
            });
        }

        CASES_DISCOVERED.inc_by(cases.len() as u64);
        info!(
            input_dir = %self.input_dir.display(),
            cases = cases.len(),
            modalities = self.expected_modalities,
            "Discovered cases"
        );
        Ok(cases)
    }
}

/// Drops cases whose outputs already exist.
#[derive(Debug, Clone, Copy)]
pub struct ResumeFilter {
    overwrite_existing: bool,
    require_probabilities: bool,
}

impl ResumeFilter {
    pub fn new(overwrite_existing: bool, require_probabilities: bool) -> Self {
        Self {
            overwrite_existing,
            require_probabilities,
        }
    }

    pub fn is_done(&self, case: &Case) -> bool {
        case.output_path.is_file()
            && (!self.require_probabilities || case.probability_path().is_file())
    }

    pub fn apply(&self, cases: Vec<Case>) -> Vec<Case> {
        if self.overwrite_existing {
            return cases;
        }

        info!("number of cases: {}", cases.len());
        let total = cases.len();
        let pending: Vec<Case> = cases.into_iter().filter(|case| !self.is_done(case)).collect();
        CASES_SKIPPED.inc_by((total - pending.len()) as u64);
        info!(
            "number of cases that still need to be predicted: {}",
            pending.len()
        );
        pending
    }
}
