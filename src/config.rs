use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Task directory under both the base and the model directory.
pub const TASK_NAME: &str = "FAZ_segmentation";

/// Scan field of view; selects which pretrained ensemble is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImgSize {
    /// 3x3 mm scans
    Small,
    /// 6x6 mm scans
    Large,
}

impl ImgSize {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "small" | "3" | "3x3" => Ok(ImgSize::Small),
            "large" | "6" | "6x6" => Ok(ImgSize::Large),
            other => Err(anyhow!(
                "Unknown image size '{}': expected small (3x3) or large (6x6)",
                other
            )),
        }
    }

    /// Directory holding this variant's plan and fold checkpoints.
    pub fn variant_dir(&self) -> &'static str {
        match self {
            ImgSize::Small => "3x3",
            ImgSize::Large => "6x6",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_dir: PathBuf,
    pub model_dir: PathBuf,
    pub img_size: ImgSize,
    pub folds: Vec<u8>,
    pub overwrite_existing: bool,
    pub pool_num: usize,
    pub preprocessing_workers: usize,
    pub save_probabilities: bool,
    pub cohorts: Vec<String>,
    pub file_extension: String,
    pub step_size: f32,
    pub use_gaussian: bool,
    pub do_mirroring: bool,
    pub ort_intra_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            model_dir: PathBuf::from("./models"),
            img_size: ImgSize::Small,
            folds: vec![0, 1, 2, 3, 4],
            overwrite_existing: false,
            pool_num: 2,
            preprocessing_workers: 4,
            save_probabilities: false,
            cohorts: vec!["gradable".to_string(), "outstanding".to_string()],
            file_extension: ".vol".to_string(),
            step_size: 0.5,
            use_gaussian: true,
            do_mirroring: true,
            ort_intra_threads: 1,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Config::default();

        let base_dir = env::var("FAZ_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir);

        let model_dir = env::var("FAZ_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let img_size = match env::var("FAZ_IMG_SIZE") {
            Ok(value) => ImgSize::parse(&value)?,
            Err(_) => defaults.img_size,
        };

        let folds = match env::var("FAZ_FOLDS") {
            Ok(value) => parse_folds(&value)?,
            Err(_) => defaults.folds,
        };

        let overwrite_existing = env::var("FAZ_OVERWRITE_EXISTING")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let pool_num = env::var("FAZ_POOL_NUM")
            .unwrap_or_else(|_| defaults.pool_num.to_string())
            .parse()
            .unwrap_or(defaults.pool_num);

        let preprocessing_workers = env::var("FAZ_PREPROCESSING_WORKERS")
            .unwrap_or_else(|_| defaults.preprocessing_workers.to_string())
            .parse()
            .unwrap_or(defaults.preprocessing_workers);

        let save_probabilities = env::var("FAZ_SAVE_PROBABILITIES")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let cohorts = match env::var("FAZ_COHORTS") {
            Ok(value) => parse_list(&value),
            Err(_) => defaults.cohorts,
        };

        let file_extension =
            env::var("FAZ_FILE_EXTENSION").unwrap_or(defaults.file_extension);

        let step_size = match env::var("FAZ_STEP_SIZE") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid FAZ_STEP_SIZE '{}': {}", value, e))?,
            Err(_) => defaults.step_size,
        };

        let use_gaussian = env::var("FAZ_USE_GAUSSIAN")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let do_mirroring = env::var("FAZ_DO_MIRRORING")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let ort_intra_threads = env::var("FAZ_ORT_THREADS")
            .unwrap_or_else(|_| defaults.ort_intra_threads.to_string())
            .parse()
            .unwrap_or(defaults.ort_intra_threads);

        let config = Self {
            base_dir,
            model_dir,
            img_size,
            folds,
            overwrite_existing,
            pool_num,
            preprocessing_workers,
            save_probabilities,
            cohorts,
            file_extension,
            step_size,
            use_gaussian,
            do_mirroring,
            ort_intra_threads,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_num == 0 {
            return Err(anyhow!("pool_num must be at least 1"));
        }
        if self.preprocessing_workers == 0 {
            return Err(anyhow!("preprocessing_workers must be at least 1"));
        }
        if self.folds.is_empty() {
            return Err(anyhow!("At least one fold must be selected"));
        }
        let mut seen = self.folds.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.folds.len() {
            return Err(anyhow!("Duplicate fold in {:?}", self.folds));
        }
        if !self.file_extension.starts_with('.') || self.file_extension.len() < 2 {
            return Err(anyhow!(
                "File extension '{}' must start with '.'",
                self.file_extension
            ));
        }
        if !(self.step_size > 0.0 && self.step_size <= 1.0) {
            return Err(anyhow!(
                "step_size must be in (0, 1], got {}",
                self.step_size
            ));
        }
        Ok(())
    }

    /// `<model_dir>/FAZ_segmentation/<3x3|6x6>`
    pub fn model_path(&self) -> PathBuf {
        self.model_dir
            .join(TASK_NAME)
            .join(self.img_size.variant_dir())
    }

    /// Input and output directories of one cohort.
    pub fn cohort_dirs(&self, cohort: &str) -> (PathBuf, PathBuf) {
        let cohort_dir = self.base_dir.join(TASK_NAME).join(cohort);
        (cohort_dir.join("predict_nii"), cohort_dir.join("predict_label"))
    }

    pub fn with_base_dir(mut self, base_dir: impl AsRef<Path>) -> Self {
        self.base_dir = base_dir.as_ref().to_path_buf();
        self
    }

    pub fn with_model_dir(mut self, model_dir: impl AsRef<Path>) -> Self {
        self.model_dir = model_dir.as_ref().to_path_buf();
        self
    }
}

/// Parse a comma separated fold list such as `0,1,2`.
pub fn parse_folds(value: &str) -> Result<Vec<u8>> {
    parse_list(value)
        .iter()
        .map(|fold| {
            fold.parse::<u8>()
                .map_err(|e| anyhow!("Invalid fold '{}': {}", fold, e))
        })
        .collect()
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "FAZ_BASE_DIR",
        "FAZ_MODEL_DIR",
        "FAZ_IMG_SIZE",
        "FAZ_FOLDS",
        "FAZ_POOL_NUM",
        "FAZ_OVERWRITE_EXISTING",
        "FAZ_COHORTS",
        "FAZ_STEP_SIZE",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_img_size_aliases() {
        assert_eq!(ImgSize::parse("3").unwrap(), ImgSize::Small);
        assert_eq!(ImgSize::parse("3x3").unwrap(), ImgSize::Small);
        assert_eq!(ImgSize::parse(" LARGE ").unwrap(), ImgSize::Large);
        assert_eq!(ImgSize::Large.variant_dir(), "6x6");
        assert!(ImgSize::parse("9x9").is_err());
    }

    #[test]
    fn test_parse_folds() {
        assert_eq!(parse_folds("0, 2,4").unwrap(), vec![0, 2, 4]);
        assert!(parse_folds("0,x").is_err());
        assert!(parse_folds("").unwrap().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            pool_num: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            folds: vec![1, 1],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            file_extension: "vol".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            step_size: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_directory_layout() {
        let config = Config::default()
            .with_base_dir("/data")
            .with_model_dir("/models");
        assert_eq!(
            config.model_path(),
            PathBuf::from("/models/FAZ_segmentation/3x3")
        );
        let (input, output) = config.cohort_dirs("gradable");
        assert_eq!(
            input,
            PathBuf::from("/data/FAZ_segmentation/gradable/predict_nii")
        );
        assert_eq!(
            output,
            PathBuf::from("/data/FAZ_segmentation/gradable/predict_label")
        );
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear_env();
        env::set_var("FAZ_BASE_DIR", "/srv/octa");
        env::set_var("FAZ_IMG_SIZE", "6x6");
        env::set_var("FAZ_FOLDS", "0,1");
        env::set_var("FAZ_POOL_NUM", "3");
        env::set_var("FAZ_OVERWRITE_EXISTING", "true");
        env::set_var("FAZ_COHORTS", "gradable");

        let config = Config::load().unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/octa"));
        assert_eq!(config.img_size, ImgSize::Large);
        assert_eq!(config.folds, vec![0, 1]);
        assert_eq!(config.pool_num, 3);
        assert!(config.overwrite_existing);
        assert_eq!(config.cohorts, vec!["gradable".to_string()]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_env() {
        clear_env();
        env::set_var("FAZ_STEP_SIZE", "1.5");
        assert!(Config::load().is_err());
        clear_env();

        env::set_var("FAZ_IMG_SIZE", "huge");
        assert!(Config::load().is_err());
        clear_env();
    }
}
