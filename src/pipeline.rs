//! Cohort-by-cohort orchestration of a segmentation run
//!
//! discovery -> resume filter -> preprocessing stream -> ensemble ->
//! axis remap -> memory guard -> export pool. The ensemble is brought up
//! lazily, at most once per run, and shared by every cohort.

use crate::aggregate::AxisRemapper;
use crate::config::Config;
use crate::discovery::{CaseDiscovery, ResumeFilter, SPILL_SUFFIX};
use crate::ensemble::{EnsembleArena, EnsembleLoader, EnsemblePredictor, SlidingWindowConfig};
use crate::error::{Result, SegmentationError};
use crate::export::{ExportScheduler, PendingExport};
use crate::memory_guard::MemoryGuard;
use crate::metrics::{CASES_PREDICTED, ENSEMBLE_LOADS, PIPELINE_ERRORS};
use crate::plan::Plan;
use crate::preprocessing::{PreprocessedCase, PreprocessingStream, Preprocessor, StandardPreprocessor};
use crate::volume::VolumeIo;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CohortSummary {
    pub cohort: String,
    pub discovered: usize,
    pub skipped: usize,
    pub predicted: usize,
    pub spilled: usize,
    /// Label maps written for this cohort, in completion order.
    pub output_files: Vec<PathBuf>,
}

impl CohortSummary {
    fn new(cohort: &str) -> Self {
        Self {
            cohort: cohort.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ensemble_loaded: bool,
    pub cohorts: Vec<CohortSummary>,
}

impl RunSummary {
    pub fn total_predicted(&self) -> usize {
        self.cohorts.iter().map(|c| c.predicted).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.cohorts.iter().map(|c| c.skipped).sum()
    }

    pub fn output_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.cohorts.iter().flat_map(|c| c.output_files.iter())
    }
}

/// Per-run settings shared by every case of a cohort.
#[derive(Clone, Copy)]
struct CaseSettings {
    remapper: AxisRemapper,
    guard: MemoryGuard,
    save_probabilities: bool,
}

pub struct SegmentationPipeline {
    config: Config,
    loader: Arc<dyn EnsembleLoader>,
    io: Arc<dyn VolumeIo>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    guard: MemoryGuard,
}

impl SegmentationPipeline {
    pub fn new(
        config: Config,
        loader: Arc<dyn EnsembleLoader>,
        io: Arc<dyn VolumeIo>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SegmentationError::Config(e.to_string()))?;
        Ok(Self {
            config,
            loader,
            io,
            preprocessor: None,
            guard: MemoryGuard::default(),
        })
    }

    pub fn with_memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Replace the built-in preprocessing transform.
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        match self.run_cohorts().await {
            Ok((cohorts, ensemble_loaded)) => {
                let summary = RunSummary {
                    started_at,
                    finished_at: Utc::now(),
                    ensemble_loaded,
                    cohorts,
                };
                info!(
                    predicted = summary.total_predicted(),
                    skipped = summary.total_skipped(),
                    elapsed_ms = (summary.finished_at - started_at).num_milliseconds(),
                    "Segmentation run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                PIPELINE_ERRORS.with_label_values(&[e.kind()]).inc();
                error!(kind = e.kind(), "Segmentation run failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_cohorts(&self) -> Result<(Vec<CohortSummary>, bool)> {
        let model_path = self.config.model_path();
        let plan = Plan::load(&model_path)?;
        info!(
            model_path = %model_path.display(),
            modalities = plan.num_modalities,
            classes = plan.num_classes,
            patch_size = ?plan.patch_size,
            "Loaded ensemble plan"
        );

        let preprocessor = match &self.preprocessor {
            Some(preprocessor) => preprocessor.clone(),
            None => Arc::new(StandardPreprocessor::new(
                self.io.clone(),
                plan.transpose_forward,
            )),
        };

        let mut predictor = None;
        let mut cohorts = Vec::with_capacity(self.config.cohorts.len());
        for cohort in &self.config.cohorts {
            let summary = self
                .segment_cohort(cohort, &plan, &preprocessor, &mut predictor)
                .await?;
            cohorts.push(summary);
        }
        Ok((cohorts, predictor.is_some()))
    }

    fn load_predictor(&self, plan: &Plan) -> Result<EnsemblePredictor> {
        let model_path = self.config.model_path();
        let (network, members) = self
            .loader
            .load(&model_path, &self.config.folds)
            .map_err(|source| SegmentationError::ModelLoad {
                path: model_path.clone(),
                source,
            })?;
        let arena = EnsembleArena::new(network, members)?;
        let window = SlidingWindowConfig::from_plan(
            plan,
            self.config.step_size,
            self.config.use_gaussian,
            self.config.do_mirroring,
        );
        let mut predictor = EnsemblePredictor::new(arena, window);
        predictor.clear_cache();

        ENSEMBLE_LOADS.inc();
        info!(
            model_path = %model_path.display(),
            folds = ?self.config.folds,
            "Ensemble ready"
        );
        Ok(predictor)
    }

    async fn segment_cohort(
        &self,
        cohort: &str,
        plan: &Plan,
        preprocessor: &Arc<dyn Preprocessor>,
        predictor: &mut Option<EnsemblePredictor>,
    ) -> Result<CohortSummary> {
        let mut summary = CohortSummary::new(cohort);
        let (input_dir, output_dir) = self.config.cohort_dirs(cohort);
        if !input_dir.is_dir() {
            info!(cohort, input_dir = %input_dir.display(), "Skipping cohort without input directory");
            return Ok(summary);
        }

        let discovery = CaseDiscovery::new(
            &input_dir,
            &output_dir,
            &self.config.file_extension,
            plan.num_modalities,
        );
        if discovery.list_volume_files()?.is_empty() {
            info!(cohort, input_dir = %input_dir.display(), "Skipping cohort without input volumes");
            return Ok(summary);
        }

        let cases = discovery.discover()?;
        summary.discovered = cases.len();
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| SegmentationError::io(&output_dir, e))?;

        let pending = ResumeFilter::new(
            self.config.overwrite_existing,
            self.config.save_probabilities,
        )
        .apply(cases);
        summary.skipped = summary.discovered - pending.len();
        if pending.is_empty() {
            return Ok(summary);
        }

        if predictor.is_none() {
            *predictor = Some(self.load_predictor(plan)?);
        }

        let settings = CaseSettings {
            remapper: AxisRemapper::from_plan(plan),
            guard: self.guard,
            save_probabilities: self.config.save_probabilities,
        };
        let mut scheduler = ExportScheduler::new(self.config.pool_num, self.io.clone());
        let mut stream = PreprocessingStream::spawn(
            pending,
            preprocessor.clone(),
            self.guard,
            self.config.preprocessing_workers,
        );

        let predicted = self
            .predict_stream(&mut stream, plan, settings, predictor, &mut scheduler, &mut summary)
            .await;
        if predicted.is_err() {
            // Prepared cases nobody will predict drop their input spills here
            stream.shutdown().await;
        }
        drop(stream);

        match predicted {
            Ok(()) => {
                summary.output_files = scheduler.drain().await?;
                info!(
                    cohort,
                    predicted = summary.predicted,
                    written = summary.output_files.len(),
                    "Cohort finished"
                );
                Ok(summary)
            }
            Err(e) => {
                // Exports already submitted still finish before the error is reported
                if let Err(drain_error) = scheduler.drain().await {
                    warn!(cohort, "Export failed while aborting: {}", drain_error);
                }
                Err(e)
            }
        }
    }

    async fn predict_stream(
        &self,
        stream: &mut PreprocessingStream,
        plan: &Plan,
        settings: CaseSettings,
        predictor: &mut Option<EnsemblePredictor>,
        scheduler: &mut ExportScheduler,
        summary: &mut CohortSummary,
    ) -> Result<()> {
        let export_params = plan.export_params();

        while let Some(prepared) = stream.next().await {
            let prepared = prepared?;
            let mut current = predictor
                .take()
                .ok_or_else(|| SegmentationError::Config("ensemble is not loaded".to_string()))?;

            // The predictor travels to the blocking thread and back with each case
            let (current, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = predict_case(&mut current, prepared, settings);
                (current, outcome)
            })
            .await
            .map_err(|source| SegmentationError::TaskJoin {
                stage: "inference",
                source,
            })?;
            *predictor = Some(current);

            let (mut task, spilled) = outcome?;
            task.export_params = export_params;
            task.region_class_order = plan.regions_class_order.clone();

            CASES_PREDICTED.inc();
            summary.predicted += 1;
            if spilled {
                summary.spilled += 1;
            }
            scheduler.submit(task).await?;
        }
        Ok(())
    }
}

fn predict_case(
    predictor: &mut EnsemblePredictor,
    prepared: PreprocessedCase,
    settings: CaseSettings,
) -> Result<(PendingExport, bool)> {
    let PreprocessedCase {
        case,
        data,
        properties,
    } = prepared;

    let input = data.resolve()?;
    let probabilities = predictor.predict(&case.case_id, input.view())?;
    drop(input);

    let probabilities = settings.remapper.remap(probabilities);
    let handle = settings
        .guard
        .guard(probabilities, case.sibling(SPILL_SUFFIX))?;
    let spilled = handle.is_spilled();

    let task = PendingExport {
        probability_path: settings.save_probabilities.then(|| case.probability_path()),
        case_id: case.case_id,
        handle,
        output_path: case.output_path,
        properties,
        export_params: Default::default(),
        region_class_order: None,
    };
    Ok((task, spilled))
}
