use anyhow::Result;
use faz_segmentation::{metrics, BincodeVolumeIo, Config, OnnxEnsembleLoader, SegmentationPipeline};
use std::sync::Arc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    // ONNX Runtime logs every session it builds
                    .add_directive("ort=warn".parse().expect("static directive"))
            }),
        )
        .init();

    tracing::info!("Starting FAZ segmentation run...");

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        base_dir = %config.base_dir.display(),
        model_dir = %config.model_dir.display(),
        img_size = config.img_size.variant_dir(),
        folds = ?config.folds,
        pool_num = config.pool_num,
        "Configuration loaded"
    );

    let loader = Arc::new(OnnxEnsembleLoader::new(config.ort_intra_threads));
    let pipeline = SegmentationPipeline::new(config, loader, Arc::new(BincodeVolumeIo))?;
    let summary = pipeline.run().await?;

    for cohort in &summary.cohorts {
        tracing::info!(
            cohort = %cohort.cohort,
            discovered = cohort.discovered,
            skipped = cohort.skipped,
            predicted = cohort.predicted,
            spilled = cohort.spilled,
            "Cohort summary"
        );
    }
    tracing::info!(
        predicted = summary.total_predicted(),
        ensemble_loaded = summary.ensemble_loaded,
        finished_at = %summary.finished_at.to_rfc3339(),
        "Done"
    );
    tracing::debug!("Metrics:\n{}", metrics::export_metrics());

    Ok(())
}
