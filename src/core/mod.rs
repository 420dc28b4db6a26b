pub mod engine;
pub mod tabular_pipeline;
pub mod voxel_pipeline;

pub use crate::domain::ports::{ConfigProvider, Pipeline, Storage};
pub use crate::utils::error::Result;
pub use engine::HarmonizeEngine;
pub use tabular_pipeline::TabularPipeline;
pub use voxel_pipeline::VoxelPipeline;

use crate::adapters::storage::LocalStorage;
use crate::combat::model::HarmonizationModel;
use crate::config::job::{HarmonizationJob, REPORT_FILE_NAME};
use crate::domain::model::{CovariateTable, HarmonizationReport};
use crate::utils::error::HarmonizeError;
use crate::utils::validation::Validate;
use chrono::{DateTime, Utc};

/// 驗證設定後依模式選擇流程並執行；輸出寫到 `output_path`，
/// 未指定時寫到輸入資料所在的目錄
pub async fn run_job<C: ConfigProvider>(config: &C) -> Result<HarmonizationReport> {
    let job = config.job()?;
    job.validate()?;
    tracing::info!("🧠 Running {} harmonization", job.mode());

    let output_dir = config
        .output_path()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| job.default_output_dir());
    tracing::info!("📂 Output directory: {}", output_dir.display());
    let storage = LocalStorage::new(output_dir);
    let monitor = config.monitoring_enabled();

    match job {
        HarmonizationJob::Tabular(job) => {
            let pipeline = TabularPipeline::new(storage, job);
            HarmonizeEngine::new_with_monitoring(pipeline, monitor).run().await
        }
        HarmonizationJob::Voxelwise(job) => {
            let pipeline = VoxelPipeline::new(storage, job);
            HarmonizeEngine::new_with_monitoring(pipeline, monitor).run().await
        }
    }
}

pub(crate) struct ReportInput<'a> {
    pub mode: &'static str,
    pub started_at: DateTime<Utc>,
    pub covariates: &'a CovariateTable,
    pub model: &'a HarmonizationModel,
    pub mask_voxels: Option<usize>,
    pub outputs: Vec<String>,
}

pub(crate) fn build_report(input: ReportInput<'_>) -> HarmonizationReport {
    let options = &input.model.options;
    HarmonizationReport {
        mode: input.mode.to_string(),
        started_at: input.started_at,
        finished_at: Utc::now(),
        subjects: input.covariates.len(),
        features: input.model.n_features(),
        constant_features: input.model.n_constant_features(),
        batch_col: input.covariates.batch_col.clone(),
        categorical_cols: input
            .covariates
            .categorical
            .iter()
            .map(|c| c.name.clone())
            .collect(),
        continuous_cols: input
            .covariates
            .continuous
            .iter()
            .map(|c| c.name.clone())
            .collect(),
        empirical_bayes: options.empirical_bayes,
        parametric: options.parametric,
        mean_only: options.mean_only,
        reference_batch: options.reference_batch.clone(),
        batches: input.model.batch_summaries(),
        mask_voxels: input.mask_voxels,
        outputs: input.outputs,
    }
}

/// 寫出報告；回傳的 outputs 另外附上報告本身的路徑
pub(crate) async fn write_report<S: Storage>(
    storage: &S,
    mut report: HarmonizationReport,
) -> Result<HarmonizationReport> {
    let json = serde_json::to_vec_pretty(&report)?;
    let report_path = storage.write_file(REPORT_FILE_NAME, &json).await?;
    tracing::debug!("Report written to {}", report_path.display());
    report.outputs.push(report_path.display().to_string());
    Ok(report)
}

/// 背景執行緒的 panic 轉成一般錯誤
pub(crate) fn join_error(e: tokio::task::JoinError) -> HarmonizeError {
    HarmonizeError::ProcessingError {
        message: format!("background task failed: {}", e),
    }
}
