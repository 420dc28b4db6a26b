use crate::combat::model::{ComBat, HarmonizationModel};
use crate::config::job::{Alignment, TabularJob};
use crate::core::{build_report, join_error, write_report, ReportInput};
use crate::domain::model::{preview, CovariateTable, HarmonizationReport, MeasurementTable};
use crate::domain::ports::{Pipeline, Storage};
use crate::io::table::{read_covariates, read_measurements, write_measurements};
use crate::utils::error::{HarmonizeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Measurements and covariates whose rows refer to the same subjects.
#[derive(Debug, Clone)]
pub struct AlignedTables {
    pub started_at: DateTime<Utc>,
    pub measurements: MeasurementTable,
    pub covariates: CovariateTable,
}

#[derive(Debug, Clone)]
pub struct TabularResult {
    pub started_at: DateTime<Utc>,
    pub harmonized: MeasurementTable,
    pub covariates: CovariateTable,
    pub model: HarmonizationModel,
}

/// 區域量測表 (受試者 × 特徵) 的 ComBat 流程
pub struct TabularPipeline<S: Storage> {
    storage: S,
    job: TabularJob,
}

impl<S: Storage> TabularPipeline<S> {
    pub fn new(storage: S, job: TabularJob) -> Self {
        Self { storage, job }
    }
}

/// Pairs measurement rows with covariate rows according to `job`.
/// Row counts must agree once alignment is done; nothing is fitted otherwise.
pub fn align_tables(
    measurements: MeasurementTable,
    covariates: CovariateTable,
    job: &TabularJob,
) -> Result<(MeasurementTable, CovariateTable)> {
    match job.covariates.alignment {
        Alignment::Order => {
            if measurements.n_subjects() != covariates.len() {
                return Err(HarmonizeError::CountMismatchError {
                    source_kind: "measurement rows".to_string(),
                    measurements: measurements.n_subjects(),
                    covariates: covariates.len(),
                });
            }
            let differing: Vec<String> = measurements
                .subject_ids
                .iter()
                .zip(&covariates.subject_ids)
                .filter(|(m, c)| m != c)
                .map(|(m, c)| format!("{}≠{}", m, c))
                .collect();
            if !differing.is_empty() {
                tracing::warn!(
                    "⚠️ {} row(s) have different subject ids in measurements and covariates ({}); rows are matched by position",
                    differing.len(),
                    preview(&differing)
                );
            }
            Ok((measurements, covariates))
        }
        Alignment::Id => {
            let measurements = if job.filter_to_covariates {
                let keep: Vec<usize> = (0..measurements.n_subjects())
                    .filter(|&i| covariates.contains_id(&measurements.subject_ids[i]))
                    .collect();
                let dropped = measurements.n_subjects() - keep.len();
                if dropped > 0 {
                    tracing::info!(
                        "Dropping {} measurement row(s) without covariates",
                        dropped
                    );
                }
                measurements.select(&keep)?
            } else {
                measurements
            };
            let covariates = covariates.aligned_to(&measurements.subject_ids)?;
            Ok((measurements, covariates))
        }
    }
}

#[async_trait]
impl<S: Storage> Pipeline for TabularPipeline<S> {
    type Extracted = AlignedTables;
    type Transformed = TabularResult;

    fn name(&self) -> &'static str {
        "tabular"
    }

    async fn extract(&self) -> Result<AlignedTables> {
        let started_at = Utc::now();
        let job = self.job.clone();

        let (measurements, covariates) = tokio::task::spawn_blocking(move || {
            let covariates = read_covariates(
                &job.covariates.path,
                &job.covariates.columns,
                job.covariates.delimiter,
            )?;
            let measurements = read_measurements(
                &job.measurements,
                &job.covariates.columns.index_col,
                job.measurement_delimiter,
            )?;
            tracing::info!(
                "📄 {} subjects x {} features, {} covariate rows",
                measurements.n_subjects(),
                measurements.n_features(),
                covariates.len()
            );
            align_tables(measurements, covariates, &job)
        })
        .await
        .map_err(join_error)??;

        for (label, count) in covariates.batch_counts() {
            tracing::debug!("Batch {}: {} subjects", label, count);
        }

        Ok(AlignedTables {
            started_at,
            measurements,
            covariates,
        })
    }

    async fn transform(&self, data: AlignedTables) -> Result<TabularResult> {
        let combat = ComBat::new(self.job.combat.clone());

        tokio::task::spawn_blocking(move || {
            let outcome = combat.fit(&data.measurements.values, &data.covariates)?;
            if outcome.model.n_constant_features() > 0 {
                tracing::warn!(
                    "⚠️ {} feature(s) have zero variance and were left unchanged",
                    outcome.model.n_constant_features()
                );
            }
            Ok::<_, HarmonizeError>(TabularResult {
                started_at: data.started_at,
                harmonized: data.measurements.with_values(outcome.adjusted),
                covariates: data.covariates,
                model: outcome.model,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn load(&self, result: TabularResult) -> Result<HarmonizationReport> {
        let extra = self.job.include_covariates.then_some(&result.covariates);
        let bytes = write_measurements(&result.harmonized, extra)?;

        let file_name = self.job.output_file_name();
        let output = self.storage.write_file(&file_name, &bytes).await?;
        tracing::info!("📁 Harmonized table saved to: {}", output.display());

        let report = build_report(ReportInput {
            mode: self.name(),
            started_at: result.started_at,
            covariates: &result.covariates,
            model: &result.model,
            mask_voxels: None,
            outputs: vec![output.display().to_string()],
        });
        write_report(&self.storage, report).await
    }
}
