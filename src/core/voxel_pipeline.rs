use crate::combat::model::{ComBat, HarmonizationModel};
use crate::config::job::{Alignment, VoxelJob};
use crate::core::{build_report, join_error, write_report, ReportInput};
use crate::domain::model::{preview, CovariateTable, HarmonizationReport, ImageEntry};
use crate::domain::ports::{Pipeline, Storage};
use crate::io::discovery::{adjusted_name, discover_images};
use crate::io::mask::{BrainMask, MASK_FILE_NAME};
use crate::io::nifti::{is_gzip_path, DataType, NiftiImage};
use crate::io::table::read_covariates;
use crate::utils::error::{HarmonizeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct VoxelInput {
    pub started_at: DateTime<Utc>,
    pub images: Vec<ImageEntry>,
    pub covariates: CovariateTable,
}

/// The fitted model together with the mask it was fitted in.
#[derive(Debug, Clone)]
pub struct VoxelModel {
    pub started_at: DateTime<Utc>,
    pub images: Vec<ImageEntry>,
    pub covariates: Arc<CovariateTable>,
    pub mask: Arc<BrainMask>,
    pub model: Arc<HarmonizationModel>,
}

/// 每位受試者一個 3D NIfTI 的體素層級 ComBat 流程
pub struct VoxelPipeline<S: Storage> {
    storage: S,
    job: VoxelJob,
}

impl<S: Storage> VoxelPipeline<S> {
    pub fn new(storage: S, job: VoxelJob) -> Self {
        Self { storage, job }
    }
}

/// Pairs images with covariate rows. In `order` mode the counts must match
/// and the i-th image belongs to the i-th row.
pub fn align_images(
    images: &[ImageEntry],
    covariates: CovariateTable,
    alignment: Alignment,
) -> Result<CovariateTable> {
    if images.is_empty() {
        return Err(HarmonizeError::ValidationError {
            message: "no images matched the prefix and suffix".to_string(),
        });
    }

    match alignment {
        Alignment::Order => {
            if images.len() != covariates.len() {
                return Err(HarmonizeError::CountMismatchError {
                    source_kind: "nifti images".to_string(),
                    measurements: images.len(),
                    covariates: covariates.len(),
                });
            }
            let differing: Vec<String> = images
                .iter()
                .zip(&covariates.subject_ids)
                .filter_map(|(image, id)| match &image.subject_id {
                    Some(sid) if sid != id => Some(format!("{}≠{}", image.file_name, id)),
                    _ => None,
                })
                .collect();
            if !differing.is_empty() {
                tracing::warn!(
                    "⚠️ {} image(s) do not match the subject id of their covariate row ({}); images are matched by sort order",
                    differing.len(),
                    preview(&differing)
                );
            }
            Ok(covariates)
        }
        Alignment::Id => {
            let ids = images
                .iter()
                .map(|image| {
                    image.subject_id.clone().ok_or_else(|| {
                        HarmonizeError::SubjectMismatchError {
                            message: format!("no subject id in file name '{}'", image.file_name),
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            covariates.aligned_to(&ids)
        }
    }
}

fn image_paths(images: &[ImageEntry]) -> Vec<PathBuf> {
    images.iter().map(|e| e.path.clone()).collect()
}

/// Harmonizes one image inside the mask and returns the encoded output.
fn harmonize_image(
    path: &Path,
    row: usize,
    covariates: &CovariateTable,
    mask: &BrainMask,
    model: &HarmonizationModel,
    gzip: bool,
) -> Result<Vec<u8>> {
    let image = NiftiImage::read(path)?;
    let values = mask.flatten(&image, path)?;
    let adjusted = model.apply_sample(&values, &covariates.row(row))?;
    mask.unflatten(&adjusted, &image)?.encode(DataType::F32, gzip)
}

#[async_trait]
impl<S: Storage> Pipeline for VoxelPipeline<S> {
    type Extracted = VoxelInput;
    type Transformed = VoxelModel;

    fn name(&self) -> &'static str {
        "voxelwise"
    }

    async fn extract(&self) -> Result<VoxelInput> {
        let started_at = Utc::now();
        let job = self.job.clone();

        let (images, covariates) = tokio::task::spawn_blocking(move || {
            let images = discover_images(&job.image_dir, &job.prefix, &job.suffix)?;
            let covariates = read_covariates(
                &job.covariates.path,
                &job.covariates.columns,
                job.covariates.delimiter,
            )?;
            tracing::info!(
                "🧠 {} NIfTI files to be processed, {} covariate rows",
                images.len(),
                covariates.len()
            );
            let covariates = align_images(&images, covariates, job.covariates.alignment)?;
            Ok::<_, HarmonizeError>((images, covariates))
        })
        .await
        .map_err(join_error)??;

        Ok(VoxelInput {
            started_at,
            images,
            covariates,
        })
    }

    async fn transform(&self, data: VoxelInput) -> Result<VoxelModel> {
        let combat = ComBat::new(self.job.combat.clone());
        let threshold = self.job.mask_threshold;

        tokio::task::spawn_blocking(move || {
            let paths = image_paths(&data.images);
            let mask = BrainMask::create(&paths, threshold)?;
            let flat = mask.flatten_all(&paths)?;
            let model = combat.learn(&flat, &data.covariates)?;
            if model.n_constant_features() > 0 {
                tracing::warn!(
                    "⚠️ {} masked voxel(s) have zero variance and were left unchanged",
                    model.n_constant_features()
                );
            }
            Ok::<_, HarmonizeError>(VoxelModel {
                started_at: data.started_at,
                images: data.images,
                covariates: Arc::new(data.covariates),
                mask: Arc::new(mask),
                model: Arc::new(model),
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn load(&self, result: VoxelModel) -> Result<HarmonizationReport> {
        let mut outputs = Vec::with_capacity(result.images.len() + 1);

        let mask_bytes = result.mask.image().encode(DataType::U8, true)?;
        let mask_path = self.storage.write_file(MASK_FILE_NAME, &mask_bytes).await?;
        tracing::info!("🎭 Mask saved to: {}", mask_path.display());
        outputs.push(mask_path.display().to_string());

        // 逐一套用模型，避免同時把所有影像放進記憶體
        for (row, entry) in result.images.iter().enumerate() {
            let out_name = adjusted_name(&entry.file_name);
            let gzip = is_gzip_path(Path::new(&out_name));
            let path = entry.path.clone();
            let covariates = Arc::clone(&result.covariates);
            let mask = Arc::clone(&result.mask);
            let model = Arc::clone(&result.model);

            let bytes = tokio::task::spawn_blocking(move || {
                harmonize_image(&path, row, &covariates, &mask, &model, gzip)
            })
            .await
            .map_err(join_error)??;

            let written = self.storage.write_file(&out_name, &bytes).await?;
            tracing::debug!("{} -> {}", entry.file_name, written.display());
            outputs.push(written.display().to_string());
        }
        tracing::info!("📁 Wrote {} harmonized images", result.images.len());

        let report = build_report(ReportInput {
            mode: self.name(),
            started_at: result.started_at,
            covariates: &result.covariates,
            model: &result.model,
            mask_voxels: Some(result.mask.n_voxels()),
            outputs,
        });
        write_report(&self.storage, report).await
    }
}
