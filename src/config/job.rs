use crate::combat::model::ComBatOptions;
use crate::io::table::CovariateColumns;
use crate::utils::error::{HarmonizeError, Result};
use crate::utils::validation::{
    validate_delimiter, validate_distinct_columns, validate_file_extension, validate_path, validate_positive_number,
    validate_range, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How measurement rows (or images) are matched to covariate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    /// Row i of one source is row i of the other.
    #[default]
    Order,
    /// Match by subject identifier.
    Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateSource {
    pub path: PathBuf,
    pub columns: CovariateColumns,
    pub delimiter: Option<char>,
    pub alignment: Alignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularJob {
    pub measurements: PathBuf,
    pub measurement_delimiter: Option<char>,
    pub covariates: CovariateSource,
    /// Drop measurement rows whose subject has no covariate row.
    pub filter_to_covariates: bool,
    /// Append the covariate columns to the output table.
    pub include_covariates: bool,
    pub output_file: Option<String>,
    pub combat: ComBatOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelJob {
    pub image_dir: PathBuf,
    pub prefix: String,
    pub suffix: String,
    pub mask_threshold: f64,
    pub covariates: CovariateSource,
    pub combat: ComBatOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HarmonizationJob {
    Tabular(TabularJob),
    Voxelwise(VoxelJob),
}

pub const REPORT_FILE_NAME: &str = "harmonization_report.json";

impl TabularJob {
    /// `imagingmeasures.tsv` -> `imagingmeasures_combat.csv` unless configured.
    pub fn output_file_name(&self) -> String {
        if let Some(name) = &self.output_file {
            return name.clone();
        }
        let stem = self
            .measurements
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("measurements");
        format!("{}_combat.csv", stem)
    }

    pub fn default_output_dir(&self) -> PathBuf {
        parent_or_current(&self.measurements)
    }
}

impl VoxelJob {
    pub fn default_output_dir(&self) -> PathBuf {
        self.image_dir.clone()
    }
}

impl HarmonizationJob {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Tabular(_) => "tabular",
            Self::Voxelwise(_) => "voxelwise",
        }
    }

    pub fn covariates(&self) -> &CovariateSource {
        match self {
            Self::Tabular(job) => &job.covariates,
            Self::Voxelwise(job) => &job.covariates,
        }
    }

    pub fn combat(&self) -> &ComBatOptions {
        match self {
            Self::Tabular(job) => &job.combat,
            Self::Voxelwise(job) => &job.combat,
        }
    }

    pub fn default_output_dir(&self) -> PathBuf {
        match self {
            Self::Tabular(job) => job.default_output_dir(),
            Self::Voxelwise(job) => job.default_output_dir(),
        }
    }
}

fn parent_or_current(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

impl Validate for CovariateSource {
    fn validate(&self) -> Result<()> {
        validate_path("covariates.path", &path_str(&self.path))?;
        validate_file_extension("covariates.path", &path_str(&self.path), &["csv", "tsv", "txt"])?;
        validate_delimiter("covariates.delimiter", self.delimiter)?;

        let mut columns: Vec<&str> = vec![
            self.columns.index_col.as_str(),
            self.columns.batch_col.as_str(),
        ];
        columns.extend(self.columns.categorical_cols.iter().map(String::as_str));
        columns.extend(self.columns.continuous_cols.iter().map(String::as_str));
        validate_distinct_columns("covariates.columns", &columns)
    }
}

impl Validate for ComBatOptions {
    fn validate(&self) -> Result<()> {
        validate_range("combat.tolerance", self.tolerance, f64::MIN_POSITIVE, 1.0)?;
        validate_positive_number("combat.max_iterations", self.max_iterations, 1)?;
        if let Some(reference) = &self.reference_batch {
            if reference.trim().is_empty() {
                return Err(HarmonizeError::InvalidConfigValueError {
                    field: "combat.reference_batch".to_string(),
                    value: reference.clone(),
                    reason: "Reference batch cannot be blank".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Validate for TabularJob {
    fn validate(&self) -> Result<()> {
        validate_path("tabular.measurements", &path_str(&self.measurements))?;
        validate_file_extension(
            "tabular.measurements",
            &path_str(&self.measurements),
            &["csv", "tsv", "txt"],
        )?;
        validate_delimiter("tabular.delimiter", self.measurement_delimiter)?;
        if self.filter_to_covariates && self.covariates.alignment == Alignment::Order {
            return Err(HarmonizeError::InvalidConfigValueError {
                field: "tabular.filter_to_covariates".to_string(),
                value: "true".to_string(),
                reason: "Filtering by subject requires alignment = \"id\"".to_string(),
            });
        }
        if let Some(name) = &self.output_file {
            validate_path("tabular.output_file", name)?;
        }
        self.covariates.validate()?;
        self.combat.validate()
    }
}

impl Validate for VoxelJob {
    fn validate(&self) -> Result<()> {
        validate_path("voxelwise.image_dir", &path_str(&self.image_dir))?;
        if !self.mask_threshold.is_finite() {
            return Err(HarmonizeError::InvalidConfigValueError {
                field: "voxelwise.mask_threshold".to_string(),
                value: self.mask_threshold.to_string(),
                reason: "Threshold must be a finite number".to_string(),
            });
        }
        if !self.suffix.ends_with(".nii") && !self.suffix.ends_with(".nii.gz") {
            return Err(HarmonizeError::InvalidConfigValueError {
                field: "voxelwise.suffix".to_string(),
                value: self.suffix.clone(),
                reason: "Images must be .nii or .nii.gz files".to_string(),
            });
        }
        self.covariates.validate()?;
        self.combat.validate()
    }
}

impl Validate for HarmonizationJob {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Tabular(job) => job.validate(),
            Self::Voxelwise(job) => job.validate(),
        }
    }
}
