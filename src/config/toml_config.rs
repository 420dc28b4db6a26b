use crate::combat::model::ComBatOptions;
use crate::config::job::{Alignment, CovariateSource, HarmonizationJob, TabularJob, VoxelJob};
use crate::domain::ports::ConfigProvider;
use crate::io::table::CovariateColumns;
use crate::utils::error::{HarmonizeError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_required_field, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub job: JobInfo,
    pub covariates: CovariatesConfig,
    pub tabular: Option<TabularConfig>,
    pub voxelwise: Option<VoxelwiseConfig>,
    pub combat: Option<CombatConfig>,
    pub output: Option<OutputConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Tabular,
    Voxelwise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub description: Option<String>,
    pub mode: JobMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovariatesConfig {
    pub path: String,
    #[serde(flatten)]
    pub columns: CovariateColumns,
    pub delimiter: Option<char>,
    pub alignment: Option<Alignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularConfig {
    pub measurements: String,
    pub delimiter: Option<char>,
    pub filter_to_covariates: Option<bool>,
    pub include_covariates: Option<bool>,
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelwiseConfig {
    pub image_dir: String,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub mask_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombatConfig {
    pub empirical_bayes: Option<bool>,
    pub parametric: Option<bool>,
    pub mean_only: Option<bool>,
    pub reference_batch: Option<String>,
    pub tolerance: Option<f64>,
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub verbose: Option<bool>,
    pub json_logs: Option<bool>,
}

impl CombatConfig {
    /// 未指定的欄位採用預設值
    pub fn to_options(&self) -> ComBatOptions {
        let defaults = ComBatOptions::default();
        ComBatOptions {
            empirical_bayes: self.empirical_bayes.unwrap_or(defaults.empirical_bayes),
            parametric: self.parametric.unwrap_or(defaults.parametric),
            mean_only: self.mean_only.unwrap_or(defaults.mean_only),
            reference_batch: self.reference_batch.clone(),
            tolerance: self.tolerance.unwrap_or(defaults.tolerance),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
        }
    }
}

impl TomlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(HarmonizeError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| HarmonizeError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${DATA_DIR})，未設定的變數保留原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| HarmonizeError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    fn covariate_source(&self) -> CovariateSource {
        CovariateSource {
            path: PathBuf::from(&self.covariates.path),
            columns: self.covariates.columns.clone(),
            delimiter: self.covariates.delimiter,
            alignment: self.covariates.alignment.unwrap_or_default(),
        }
    }

    fn combat_options(&self) -> ComBatOptions {
        self.combat.clone().unwrap_or_default().to_options()
    }

    /// 依 `[job].mode` 組出對應的工作；缺少該模式的區段時回報錯誤
    pub fn to_job(&self) -> Result<HarmonizationJob> {
        match self.job.mode {
            JobMode::Tabular => {
                let section = validate_required_field("tabular", &self.tabular)?;
                Ok(HarmonizationJob::Tabular(TabularJob {
                    measurements: PathBuf::from(&section.measurements),
                    measurement_delimiter: section.delimiter,
                    covariates: self.covariate_source(),
                    filter_to_covariates: section.filter_to_covariates.unwrap_or(false),
                    include_covariates: section.include_covariates.unwrap_or(false),
                    output_file: section.output_file.clone(),
                    combat: self.combat_options(),
                }))
            }
            JobMode::Voxelwise => {
                let section = validate_required_field("voxelwise", &self.voxelwise)?;
                Ok(HarmonizationJob::Voxelwise(VoxelJob {
                    image_dir: PathBuf::from(&section.image_dir),
                    prefix: section.prefix.clone().unwrap_or_else(|| "sub-".to_string()),
                    suffix: section
                        .suffix
                        .clone()
                        .unwrap_or_else(|| ".nii.gz".to_string()),
                    mask_threshold: section.mask_threshold.unwrap_or(0.0),
                    covariates: self.covariate_source(),
                    combat: self.combat_options(),
                }))
            }
        }
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("job.name", &self.job.name)?;

        if let Some(path) = self.output_path() {
            validate_path("output.path", path)?;
        }

        // 另一個模式的區段不會被使用，提醒使用者
        match self.job.mode {
            JobMode::Tabular if self.voxelwise.is_some() => {
                tracing::warn!("⚠️ [voxelwise] section is ignored for a tabular job");
            }
            JobMode::Voxelwise if self.tabular.is_some() => {
                tracing::warn!("⚠️ [tabular] section is ignored for a voxelwise job");
            }
            _ => {}
        }

        self.to_job()?.validate()
    }

    pub fn output_path(&self) -> Option<&str> {
        self.output.as_ref().and_then(|o| o.path.as_deref())
    }

    /// 取得監控設定
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn verbose(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.verbose)
            .unwrap_or(false)
    }

    pub fn json_logs(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.json_logs)
            .unwrap_or(false)
    }
}

impl ConfigProvider for TomlConfig {
    fn job(&self) -> Result<HarmonizationJob> {
        self.to_job()
    }

    fn output_path(&self) -> Option<&str> {
        TomlConfig::output_path(self)
    }

    fn monitoring_enabled(&self) -> bool {
        TomlConfig::monitoring_enabled(self)
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TABULAR_JOB: &str = r#"
[job]
name = "regional-thickness"
mode = "tabular"

[covariates]
path = "clin/demo_clin_vars.tsv"
index_col = "subj"
batch_col = "site"
categorical_cols = ["sex", "diagnosis"]
continuous_cols = ["age"]
alignment = "id"

[tabular]
measurements = "mri/imagingmeasures.tsv"
filter_to_covariates = true

[combat]
reference_batch = "AMS"
"#;

    #[test]
    fn test_parse_tabular_job() {
        let config = TomlConfig::from_toml_str(TABULAR_JOB).unwrap();

        assert_eq!(config.job.name, "regional-thickness");
        let HarmonizationJob::Tabular(job) = config.to_job().unwrap() else {
            panic!("expected a tabular job");
        };
        assert_eq!(job.covariates.alignment, Alignment::Id);
        assert_eq!(job.covariates.columns.continuous_cols, vec!["age"]);
        assert!(job.filter_to_covariates);
        assert_eq!(job.combat.reference_batch.as_deref(), Some("AMS"));
        assert_eq!(job.combat.max_iterations, 1000);
        assert!(config.validate().is_ok());
        assert!(!config.monitoring_enabled());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("NEURO_COMBAT_TEST_IMAGES", "/data/fa");

        let toml_content = r#"
[job]
name = "fa"
mode = "voxelwise"

[covariates]
path = "covars.csv"
index_col = "subj"
batch_col = "site"

[voxelwise]
image_dir = "${NEURO_COMBAT_TEST_IMAGES}"
suffix = "_FA.nii.gz"
"#;

        let config = TomlConfig::from_toml_str(toml_content).unwrap();
        let HarmonizationJob::Voxelwise(job) = config.to_job().unwrap() else {
            panic!("expected a voxelwise job");
        };
        assert_eq!(job.image_dir, PathBuf::from("/data/fa"));
        assert_eq!(job.prefix, "sub-");
        assert_eq!(job.mask_threshold, 0.0);

        std::env::remove_var("NEURO_COMBAT_TEST_IMAGES");
    }

    #[test]
    fn test_missing_mode_section_is_rejected() {
        let toml_content = r#"
[job]
name = "broken"
mode = "voxelwise"

[covariates]
path = "covars.csv"
index_col = "subj"
batch_col = "site"
"#;

        let config = TomlConfig::from_toml_str(toml_content).unwrap();
        assert!(matches!(
            config.to_job(),
            Err(HarmonizeError::MissingConfigError { .. })
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let content = format!(
            "{}\n[monitoring]\nenabled = true\nverbose = true\n",
            TABULAR_JOB
        );
        temp_file.write_all(content.as_bytes()).unwrap();

        let config = TomlConfig::from_file(temp_file.path()).unwrap();
        assert!(config.monitoring_enabled());
        assert!(config.verbose());
        assert!(!config.json_logs());
    }
}
