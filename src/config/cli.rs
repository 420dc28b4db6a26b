use crate::combat::model::ComBatOptions;
use crate::config::job::{Alignment, CovariateSource, HarmonizationJob, TabularJob, VoxelJob};
use crate::domain::ports::ConfigProvider;
use crate::io::table::CovariateColumns;
use crate::utils::error::Result;
use crate::utils::validation::Validate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "neuro-combat")]
#[command(about = "Remove site/scanner effects from neuroimaging measures with ComBat")]
pub struct CliConfig {
    #[command(subcommand)]
    pub command: Command,

    /// Output directory (defaults to the directory of the input data)
    #[arg(long, global = true)]
    pub output_path: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log CPU and memory usage per phase")]
    pub monitor: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Harmonize a subjects x features table (regional measures)
    Tabular(TabularArgs),
    /// Harmonize one 3D NIfTI image per subject
    Voxelwise(VoxelArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CovariateArgs {
    /// Covariate file (.csv or .tsv)
    #[arg(long)]
    pub covariates: PathBuf,

    #[arg(long, default_value = "subj")]
    pub index_col: String,

    #[arg(long, default_value = "site")]
    pub batch_col: String,

    #[arg(long, value_delimiter = ',')]
    pub categorical: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub continuous: Vec<String>,

    /// Override the delimiter inferred from the covariate file extension
    #[arg(long)]
    pub covariate_delimiter: Option<char>,

    #[arg(long, value_enum, default_value_t = Alignment::Order)]
    pub align: Alignment,
}

#[derive(Debug, Clone, Args)]
pub struct ComBatArgs {
    /// Skip empirical Bayes shrinkage
    #[arg(long)]
    pub no_eb: bool,

    /// Non-parametric empirical Bayes priors
    #[arg(long)]
    pub nonparametric: bool,

    /// Only correct additive site effects
    #[arg(long)]
    pub mean_only: bool,

    /// Keep this site unchanged and map the others onto it
    #[arg(long)]
    pub ref_batch: Option<String>,

    #[arg(long, default_value = "0.0001")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Args)]
pub struct TabularArgs {
    /// Measurements file, one row per subject
    #[arg(long)]
    pub measurements: PathBuf,

    #[arg(long)]
    pub measurement_delimiter: Option<char>,

    #[command(flatten)]
    pub covariates: CovariateArgs,

    #[command(flatten)]
    pub combat: ComBatArgs,

    /// Drop measurement rows without covariates (requires --align id)
    #[arg(long)]
    pub filter_to_covariates: bool,

    /// Append covariate columns to the output file
    #[arg(long)]
    pub include_covariates: bool,

    #[arg(long)]
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct VoxelArgs {
    /// Directory with one 3D image per subject
    #[arg(long)]
    pub image_dir: PathBuf,

    #[arg(long, default_value = "sub-")]
    pub prefix: String,

    #[arg(long, default_value = ".nii.gz")]
    pub suffix: String,

    /// Voxels whose mean intensity is above this value are harmonized
    #[arg(long, default_value = "0")]
    pub threshold: f64,

    #[command(flatten)]
    pub covariates: CovariateArgs,

    #[command(flatten)]
    pub combat: ComBatArgs,
}

impl From<&CovariateArgs> for CovariateSource {
    fn from(args: &CovariateArgs) -> Self {
        CovariateSource {
            path: args.covariates.clone(),
            columns: CovariateColumns {
                index_col: args.index_col.clone(),
                batch_col: args.batch_col.clone(),
                categorical_cols: args.categorical.clone(),
                continuous_cols: args.continuous.clone(),
            },
            delimiter: args.covariate_delimiter,
            alignment: args.align,
        }
    }
}

impl From<&ComBatArgs> for ComBatOptions {
    fn from(args: &ComBatArgs) -> Self {
        ComBatOptions {
            empirical_bayes: !args.no_eb,
            parametric: !args.nonparametric,
            mean_only: args.mean_only,
            reference_batch: args.ref_batch.clone(),
            tolerance: args.tolerance,
            ..ComBatOptions::default()
        }
    }
}

impl ConfigProvider for CliConfig {
    fn job(&self) -> Result<HarmonizationJob> {
        let job = match &self.command {
            Command::Tabular(args) => HarmonizationJob::Tabular(TabularJob {
                measurements: args.measurements.clone(),
                measurement_delimiter: args.measurement_delimiter,
                covariates: CovariateSource::from(&args.covariates),
                filter_to_covariates: args.filter_to_covariates,
                include_covariates: args.include_covariates,
                output_file: args.output_file.clone(),
                combat: ComBatOptions::from(&args.combat),
            }),
            Command::Voxelwise(args) => HarmonizationJob::Voxelwise(VoxelJob {
                image_dir: args.image_dir.clone(),
                prefix: args.prefix.clone(),
                suffix: args.suffix.clone(),
                mask_threshold: args.threshold,
                covariates: CovariateSource::from(&args.covariates),
                combat: ComBatOptions::from(&args.combat),
            }),
        };
        Ok(job)
    }

    fn output_path(&self) -> Option<&str> {
        self.output_path.as_deref()
    }

    fn monitoring_enabled(&self) -> bool {
        self.monitor
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        if let Some(path) = &self.output_path {
            crate::utils::validation::validate_path("output_path", path)?;
        }
        self.job()?.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tabular_command() {
        let config = CliConfig::try_parse_from([
            "neuro-combat",
            "tabular",
            "--measurements",
            "mri/imagingmeasures.csv",
            "--covariates",
            "clin/demo_clin_vars.tsv",
            "--categorical",
            "sex,diagnosis",
            "--continuous",
            "age,edu",
            "--ref-batch",
            "AMS",
        ])
        .unwrap();

        let HarmonizationJob::Tabular(job) = config.job().unwrap() else {
            panic!("expected a tabular job");
        };
        assert_eq!(job.covariates.columns.index_col, "subj");
        assert_eq!(job.covariates.columns.categorical_cols, vec!["sex", "diagnosis"]);
        assert_eq!(job.combat.reference_batch.as_deref(), Some("AMS"));
        assert!(job.combat.empirical_bayes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_voxelwise_command_with_global_flags() {
        let config = CliConfig::try_parse_from([
            "neuro-combat",
            "voxelwise",
            "--image-dir",
            "mri",
            "--covariates",
            "clin/demo_clin_vars.tsv",
            "--batch-col",
            "SITE",
            "--continuous",
            "age",
            "--no-eb",
            "--verbose",
            "--output-path",
            "out",
        ])
        .unwrap();

        assert!(config.verbose);
        assert_eq!(config.output_path(), Some("out"));
        let HarmonizationJob::Voxelwise(job) = config.job().unwrap() else {
            panic!("expected a voxelwise job");
        };
        assert_eq!(job.prefix, "sub-");
        assert_eq!(job.suffix, ".nii.gz");
        assert_eq!(job.mask_threshold, 0.0);
        assert!(!job.combat.empirical_bayes);
    }
}
