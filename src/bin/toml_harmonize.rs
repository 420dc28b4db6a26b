use clap::Parser;
use neuro_combat::config::job::{Alignment, HarmonizationJob};
use neuro_combat::config::toml_config::{MonitoringConfig, OutputConfig, TomlConfig};
use neuro_combat::domain::ports::ConfigProvider;
use neuro_combat::io::discovery::{adjusted_name, discover_images};
use neuro_combat::io::table::{read_covariates, read_measurements};
use neuro_combat::run_job;
use neuro_combat::utils::{logger, validation::Validate};

#[derive(Parser)]
#[command(name = "toml-harmonize")]
#[command(about = "Run a ComBat harmonization job described in a TOML file")]
struct Args {
    /// Path to TOML job file
    #[arg(short, long, default_value = "harmonize.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Override monitoring setting from config
    #[arg(long)]
    monitor: Option<bool>,

    /// Override the output directory from config
    #[arg(long)]
    output_path: Option<String>,

    /// Dry run - check inputs and show what would be processed without fitting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 載入 TOML 配置
    let mut config = match TomlConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 初始化日誌
    logger::init_logger(args.verbose || config.verbose(), config.json_logs());
    tracing::info!("🚀 Starting TOML-based harmonization");
    tracing::info!("📁 Loaded configuration from: {}", args.config);

    // 應用命令列覆蓋設定
    if let Some(path) = &args.output_path {
        config.output.get_or_insert(OutputConfig { path: None }).path = Some(path.clone());
        tracing::info!("🔧 Output path overridden to: {}", path);
    }
    if let Some(monitor) = args.monitor {
        config
            .monitoring
            .get_or_insert(MonitoringConfig {
                enabled: false,
                verbose: None,
                json_logs: None,
            })
            .enabled = monitor;
        tracing::info!("🔧 Monitoring overridden to: {}", monitor);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    tracing::info!("✅ Configuration loaded and validated successfully");

    display_config_summary(&config, &args);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No fitting will occur");
        if let Err(e) = perform_dry_run(&config) {
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(e.severity().exit_code());
        }
        return;
    }

    if config.monitoring_enabled() {
        tracing::info!("🔍 System monitoring enabled");
    }

    match run_job(&config).await {
        Ok(report) => {
            tracing::info!("✅ Harmonization completed successfully!");
            println!("✅ Harmonization completed successfully!");
            for output in &report.outputs {
                println!("📁 {}", output);
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Harmonization failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            let exit_code = e.severity().exit_code();
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }
}

fn display_config_summary(config: &TomlConfig, args: &Args) {
    println!("📋 Configuration Summary:");
    println!("  Job: {} ({:?})", config.job.name, config.job.mode);
    if let Some(description) = &config.job.description {
        println!("  Description: {}", description);
    }
    println!("  Covariates: {}", config.covariates.path);
    println!("  Batch column: {}", config.covariates.columns.batch_col);
    println!(
        "  Output: {}",
        config.output_path().unwrap_or("(next to the input data)")
    );
    println!("  Monitoring: {}", config.monitoring_enabled());

    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }

    println!();
}

/// 讀取輸入並檢查筆數，但不估計模型
fn perform_dry_run(config: &TomlConfig) -> neuro_combat::Result<()> {
    let job = config.job()?;
    let covariates = job.covariates();

    println!("🔍 Dry Run Analysis:");
    println!();

    let table = read_covariates(&covariates.path, &covariates.columns, covariates.delimiter)?;
    println!("📄 Covariates:");
    println!("  Rows: {}", table.len());
    for (label, count) in table.batch_counts() {
        println!("  Batch {}: {} subjects", label, count);
    }
    if !covariates.columns.categorical_cols.is_empty() {
        println!("  Categorical: {}", covariates.columns.categorical_cols.join(", "));
    }
    if !covariates.columns.continuous_cols.is_empty() {
        println!("  Continuous: {}", covariates.columns.continuous_cols.join(", "));
    }

    println!();
    match &job {
        HarmonizationJob::Tabular(tabular) => {
            let measurements = read_measurements(
                &tabular.measurements,
                &covariates.columns.index_col,
                tabular.measurement_delimiter,
            )?;
            println!("📊 Tabular input: {}", tabular.measurements.display());
            println!(
                "  {} subjects x {} features",
                measurements.n_subjects(),
                measurements.n_features()
            );
            if covariates.alignment == Alignment::Order && measurements.n_subjects() != table.len() {
                println!(
                    "  ⚠️ {} measurement rows but {} covariate rows; the run would abort",
                    measurements.n_subjects(),
                    table.len()
                );
            }
            println!("  Output file: {}", tabular.output_file_name());
            if tabular.include_covariates {
                println!("  ✅ Covariate columns will be appended");
            }
        }
        HarmonizationJob::Voxelwise(voxel) => {
            let images = discover_images(&voxel.image_dir, &voxel.prefix, &voxel.suffix)?;
            println!("🧠 Voxelwise input: {}", voxel.image_dir.display());
            println!("  Images: {}", images.len());
            println!("  Mask threshold: {}", voxel.mask_threshold);
            if covariates.alignment == Alignment::Order && images.len() != table.len() {
                println!(
                    "  ⚠️ {} images but {} covariate rows; the run would abort",
                    images.len(),
                    table.len()
                );
            }
            if let Some(first) = images.first() {
                println!("  First output: {}", adjusted_name(&first.file_name));
            }
        }
    }

    println!();
    println!("⚙️ ComBat:");
    let combat = job.combat();
    println!("  Empirical Bayes: {}", combat.empirical_bayes);
    println!("  Parametric: {}", combat.parametric);
    println!("  Mean only: {}", combat.mean_only);
    if let Some(reference) = &combat.reference_batch {
        println!("  Reference batch: {}", reference);
    }

    println!();
    println!("✅ Dry run analysis complete. Use --verbose for more details during actual run.");

    Ok(())
}
