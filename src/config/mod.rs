#[cfg(feature = "cli")]
pub mod cli;
pub mod job;
pub mod toml_config;

#[cfg(feature = "cli")]
pub use cli::CliConfig;
pub use job::{Alignment, CovariateSource, HarmonizationJob, TabularJob, VoxelJob};
pub use toml_config::TomlConfig;
