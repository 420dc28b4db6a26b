pub mod adapters;
pub mod combat;
pub mod config;
pub mod core;
pub mod domain;
pub mod io;
pub mod utils;

pub use adapters::storage::LocalStorage;
#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::TomlConfig;

pub use combat::{ComBat, ComBatOptions, HarmonizationModel};
pub use core::{run_job, HarmonizeEngine, TabularPipeline, VoxelPipeline};
pub use domain::model::HarmonizationReport;
pub use utils::error::{HarmonizeError, Result};
