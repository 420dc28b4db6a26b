pub mod design;
pub mod estimate;
pub mod matrix;
pub mod model;

pub use model::{ComBat, ComBatOptions, FitOutcome, HarmonizationModel};
