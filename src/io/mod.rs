pub mod discovery;
pub mod mask;
pub mod nifti;
pub mod table;
