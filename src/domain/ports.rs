use crate::config::job::HarmonizationJob;
use crate::domain::model::HarmonizationReport;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub trait Storage: Send + Sync {
    /// Writes `data` to `path` relative to the storage root and returns the full path.
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<PathBuf>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn job(&self) -> Result<HarmonizationJob>;
    fn output_path(&self) -> Option<&str>;
    fn monitoring_enabled(&self) -> bool;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    type Extracted: Send;
    type Transformed: Send;

    fn name(&self) -> &'static str;
    async fn extract(&self) -> Result<Self::Extracted>;
    async fn transform(&self, data: Self::Extracted) -> Result<Self::Transformed>;
    async fn load(&self, result: Self::Transformed) -> Result<HarmonizationReport>;
}
