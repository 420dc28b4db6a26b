use crate::domain::model::HarmonizationReport;
use crate::domain::ports::Pipeline;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;

/// 依序執行 extract → transform → load，並在每個階段記錄資源用量
pub struct HarmonizeEngine<P: Pipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: Pipeline> HarmonizeEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::new_with_monitoring(pipeline, false)
    }

    pub fn new_with_monitoring(pipeline: P, monitor_enabled: bool) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub async fn run(&self) -> Result<HarmonizationReport> {
        tracing::info!("🚀 Starting {} harmonization", self.pipeline.name());
        self.monitor.log_stats("Start");

        tracing::info!("📥 Loading measurements and covariates...");
        let extracted = self.pipeline.extract().await?;
        self.monitor.log_stats("Extract");

        tracing::info!("🧮 Fitting ComBat...");
        let transformed = self.pipeline.transform(extracted).await?;
        self.monitor.log_stats("Transform");

        tracing::info!("💾 Writing harmonized data...");
        let report = self.pipeline.load(transformed).await?;
        self.monitor.log_stats("Load");

        tracing::info!(
            "✅ Harmonized {} subjects x {} features across {} batches",
            report.subjects,
            report.features,
            report.batches.len()
        );
        self.monitor.log_final_stats();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::HarmonizeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPipeline {
        calls: AtomicUsize,
        fail_transform: bool,
    }

    #[async_trait]
    impl Pipeline for CountingPipeline {
        type Extracted = usize;
        type Transformed = usize;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn extract(&self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn transform(&self, data: usize) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_transform {
                return Err(HarmonizeError::NumericError {
                    message: "boom".to_string(),
                });
            }
            Ok(data * 2)
        }

        async fn load(&self, result: usize) -> Result<HarmonizationReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = chrono::Utc::now();
            Ok(HarmonizationReport {
                mode: "counting".to_string(),
                started_at: now,
                finished_at: now,
                subjects: result,
                features: 1,
                constant_features: 0,
                batch_col: "site".to_string(),
                categorical_cols: vec![],
                continuous_cols: vec![],
                empirical_bayes: true,
                parametric: true,
                mean_only: false,
                reference_batch: None,
                batches: vec![],
                mask_voxels: None,
                outputs: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_engine_runs_all_phases() {
        let engine = HarmonizeEngine::new(CountingPipeline {
            calls: AtomicUsize::new(0),
            fail_transform: false,
        });
        let report = engine.run().await.unwrap();
        assert_eq!(report.subjects, 6);
        assert_eq!(engine.pipeline.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_engine_stops_at_failing_phase() {
        let engine = HarmonizeEngine::new(CountingPipeline {
            calls: AtomicUsize::new(0),
            fail_transform: true,
        });
        let result = tokio_test::block_on(engine.run());
        assert!(matches!(result, Err(HarmonizeError::NumericError { .. })));
        assert_eq!(engine.pipeline.calls.load(Ordering::SeqCst), 2);
    }
}
