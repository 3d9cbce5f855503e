//! Test fixtures for pipeline runs.

use chrono::NaiveDate;
use std::sync::Arc;

use super::{InMemoryParameterStore, MockComputeStage, MockExportStage, MockNotifyStage};
use crate::config::PipelineConfig;
use crate::events::CollectingEventSink;
use crate::pipeline::{JitterStrategy, PipelineCoordinator, RetryConfig};

/// The scored namespace used by [`test_config`].
pub const TEST_SCORED_NAMESPACE: &str = "/scored";

/// A fixed run date.
#[must_use]
pub fn fixture_run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap_or_default()
}

/// A configuration with a fixed scored namespace and fast retries.
#[must_use]
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.namespaces.scored_location = Some(TEST_SCORED_NAMESPACE.to_string());
    config.notify.retry = RetryConfig::new()
        .with_max_attempts(3)
        .with_base_delay_ms(1)
        .with_jitter(JitterStrategy::None);
    config
}

/// A coordinator wired to scripted doubles, with handles kept for assertions.
pub struct TestPipeline {
    /// The export double.
    pub export: Arc<MockExportStage>,
    /// The compute double.
    pub compute: Arc<MockComputeStage>,
    /// The notify double.
    pub notify: Arc<MockNotifyStage>,
    /// The parameter store.
    pub parameters: Arc<InMemoryParameterStore>,
    /// Collected events.
    pub events: Arc<CollectingEventSink>,
    /// Configuration used by [`build`](Self::build).
    pub config: PipelineConfig,
}

impl TestPipeline {
    /// Creates a pipeline where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            export: Arc::new(MockExportStage::succeeding("R1", "/raw/R1")),
            compute: Arc::new(MockComputeStage::succeeding()),
            notify: Arc::new(MockNotifyStage::succeeding()),
            parameters: Arc::new(InMemoryParameterStore::complete()),
            events: Arc::new(CollectingEventSink::new()),
            config: test_config(),
        }
    }

    /// Replaces the export double.
    #[must_use]
    pub fn with_export(mut self, stage: MockExportStage) -> Self {
        self.export = Arc::new(stage);
        self
    }

    /// Replaces the compute double.
    #[must_use]
    pub fn with_compute(mut self, stage: MockComputeStage) -> Self {
        self.compute = Arc::new(stage);
        self
    }

    /// Replaces the notify double.
    #[must_use]
    pub fn with_notify(mut self, stage: MockNotifyStage) -> Self {
        self.notify = Arc::new(stage);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the coordinator.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn build(&self) -> PipelineCoordinator {
        PipelineCoordinator::builder()
            .export(self.export.clone())
            .compute(self.compute.clone())
            .notify(self.notify.clone())
            .parameters(self.parameters.clone())
            .config(self.config.clone())
            .event_sink(self.events.clone())
            .build()
            .expect("test pipeline configuration is valid")
    }
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}
