//! Metrics sink trait and implementations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use metrics::Label;

use crate::error::MetricsError;

/// A recorded metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

/// Trait for emitting business metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, name: &str, value: f64, tags: &[(&str, &str)])
    -> Result<(), MetricsError>;
}

#[derive(Debug, Default)]
struct InMemoryMetricsState {
    samples: Vec<MetricSample>,
    fail_on_record: bool,
}

/// In-memory sink that keeps every sample.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    state: Arc<Mutex<InMemoryMetricsState>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryMetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the sink to refuse every sample.
    pub fn set_fail_on_record(&self, fail: bool) {
        self.state().fail_on_record = fail;
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.state().samples.clone()
    }

    /// Returns the samples recorded under `name`.
    pub fn samples_named(&self, name: &str) -> Vec<MetricSample> {
        self.state()
            .samples
            .iter()
            .filter(|sample| sample.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn record(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        let mut state = self.state();

        if state.fail_on_record {
            return Err(MetricsError::Rejected {
                name: name.to_string(),
                reason: "sink unavailable".to_string(),
            });
        }

        state.samples.push(MetricSample {
            name: name.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(())
    }
}

/// Sink that forwards samples to the process-wide `metrics` recorder.
///
/// Samples become histograms, so the Prometheus exporter exposes both the
/// number of samples (`_count`) and their running total (`_sum`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn record(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> Result<(), MetricsError> {
        let labels: Vec<Label> = tags
            .iter()
            .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
            .collect();
        metrics::histogram!(name.to_string(), labels).record(value);
        Ok(())
    }
}
