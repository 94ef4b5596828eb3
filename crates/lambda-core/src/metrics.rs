//! Per-execution metrics ledger and its on-demand rollup.
//!
//! Every dispatched execution appends one `MetricRecord`. Nothing is ever
//! updated or removed; `report()` recomputes the per-mode summary by scanning
//! the whole ledger, which stays small enough for the life of one process.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::language::{ExecutionMode, SupportedLanguage};

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub mode: ExecutionMode,
    pub language: SupportedLanguage,
    pub duration: Duration,
    pub errored: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSummary {
    pub total_requests: u64,
    /// Mean duration in milliseconds.
    pub average_time: f64,
    pub error_rate: f64,
}

/// Summary keyed by execution mode label. Modes with no records are absent.
pub type MetricsReport = BTreeMap<String, ModeSummary>;

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    ledger: Mutex<Vec<MetricRecord>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(
        &self,
        mode: ExecutionMode,
        language: SupportedLanguage,
        duration: Duration,
        errored: bool,
    ) {
        let record = MetricRecord {
            mode,
            language,
            duration,
            errored,
            timestamp: Utc::now(),
        };
        log::debug!(
            "metric: mode={} lang={} duration={:?} error={}",
            record.mode,
            record.language,
            record.duration,
            record.errored
        );
        self.ledger.lock().await.push(record);
    }

    pub async fn report(&self) -> MetricsReport {
        let ledger = self.ledger.lock().await;

        let mut totals: BTreeMap<&'static str, (u64, f64, u64)> = BTreeMap::new();
        for record in ledger.iter() {
            let entry = totals.entry(record.mode.label()).or_insert((0, 0.0, 0));
            entry.0 += 1;
            entry.1 += record.duration.as_secs_f64() * 1000.0;
            if record.errored {
                entry.2 += 1;
            }
        }

        totals
            .into_iter()
            .map(|(label, (count, total_ms, errors))| {
                let count_f = count as f64;
                (
                    label.to_string(),
                    ModeSummary {
                        total_requests: count,
                        average_time: total_ms / count_f,
                        error_rate: errors as f64 / count_f,
                    },
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.ledger.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the raw ledger, oldest first.
    pub async fn records(&self) -> Vec<MetricRecord> {
        self.ledger.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_report() {
        let metrics = MetricsAggregator::new();
        assert!(metrics.report().await.is_empty());
        assert!(metrics.is_empty().await);
    }

    #[tokio::test]
    async fn test_error_rate_and_totals() {
        let metrics = MetricsAggregator::new();
        for _ in 0..3 {
            metrics
                .record(ExecutionMode::Docker, SupportedLanguage::Python, Duration::from_millis(10), false)
                .await;
        }
        metrics
            .record(ExecutionMode::Docker, SupportedLanguage::JavaScript, Duration::from_millis(30), true)
            .await;

        let report = metrics.report().await;
        assert_eq!(report.len(), 1, "gVisor has no records and must be absent");
        let docker = &report["Docker"];
        assert_eq!(docker.total_requests, 4);
        assert!((docker.error_rate - 0.25).abs() < f64::EPSILON);
        assert!((docker.average_time - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_groups_by_mode_not_language() {
        let metrics = MetricsAggregator::new();
        metrics
            .record(ExecutionMode::Docker, SupportedLanguage::Python, Duration::from_millis(5), false)
            .await;
        metrics
            .record(ExecutionMode::GVisor, SupportedLanguage::Python, Duration::from_millis(7), true)
            .await;

        let report = metrics.report().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report["gVisor"].total_requests, 1);
        assert_eq!(report["gVisor"].error_rate, 1.0);
        assert_eq!(report["Docker"].error_rate, 0.0);
    }

    #[tokio::test]
    async fn test_report_serializes_camel_case() {
        let metrics = MetricsAggregator::new();
        metrics
            .record(ExecutionMode::Docker, SupportedLanguage::Python, Duration::from_millis(2), false)
            .await;
        let value = serde_json::to_value(metrics.report().await).unwrap();
        assert_eq!(value["Docker"]["totalRequests"], 1);
        assert!(value["Docker"]["averageTime"].is_number());
        assert_eq!(value["Docker"]["errorRate"], 0.0);
    }
}
