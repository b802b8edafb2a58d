//! Timing of extraction and validation work.
//!
//! Every engine operation is wrapped in [`Metrics::time`], which records the
//! elapsed time and outcome in a [`MetricsSink`] under the engine's group.
//! The sink is injected; [`TimerRegistry`] is the in-process default and
//! keeps per-operation counters that the CLI can print.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Destination of timing samples.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Records one timed operation.
    fn record(&self, group: &str, name: &str, elapsed: Duration, success: bool);
}

/// Aggregated timings of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimerStats {
    /// Metric group, usually the engine
    pub group: String,
    /// Operation name
    pub name: String,
    /// Number of calls
    pub count: u64,
    /// Number of failed calls
    pub failures: u64,
    /// Sum of elapsed times
    pub total: Duration,
    /// Slowest call
    pub max: Duration,
}

/// In-memory sink keeping counters per (group, operation).
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: DashMap<(String, String), TimerStats>,
}

impl TimerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of one operation
    pub fn get(&self, group: &str, name: &str) -> Option<TimerStats> {
        self.timers
            .get(&(group.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// All counters sorted by group and name
    pub fn summary(&self) -> Vec<TimerStats> {
        let mut stats: Vec<TimerStats> = self.timers.iter().map(|e| e.value().clone()).collect();
        stats.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        stats
    }
}

impl MetricsSink for TimerRegistry {
    fn record(&self, group: &str, name: &str, elapsed: Duration, success: bool) {
        let mut entry = self
            .timers
            .entry((group.to_string(), name.to_string()))
            .or_insert_with(|| TimerStats {
                group: group.to_string(),
                name: name.to_string(),
                ..TimerStats::default()
            });
        entry.count = entry.count.saturating_add(1);
        if !success {
            entry.failures = entry.failures.saturating_add(1);
        }
        entry.total = entry.total.saturating_add(elapsed);
        entry.max = entry.max.max(elapsed);
    }
}

/// Timer facility bound to a metric group.
#[derive(Debug, Clone)]
pub struct Metrics {
    group: String,
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    /// Creates a facility for a group.
    pub fn new(group: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            group: group.into(),
            sink,
        }
    }

    /// Facility discarding into a private registry
    pub fn detached(group: impl Into<String>) -> Self {
        Self::new(group, Arc::new(TimerRegistry::new()))
    }

    /// Same sink, other group.
    #[must_use]
    pub fn with_group(&self, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Metric group
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Runs an operation and records its duration and outcome.
    pub async fn time<T, E, F>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = operation.await;
        let elapsed = started.elapsed();
        tracing::trace!(
            group = %self.group,
            operation = name,
            elapsed_ms = elapsed.as_millis(),
            success = result.is_ok(),
            "timed"
        );
        self.sink.record(&self.group, name, elapsed, result.is_ok());
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_time_records_outcome() {
        let registry = Arc::new(TimerRegistry::new());
        let metrics = Metrics::new("MySQL", registry.clone());

        let ok: Result<u32, String> = metrics.time("Extract Nodes", async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);
        let failed: Result<u32, String> = metrics
            .time("Extract Nodes", async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());

        let stats = registry.get("MySQL", "Extract Nodes").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.failures, 1);
        assert!(stats.max <= stats.total);
    }

    #[tokio::test]
    async fn test_groups_share_sink() {
        let registry = Arc::new(TimerRegistry::new());
        let base = Metrics::new("Monitor", registry.clone());
        let vertica = base.with_group("Vertica");

        let _: Result<(), ()> = vertica.time("Extract Sessions", async { Ok(()) }).await;
        let _: Result<(), ()> = base.time("Refresh Sessions", async { Ok(()) }).await;

        let summary = registry.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].group, "Monitor");
        assert_eq!(summary[1].group, "Vertica");
    }
}
