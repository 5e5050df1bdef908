//! Runtime metrics.
//!
//! The runner and the worker pool report through a [`MetricsSink`]. Series names used
//! by the runtime: `inputs_total`, `commands_executed_total`, `command_errors_total`,
//! `command_duration_ms`, `tasks_fired_total`, `worker_panics_total` and the
//! `worker_queue_length` gauge.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync + 'static {
    fn incr_counter(&self, name: &str, value: u64, labels: Labels<'_>);
    fn observe_duration_ms(&self, name: &str, duration_ms: u64, labels: Labels<'_>);
    fn set_gauge(&self, name: &str, value: u64, labels: Labels<'_>);
}

/// Discards everything. The runner's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _: &str, _: u64, _: Labels<'_>) {}
    fn observe_duration_ms(&self, _: &str, _: u64, _: Labels<'_>) {}
    fn set_gauge(&self, _: &str, _: u64, _: Labels<'_>) {}
}

/// Aggregate of one duration series.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DurationStats {
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    fn record(&mut self, duration_ms: u64) {
        self.count = self.count.saturating_add(1);
        self.sum_ms = self.sum_ms.saturating_add(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
    }

    pub fn mean_ms(&self) -> u64 {
        self.sum_ms.checked_div(self.count).unwrap_or(0)
    }
}

/// Point-in-time copy of an [`InMemoryMetrics`], sorted by series key.
#[derive(Debug, Default, Clone)]
pub struct MetricsReport {
    pub counters: Vec<(String, u64)>,
    pub gauges: Vec<(String, u64)>,
    pub durations: Vec<(String, DurationStats)>,
}

impl MetricsReport {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty() && self.durations.is_empty()
    }
}

/// Process-local metrics, keyed by [`format_metric_key`].
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, u64>,
    durations: DashMap<String, DurationStats>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&format_metric_key(name, labels))
            .map_or(0, |v| *v)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<u64> {
        self.gauges.get(&format_metric_key(name, labels)).map(|v| *v)
    }

    pub fn duration(&self, name: &str, labels: Labels<'_>) -> Option<DurationStats> {
        self.durations
            .get(&format_metric_key(name, labels))
            .map(|v| *v)
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            counters: sorted(&self.counters),
            gauges: sorted(&self.gauges),
            durations: sorted(&self.durations),
        }
    }
}

fn sorted<V: Copy>(map: &DashMap<String, V>) -> Vec<(String, V)> {
    let mut items: Vec<_> = map.iter().map(|e| (e.key().clone(), *e.value())).collect();
    items.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    items
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        let mut entry = self.counters.entry(format_metric_key(name, labels)).or_insert(0);
        *entry = entry.saturating_add(value);
    }

    fn observe_duration_ms(&self, name: &str, duration_ms: u64, labels: Labels<'_>) {
        self.durations
            .entry(format_metric_key(name, labels))
            .or_default()
            .record(duration_ms);
    }

    fn set_gauge(&self, name: &str, value: u64, labels: Labels<'_>) {
        self.gauges.insert(format_metric_key(name, labels), value);
    }
}

/// Logs a [`MetricsReport`] every `interval` until `token` is cancelled.
pub fn spawn_metrics_log_reporter(
    metrics: Arc<InMemoryMetrics>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately and there is nothing to report yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = metrics.report();
            if report.is_empty() {
                continue;
            }
            for (key, value) in &report.counters {
                info!(target: "parley::metrics", "counter {} = {}", key, value);
            }
            for (key, value) in &report.gauges {
                info!(target: "parley::metrics", "gauge {} = {}", key, value);
            }
            for (key, stats) in &report.durations {
                info!(
                    target: "parley::metrics",
                    "duration {} count={} mean_ms={} max_ms={}",
                    key,
                    stats.count,
                    stats.mean_ms(),
                    stats.max_ms
                );
            }
        }
    })
}

/// `name{k1=v1,k2=v2}` with labels sorted by key, or just `name` without labels.
pub fn format_metric_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }

    let mut sorted_labels = labels.to_vec();
    sorted_labels.sort_unstable_by_key(|(k, _)| *k);

    let mut key = String::from(name);
    key.push('{');
    for (idx, (k, v)) in sorted_labels.into_iter().enumerate() {
        let sep = if idx == 0 { "" } else { "," };
        let _ = write!(key, "{sep}{k}={v}");
    }
    key.push('}');
    key
}

pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_key_has_stable_label_order() {
        let a = format_metric_key(
            "commands_executed_total",
            &[("command", "echo"), ("bot_type", "slack")],
        );
        let b = format_metric_key(
            "commands_executed_total",
            &[("bot_type", "slack"), ("command", "echo")],
        );
        assert_eq!(a, b);
        assert_eq!(a, "commands_executed_total{bot_type=slack,command=echo}");
        assert_eq!(format_metric_key("worker_panics_total", &[]), "worker_panics_total");
    }

    #[test]
    fn in_memory_metrics_accumulates_values() {
        let metrics = InMemoryMetrics::new();
        metrics.incr_counter("inputs_total", 1, &[("bot_type", "slack")]);
        metrics.incr_counter("inputs_total", 2, &[("bot_type", "slack")]);
        metrics.observe_duration_ms("command_duration_ms", 10, &[]);
        metrics.observe_duration_ms("command_duration_ms", 40, &[]);
        metrics.set_gauge("worker_queue_length", 3, &[]);
        metrics.set_gauge("worker_queue_length", 1, &[]);

        assert_eq!(metrics.counter("inputs_total", &[("bot_type", "slack")]), 3);
        assert_eq!(metrics.counter("inputs_total", &[("bot_type", "discord")]), 0);
        assert_eq!(metrics.gauge("worker_queue_length", &[]), Some(1));

        let stats = metrics.duration("command_duration_ms", &[]).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum_ms, 50);
        assert_eq!(stats.max_ms, 40);
        assert_eq!(stats.mean_ms(), 25);

        let report = metrics.report();
        assert_eq!(report.counters.len(), 1);
        assert_eq!(report.durations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_cancel() {
        let token = CancellationToken::new();
        let handle = spawn_metrics_log_reporter(
            Arc::new(InMemoryMetrics::new()),
            Duration::from_secs(1),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
