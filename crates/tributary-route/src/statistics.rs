//! Per-channel routing statistics in Prometheus text exposition format.

use dashmap::DashMap;

/// Receives routing statistics as a run progresses.
pub trait StatisticsSink: Send + Sync {
    /// Rows routed to at least one batch.
    fn increment_data_routed(&self, channel_id: &str, count: u64);
    /// Batch rows written (one row may land in several batches).
    fn increment_data_events(&self, channel_id: &str, count: u64);
    /// Rows skipped as corrupt.
    fn increment_data_errors(&self, channel_id: &str, count: u64);
    /// Rows still waiting in the change log after a run.
    fn set_data_unrouted(&self, channel_id: &str, count: u64);
    /// Wall time of one channel's run.
    fn record_route_time(&self, channel_id: &str, elapsed_ms: u64);
}

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "tributary_route_data_routed_total").
    pub name: String,
    /// Help text.
    pub help: String,
    /// "counter" or "gauge".
    pub metric_type: String,
    /// Label pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// A counter.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// A gauge.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// The sample line, without `HELP`/`TYPE` header.
    pub fn sample(&self) -> String {
        if self.labels.is_empty() {
            return format!("{} {}\n", self.name, self.format_value());
        }
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}} {}\n", self.name, labels, self.format_value())
    }

    /// Header and sample.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&self.sample());
        output
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

/// Running totals for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    /// Rows routed.
    pub data_routed: u64,
    /// Batch rows written.
    pub data_events: u64,
    /// Corrupt rows skipped.
    pub data_errors: u64,
    /// Rows waiting after the last run.
    pub data_unrouted: u64,
    /// Total routing time.
    pub route_time_ms: u64,
    /// Completed runs.
    pub runs: u64,
}

/// In-process [`StatisticsSink`] keyed by channel.
#[derive(Debug, Default)]
pub struct ChannelStatistics {
    channels: DashMap<String, ChannelCounters>,
}

impl ChannelStatistics {
    /// Empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals of one channel.
    pub fn get(&self, channel_id: &str) -> ChannelCounters {
        self.channels
            .get(channel_id)
            .map(|c| *c.value())
            .unwrap_or_default()
    }

    fn update(&self, channel_id: &str, f: impl FnOnce(&mut ChannelCounters)) {
        let mut entry = self.channels.entry(channel_id.to_string()).or_default();
        f(entry.value_mut());
    }

    /// Every metric, channels sorted by id.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let mut channels: Vec<(String, ChannelCounters)> = self
            .channels
            .iter()
            .map(|c| (c.key().clone(), *c.value()))
            .collect();
        channels.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metrics = Vec::with_capacity(channels.len() * 6);
        for (channel_id, c) in channels {
            let labels = vec![("channel_id".to_string(), channel_id)];
            metrics.push(Metric::counter(
                "tributary_route_data_routed_total",
                "Rows routed to outgoing batches",
                labels.clone(),
                c.data_routed as f64,
            ));
            metrics.push(Metric::counter(
                "tributary_route_data_events_total",
                "Batch rows written",
                labels.clone(),
                c.data_events as f64,
            ));
            metrics.push(Metric::counter(
                "tributary_route_data_errors_total",
                "Corrupt change rows skipped",
                labels.clone(),
                c.data_errors as f64,
            ));
            metrics.push(Metric::gauge(
                "tributary_route_data_unrouted",
                "Change rows waiting to be routed",
                labels.clone(),
                c.data_unrouted as f64,
            ));
            metrics.push(Metric::counter(
                "tributary_route_time_ms_total",
                "Time spent routing",
                labels.clone(),
                c.route_time_ms as f64,
            ));
            metrics.push(Metric::counter(
                "tributary_route_runs_total",
                "Completed routing runs",
                labels,
                c.runs as f64,
            ));
        }
        metrics
    }

    /// Prometheus text, one `HELP`/`TYPE` header per metric name.
    pub fn format_prometheus(&self) -> String {
        let mut metrics = self.to_metrics();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        let mut output = String::new();
        let mut last_name: Option<String> = None;
        for metric in metrics {
            if last_name.as_deref() != Some(metric.name.as_str()) {
                output.push_str(&format!("# HELP {} {}\n", metric.name, metric.help));
                output.push_str(&format!("# TYPE {} {}\n", metric.name, metric.metric_type));
                last_name = Some(metric.name.clone());
            }
            output.push_str(&metric.sample());
        }
        output
    }
}

impl StatisticsSink for ChannelStatistics {
    fn increment_data_routed(&self, channel_id: &str, count: u64) {
        self.update(channel_id, |c| c.data_routed += count);
    }

    fn increment_data_events(&self, channel_id: &str, count: u64) {
        self.update(channel_id, |c| c.data_events += count);
    }

    fn increment_data_errors(&self, channel_id: &str, count: u64) {
        self.update(channel_id, |c| c.data_errors += count);
    }

    fn set_data_unrouted(&self, channel_id: &str, count: u64) {
        self.update(channel_id, |c| c.data_unrouted = count);
    }

    fn record_route_time(&self, channel_id: &str, elapsed_ms: u64) {
        self.update(channel_id, |c| {
            c.route_time_ms += elapsed_ms;
            c.runs += 1;
        });
    }
}
