// =====================================================================================
// WEBHOOK METRICS - COUNTERS & LATENCY HISTOGRAMS
// =====================================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

pub const WEBHOOK_REQUESTS_TOTAL: &str = "whatsapp_webhook_requests_total";
pub const WEBHOOK_ERRORS_TOTAL: &str = "whatsapp_webhook_errors_total";
pub const WEBHOOK_LATENCY_SECONDS: &str = "whatsapp_webhook_latency_seconds";
pub const VERIFICATION_TOTAL: &str = "whatsapp_verification_total";

const HISTOGRAM_WINDOW: usize = 1000;

/// Sink for counters and histograms keyed by endpoint + status.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, endpoint: &str, status: &str);
    fn observe_histogram(&self, name: &str, endpoint: &str, status: &str, value: f64);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    endpoint: String,
    status: String,
}

impl SeriesKey {
    fn new(name: &str, endpoint: &str, status: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            status: status.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    window: VecDeque<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub name: String,
    pub endpoint: String,
    pub status: String,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub name: String,
    pub endpoint: String,
    pub status: String,
    pub count: u64,
    pub sum: f64,
    pub average: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub counters: Vec<CounterSnapshot>,
    pub histograms: Vec<HistogramSnapshot>,
}

#[derive(Debug)]
pub struct WebhookMetrics {
    counters: DashMap<SeriesKey, AtomicU64>,
    histograms: DashMap<SeriesKey, Histogram>,
    start_time: Instant,
}

impl Default for WebhookMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookMetrics {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            histograms: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn counter_value(&self, name: &str, endpoint: &str, status: &str) -> u64 {
        self.counters
            .get(&SeriesKey::new(name, endpoint, status))
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<CounterSnapshot> = self.counters.iter()
            .map(|entry| CounterSnapshot {
                name: entry.key().name.clone(),
                endpoint: entry.key().endpoint.clone(),
                status: entry.key().status.clone(),
                value: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        counters.sort_by(|a, b| (&a.name, &a.endpoint, &a.status).cmp(&(&b.name, &b.endpoint, &b.status)));

        let mut histograms: Vec<HistogramSnapshot> = self.histograms.iter()
            .map(|entry| {
                let histogram = entry.value();
                let mut sorted: Vec<f64> = histogram.window.iter().copied().collect();
                sorted.sort_by(|a, b| a.total_cmp(b));

                HistogramSnapshot {
                    name: entry.key().name.clone(),
                    endpoint: entry.key().endpoint.clone(),
                    status: entry.key().status.clone(),
                    count: histogram.count,
                    sum: histogram.sum,
                    average: if histogram.count > 0 { histogram.sum / histogram.count as f64 } else { 0.0 },
                    p50: percentile(&sorted, 0.50),
                    p95: percentile(&sorted, 0.95),
                }
            })
            .collect();
        histograms.sort_by(|a, b| (&a.name, &a.endpoint, &a.status).cmp(&(&b.name, &b.endpoint, &b.status)));

        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            counters,
            histograms,
        }
    }
}

impl MetricsSink for WebhookMetrics {
    fn increment_counter(&self, name: &str, endpoint: &str, status: &str) {
        self.counters
            .entry(SeriesKey::new(name, endpoint, status))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn observe_histogram(&self, name: &str, endpoint: &str, status: &str, value: f64) {
        let mut histogram = self.histograms
            .entry(SeriesKey::new(name, endpoint, status))
            .or_default();

        histogram.count += 1;
        histogram.sum += value;
        histogram.window.push_back(value);
        if histogram.window.len() > HISTOGRAM_WINDOW {
            histogram.window.pop_front();
        }
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
    sorted[index]
}
