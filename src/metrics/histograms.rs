//! Bucketed histograms for latencies and sizes.

use super::counters::format_labels;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency buckets in seconds.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Buckets for fan-out width, in shards.
pub const FANOUT_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];

/// Cumulative histogram. Bucket `i` counts observations `<= buckets[i]`.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(name, help, LATENCY_BUCKETS.to_vec())
    }

    pub fn with_buckets(name: &'static str, help: &'static str, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(f64::total_cmp);
        buckets.dedup();
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            help,
            buckets,
            counts,
            sum_bits: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (upper, count) in self.buckets.iter().zip(&self.counts) {
            if value <= *upper {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            sum: f64::from_bits(self.sum_bits.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);
        self.snapshot().render_series(self.name, "", out);
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Approximate percentile by linear interpolation inside the bucket.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((self.count as f64 * p / 100.0).ceil() as u64).max(1);
        let mut prev_count = 0;
        let mut prev_upper = 0.0;
        for (upper, &count) in self.buckets.iter().zip(&self.bucket_counts) {
            if count >= target {
                let in_bucket = count - prev_count;
                if in_bucket == 0 {
                    return *upper;
                }
                let position = (target - prev_count) as f64 / in_bucket as f64;
                return prev_upper + position * (upper - prev_upper);
            }
            prev_count = count;
            prev_upper = *upper;
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    fn render_series(&self, name: &str, labels: &str, out: &mut String) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (upper, count) in self.buckets.iter().zip(&self.bucket_counts) {
            let _ = writeln!(out, "{}_bucket{{{}{}le=\"{}\"}} {}", name, labels, sep, upper, count);
        }
        let _ = writeln!(out, "{}_bucket{{{}{}le=\"+Inf\"}} {}", name, labels, sep, self.count);
        if labels.is_empty() {
            let _ = writeln!(out, "{}_sum {}", name, self.sum);
            let _ = writeln!(out, "{}_count {}", name, self.count);
        } else {
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, self.sum);
            let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, self.count);
        }
    }
}

/// Histogram split by labels, e.g. routing latency per strategy.
#[derive(Debug)]
pub struct LabeledHistogram<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    buckets: Vec<f64>,
    series: RwLock<HashMap<[String; N], Histogram>>,
}

impl<const N: usize> LabeledHistogram<N> {
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            buckets: LATENCY_BUCKETS.to_vec(),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe_duration(&self, labels: [&str; N], duration: Duration) {
        let key: [String; N] = labels.map(str::to_string);
        if let Some(h) = self.series.read().get(&key) {
            h.observe_duration(duration);
            return;
        }
        self.series
            .write()
            .entry(key)
            .or_insert_with(|| Histogram::with_buckets(self.name, self.help, self.buckets.clone()))
            .observe_duration(duration);
    }

    pub fn snapshot(&self, labels: [&str; N]) -> Option<HistogramSnapshot> {
        let key: [String; N] = labels.map(str::to_string);
        self.series.read().get(&key).map(Histogram::snapshot)
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);
        let mut all: Vec<_> = self
            .series
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        for (labels, snap) in all {
            snap.render_series(self.name, &format_labels(&self.label_names, &labels), out);
        }
    }
}
