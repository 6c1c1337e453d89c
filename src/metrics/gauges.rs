//! Gauges for values that move both ways.

use super::counters::format_labels;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Integer gauge.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Floating-point gauge stored as raw bits.
#[derive(Debug)]
pub struct FloatGauge {
    name: &'static str,
    help: &'static str,
    bits: AtomicU64,
}

impl FloatGauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            bits: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Integer gauge split by labels, e.g. one series per shard.
#[derive(Debug)]
pub struct LabeledGauge<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    series: RwLock<HashMap<[String; N], AtomicI64>>,
}

impl<const N: usize> LabeledGauge<N> {
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, labels: [&str; N], value: i64) {
        let key: [String; N] = labels.map(str::to_string);
        if let Some(gauge) = self.series.read().get(&key) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.series
            .write()
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get(&self, labels: [&str; N]) -> Option<i64> {
        let key: [String; N] = labels.map(str::to_string);
        self.series
            .read()
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
    }

    /// Drop a series, e.g. when its shard leaves the cluster.
    pub fn remove(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(str::to_string);
        self.series.write().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let mut all: Vec<_> = self
            .series
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        for (labels, value) in all {
            let _ = writeln!(
                out,
                "{}{{{}}} {}",
                self.name,
                format_labels(&self.label_names, &labels),
                value
            );
        }
    }
}
