//! Monotonic counters, plain and labeled.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append the text exposition of this counter to `out`.
    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// A counter split by a fixed set of label names.
///
/// Series are created on first increment. The read lock is tried first so
/// that the hot path for an existing series never takes the write lock.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    series: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(str::to_string);
        if let Some(counter) = self.series.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.series
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Value of one series; zero if it was never incremented.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(str::to_string);
        self.series
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum across all series.
    pub fn total(&self) -> u64 {
        self.series
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// All series sorted by label values.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        let mut all: Vec<_> = self
            .series
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }

    pub fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        for (labels, value) in self.get_all() {
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

/// `a="x",b="y"` for exposition output.
pub(crate) fn format_labels<const N: usize>(names: &[&'static str; N], values: &[String; N]) -> String {
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{}=\"{}\"", n, v.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}
