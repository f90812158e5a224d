//! Monotonic counters for donor lifecycle events.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Count of one kind of event since the process started.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Metric name used in the exposition output.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Add `n` events at once, e.g. one final marker per participant.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append this counter in Prometheus text format.
    pub fn expose(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// A counter partitioned by a single label value, e.g. the phase an
/// instance transitioned into.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: DashMap::new(),
        }
    }

    /// Increment the series for `value`, creating it on first use.
    pub fn inc(&self, value: &str) {
        if let Some(counter) = self.values.get(value) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(value.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count recorded for `value`, zero if never seen.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All label values with their counts, sorted by label value.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }

    /// Append every series in Prometheus text format, one line per label
    /// value.
    pub fn expose(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        for (value, count) in self.get_all() {
            let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", self.name, self.label, value, count);
        }
    }
}
