//! Metrics for donor observability.
//!
//! Prometheus-style counters and gauges tracking donor instance lifecycles:
//! how many operations started, resumed after a step-up, finished, aborted or
//! were interrupted by a step-down, and how many replication-log markers and
//! storage retries the instances produced.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard_donor::metrics::DonorMetrics;
//!
//! let metrics = DonorMetrics::new();
//! metrics.record_started();
//! metrics.record_transition("donating_initial_data");
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.active, 1);
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Metrics for donor instances on one node.
#[derive(Debug)]
pub struct DonorMetrics {
    /// Instances currently registered.
    pub instances_active: Gauge,
    /// Operations created through intake.
    pub operations_started: Counter,
    /// Instances rebuilt from a persisted record.
    pub operations_resumed: Counter,
    /// Operations that reached Done without abort.
    pub operations_completed: Counter,
    /// Operations that reached Done via abort.
    pub operations_aborted: Counter,
    /// Instances discarded by a step-down.
    pub operations_interrupted: Counter,
    /// Instances that resolved with a fatal error.
    pub operations_failed: Counter,
    /// Phase transitions, labeled by target phase.
    pub transitions: LabeledCounter,
    /// Boundary markers written on entering DonatingLogEntries.
    pub boundary_markers: Counter,
    /// Per-participant final markers written in BlockingWrites.
    pub final_markers: Counter,
    /// Retries of transient storage or bridge failures.
    pub retries: Counter,
}

impl DonorMetrics {
    /// Create new donor metrics.
    pub fn new() -> Self {
        Self {
            instances_active: Gauge::new("donor_instances_active", "Number of active donor instances"),
            operations_started: Counter::new("donor_operations_started", "Total operations created"),
            operations_resumed: Counter::new("donor_operations_resumed", "Total operations resumed from storage"),
            operations_completed: Counter::new("donor_operations_completed", "Total operations committed"),
            operations_aborted: Counter::new("donor_operations_aborted", "Total operations aborted"),
            operations_interrupted: Counter::new("donor_operations_interrupted", "Total instances interrupted by step-down"),
            operations_failed: Counter::new("donor_operations_failed", "Total instances failed fatally"),
            transitions: LabeledCounter::new("donor_transitions", "Phase transitions", "to_phase"),
            boundary_markers: Counter::new("donor_boundary_markers", "Boundary markers written"),
            final_markers: Counter::new("donor_final_markers", "Final markers written"),
            retries: Counter::new("donor_retries", "Retried transient failures"),
        }
    }

    /// Record a newly created operation.
    pub fn record_started(&self) {
        self.operations_started.inc();
        self.instances_active.inc();
    }

    /// Record an instance rebuilt from a persisted record.
    pub fn record_resumed(&self) {
        self.operations_resumed.inc();
        self.instances_active.inc();
    }

    /// Record a durable phase transition.
    pub fn record_transition(&self, to_phase: &str) {
        self.transitions.inc(to_phase);
    }

    /// Record the end of an instance that resolved OK.
    pub fn record_finished(&self, aborted: bool) {
        if aborted {
            self.operations_aborted.inc();
        } else {
            self.operations_completed.inc();
        }
        self.instances_active.dec();
    }

    /// Record an instance discarded by step-down.
    pub fn record_interrupted(&self) {
        self.operations_interrupted.inc();
        self.instances_active.dec();
    }

    /// Record an instance that resolved with a fatal error.
    pub fn record_failed(&self) {
        self.operations_failed.inc();
        self.instances_active.dec();
    }

    pub fn record_boundary_marker(&self) {
        self.boundary_markers.inc();
    }

    pub fn record_final_markers(&self, n: u64) {
        self.final_markers.inc_by(n);
    }

    pub fn record_retry(&self) {
        self.retries.inc();
    }

    /// Get a snapshot of donor metrics.
    pub fn snapshot(&self) -> DonorMetricsSnapshot {
        DonorMetricsSnapshot {
            active: self.instances_active.get().max(0) as u64,
            started: self.operations_started.get(),
            resumed: self.operations_resumed.get(),
            completed: self.operations_completed.get(),
            aborted: self.operations_aborted.get(),
            interrupted: self.operations_interrupted.get(),
            failed: self.operations_failed.get(),
            boundary_markers: self.boundary_markers.get(),
            final_markers: self.final_markers.get(),
            retries: self.retries.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        self.instances_active.expose(&mut output);
        for counter in [
            &self.operations_started,
            &self.operations_resumed,
            &self.operations_completed,
            &self.operations_aborted,
            &self.operations_interrupted,
            &self.operations_failed,
            &self.boundary_markers,
            &self.final_markers,
            &self.retries,
        ] {
            counter.expose(&mut output);
        }
        self.transitions.expose(&mut output);

        output
    }
}

impl Default for DonorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`DonorMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DonorMetricsSnapshot {
    pub active: u64,
    pub started: u64,
    pub resumed: u64,
    pub completed: u64,
    pub aborted: u64,
    pub interrupted: u64,
    pub failed: u64,
    pub boundary_markers: u64,
    pub final_markers: u64,
    pub retries: u64,
}
