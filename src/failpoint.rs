//! Failpoint injection for leadership-change and retry testing.
//!
//! Donor instances consult a [`FailpointRegistry`] immediately before
//! committing each transition unit. A test can freeze an instance at an exact
//! phase boundary with [`FailpointAction::Pause`], step the node down while it
//! is parked, and then check that the resumed instance neither skips nor
//! repeats the boundary's side effects.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard_donor::failpoint::{FailpointRegistry, FailpointAction, pause_before_transition};
//! use reshard_donor::donor::DonorPhase;
//!
//! let registry = FailpointRegistry::new();
//! let name = pause_before_transition(DonorPhase::BlockingWrites);
//! registry.enable(&name, FailpointAction::Pause);
//!
//! // ... drive the instance until it parks ...
//! registry.wait_for_hit(&name, 1).await;
//!
//! registry.disable(&name);
//! ```

use crate::donor::DonorPhase;
use crate::error::{Error, Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Name of the failpoint checked right before the unit that moves an
/// instance into `phase` is committed.
pub fn pause_before_transition(phase: DonorPhase) -> String {
    format!("pause_before_transition_to_{}", phase)
}

/// Action to take when a failpoint is hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailpointAction {
    /// Suspend the caller until the failpoint is disabled.
    Pause,

    /// Sleep for the specified duration, then continue.
    Sleep(Duration),

    /// Fail the next N hits with a transient storage error.
    Error(u64),
}

/// Internal state for a failpoint.
struct FailpointState {
    action: FailpointAction,
    hits: watch::Sender<u64>,
    triggered_count: AtomicU64,
    released: watch::Sender<bool>,
}

impl FailpointState {
    fn new(action: FailpointAction) -> Self {
        Self {
            action,
            hits: watch::channel(0).0,
            triggered_count: AtomicU64::new(0),
            released: watch::channel(false).0,
        }
    }

    fn record_hit(&self) -> u64 {
        let mut hit = 0;
        self.hits.send_modify(|h| {
            *h += 1;
            hit = *h;
        });
        hit
    }
}

/// Registry for managing failpoints.
///
/// Owned by whoever builds the donor registry and shared by `Arc`, so
/// concurrent tests never see each other's failpoints.
pub struct FailpointRegistry {
    failpoints: RwLock<HashMap<String, Arc<FailpointState>>>,

    /// Global enable/disable flag.
    enabled: AtomicBool,

    /// Total hits across all failpoints.
    total_hits: AtomicU64,
}

impl std::fmt::Debug for FailpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailpointRegistry")
            .field("failpoints", &self.list())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Default for FailpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FailpointRegistry {
    /// Create a new failpoint registry.
    pub fn new() -> Self {
        Self {
            failpoints: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            total_hits: AtomicU64::new(0),
        }
    }

    /// Enable a failpoint with the given action, replacing any existing one.
    pub fn enable(&self, name: &str, action: FailpointAction) {
        let previous = self
            .failpoints
            .write()
            .insert(name.to_string(), Arc::new(FailpointState::new(action)));
        if let Some(previous) = previous {
            previous.released.send_replace(true);
        }
    }

    /// Disable a specific failpoint, releasing anything paused on it.
    pub fn disable(&self, name: &str) {
        if let Some(state) = self.failpoints.write().remove(name) {
            state.released.send_replace(true);
        }
    }

    /// Disable all failpoints.
    pub fn disable_all(&self) {
        for (_, state) in self.failpoints.write().drain() {
            state.released.send_replace(true);
        }
    }

    /// Globally enable/disable all failpoints.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Check if globally enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn lookup(&self, name: &str) -> Option<Arc<FailpointState>> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        self.failpoints.read().get(name).cloned()
    }

    /// Check a failpoint and execute its action if enabled.
    ///
    /// `Pause` suspends until the failpoint is disabled. Callers that must
    /// stay cancellable should race this future against their token.
    pub async fn check(&self, name: &str) -> Result<()> {
        let state = match self.lookup(name) {
            Some(s) => s,
            None => return Ok(()),
        };

        let hit = state.record_hit();
        self.total_hits.fetch_add(1, Ordering::Relaxed);

        match &state.action {
            FailpointAction::Pause => {
                state.triggered_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(failpoint = name, hit, "failpoint paused");
                let mut released = state.released.subscribe();
                // The sender lives in `state`, which this frame keeps alive.
                let _ = released.wait_for(|r| *r).await;
                Ok(())
            }

            FailpointAction::Sleep(duration) => {
                state.triggered_count.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(*duration).await;
                Ok(())
            }

            FailpointAction::Error(n) => {
                if hit <= *n {
                    state.triggered_count.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::Storage(StorageError::Transient(format!(
                        "failpoint {} (hit {})",
                        name, hit
                    ))));
                }
                Ok(())
            }
        }
    }

    /// Wait until the named failpoint has been hit at least `count` times.
    ///
    /// Returns immediately if the failpoint is not enabled.
    pub async fn wait_for_hit(&self, name: &str, count: u64) {
        let state = match self.failpoints.read().get(name).cloned() {
            Some(s) => s,
            None => return,
        };
        let mut hits = state.hits.subscribe();
        let _ = hits.wait_for(|h| *h >= count).await;
    }

    /// Get statistics for a failpoint.
    pub fn stats(&self, name: &str) -> Option<FailpointStats> {
        self.failpoints.read().get(name).map(|state| FailpointStats {
            hit_count: *state.hits.borrow(),
            triggered_count: state.triggered_count.load(Ordering::Relaxed),
        })
    }

    /// Get total hits across all failpoints.
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    /// List all active failpoints.
    pub fn list(&self) -> Vec<String> {
        self.failpoints.read().keys().cloned().collect()
    }
}

/// Statistics for a failpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailpointStats {
    /// Number of times the failpoint was hit.
    pub hit_count: u64,

    /// Number of times the failpoint actually triggered an action.
    pub triggered_count: u64,
}
