//! External state that records every call.

use crate::donor::{CoordinatorUpdate, DonorExternalState};
use crate::error::{Error, Result};
use crate::types::{Namespace, ShardId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// [`DonorExternalState`] that records calls for assertions and can fail
/// coordinator updates on demand.
#[derive(Debug)]
pub struct RecordingExternalState {
    shard_id: ShardId,
    updates: Mutex<Vec<CoordinatorUpdate>>,
    refreshed: Mutex<Vec<Namespace>>,
    flushed: Mutex<Vec<Namespace>>,
    fail_next_updates: AtomicU64,
}

impl RecordingExternalState {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            updates: Mutex::new(Vec::new()),
            refreshed: Mutex::new(Vec::new()),
            flushed: Mutex::new(Vec::new()),
            fail_next_updates: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` coordinator updates with a bridge error.
    pub fn fail_next_updates(&self, n: u64) {
        self.fail_next_updates.store(n, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<CoordinatorUpdate> {
        self.updates.lock().clone()
    }

    pub fn refreshed(&self) -> Vec<Namespace> {
        self.refreshed.lock().clone()
    }

    pub fn flushed(&self) -> Vec<Namespace> {
        self.flushed.lock().clone()
    }
}

#[async_trait::async_trait]
impl DonorExternalState for RecordingExternalState {
    fn my_shard_id(&self) -> ShardId {
        self.shard_id.clone()
    }

    async fn refresh_catalog_cache(&self, ns: &Namespace) -> Result<()> {
        self.refreshed.lock().push(ns.clone());
        Ok(())
    }

    async fn wait_for_collection_flush(&self, ns: &Namespace) -> Result<()> {
        self.flushed.lock().push(ns.clone());
        Ok(())
    }

    async fn update_coordinator(&self, update: CoordinatorUpdate) -> Result<()> {
        let failed = self
            .fail_next_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::External("coordinator unavailable".to_string()));
        }
        self.updates.lock().push(update);
        Ok(())
    }
}
