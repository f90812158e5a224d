//! Per-namespace exclusive locks for catalog-changing units.

use crate::types::Namespace;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<Namespace, Arc<Mutex<()>>>;

/// Table of namespace locks shared by every instance on a node. An entry
/// exists only while some caller holds or waits for its lock.
#[derive(Debug, Default)]
pub struct NamespaceLocks {
    locks: Arc<LockTable>,
}

/// Holds one or more namespace locks until dropped.
#[derive(Debug)]
pub struct NamespaceGuard {
    namespaces: Vec<Namespace>,
    guards: Vec<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl NamespaceGuard {
    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        self.guards.clear();
        // Waiters hold their own clone of the mutex, so an entry with no
        // other reference is idle.
        for ns in &self.namespaces {
            self.table
                .remove_if(ns, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, ns: &Namespace) -> Arc<Mutex<()>> {
        self.locks
            .entry(ns.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock every namespace in `namespaces`. Locks are taken in sorted order
    /// so two callers locking overlapping sets cannot deadlock.
    pub async fn lock(&self, namespaces: &[&Namespace]) -> NamespaceGuard {
        let mut sorted: Vec<Namespace> = namespaces.iter().map(|ns| (*ns).clone()).collect();
        sorted.sort();
        sorted.dedup();

        let mut guard = NamespaceGuard {
            namespaces: Vec::with_capacity(sorted.len()),
            guards: Vec::with_capacity(sorted.len()),
            table: self.locks.clone(),
        };
        for ns in sorted {
            let lock = self.entry(&ns);
            guard.namespaces.push(ns);
            guard.guards.push(lock.lock_owned().await);
        }
        guard
    }

    /// Whether `ns` is currently held.
    pub fn is_locked(&self, ns: &Namespace) -> bool {
        match self.locks.get(ns) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Namespaces with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_log::test;

    #[test(tokio::test)]
    async fn test_lock_is_exclusive() {
        let locks = Arc::new(NamespaceLocks::new());
        let a = Namespace::new("db", "a");
        let b = Namespace::new("db", "b");

        let guard = locks.lock(&[&b, &a, &a]).await;
        assert_eq!(guard.namespaces(), &[a.clone(), b.clone()]);
        assert!(locks.is_locked(&a));

        let contender = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&[&a]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert!(!locks.is_locked(&a));
        assert!(!locks.is_locked(&b));
    }

    #[test(tokio::test)]
    async fn test_idle_entries_are_removed() {
        let locks = Arc::new(NamespaceLocks::new());
        let a = Namespace::new("db", "a");
        let b = Namespace::new("db", "b");

        let guard = locks.lock(&[&a, &b]).await;
        assert_eq!(locks.len(), 2);

        // A waiter on `a` keeps its entry alive past the first release.
        let waiter = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&[&a]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());

        // Dropped namespaces do not accumulate across units.
        for i in 0..10 {
            let ns = Namespace::new("db", format!("tmp{i}"));
            drop(locks.lock(&[&ns]).await);
        }
        assert!(locks.is_empty());
    }
}
