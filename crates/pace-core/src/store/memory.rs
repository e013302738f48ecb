use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::election::{ElectionRegistry, LeaderLatch};
use crate::store::traits::{CoordinationStore, Versioned};

/// In-memory coordination store for a single process. Several nodes sharing
/// one instance (through an `Arc`) behave like a cluster on one ensemble.
pub struct MemoryCoordinator {
    nodes: Mutex<BTreeMap<String, Versioned>>,
    elections: ElectionRegistry,
    available: AtomicBool,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            elections: ElectionRegistry::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// `StoreError::Unavailable`. Elections already joined are unaffected.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn elections(&self) -> &ElectionRegistry {
        &self.elections
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory coordinator offline".to_string()))
        }
    }
}

impl CoordinationStore for MemoryCoordinator {
    fn get(&self, path: &str) -> StoreResult<Option<Versioned>> {
        self.check_available()?;
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.get(path).cloned())
    }

    fn compare_and_set(
        &self,
        path: &str,
        value: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let found = nodes.get(path).map(|v| v.version);
        if found != expected_version {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected_version,
                found,
            });
        }
        let version = found.unwrap_or(0) + 1;
        nodes.insert(
            path.to_string(),
            Versioned {
                value: value.to_vec(),
                version,
            },
        );
        Ok(version)
    }

    fn set(&self, path: &str, value: &[u8]) -> StoreResult<u64> {
        self.check_available()?;
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let version = nodes.get(path).map_or(0, |v| v.version) + 1;
        nodes.insert(
            path.to_string(),
            Versioned {
                value: value.to_vec(),
                version,
            },
        );
        Ok(version)
    }

    fn list_children(&self, parent: &str) -> StoreResult<BTreeSet<String>> {
        self.check_available()?;
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let children = nodes
            .range(prefix.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(&prefix))
            .filter_map(|path| path[prefix.len()..].split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        self.check_available()?;
        let path = path.trim_end_matches('/');
        let prefix = format!("{path}/");
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }

    fn join_election(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch> {
        self.check_available()?;
        Ok(self.elections.join(path, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_start_at_one_and_increment() {
        let store = MemoryCoordinator::new();
        assert_eq!(store.set("/a", b"1").unwrap(), 1);
        assert_eq!(store.set("/a", b"2").unwrap(), 2);
        let node = store.get("/a").unwrap().unwrap();
        assert_eq!(node.version, 2);
        assert_eq!(node.value, b"2");
    }

    #[test]
    fn compare_and_set_rejects_stale_version() {
        let store = MemoryCoordinator::new();
        assert_eq!(store.compare_and_set("/a", b"x", None).unwrap(), 1);

        let err = store.compare_and_set("/a", b"y", None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: None,
                found: Some(1),
                ..
            }
        ));

        assert_eq!(store.compare_and_set("/a", b"y", Some(1)).unwrap(), 2);
        assert_eq!(store.get("/a").unwrap().unwrap().value, b"y");
    }

    #[test]
    fn list_children_returns_direct_children_only() {
        let store = MemoryCoordinator::new();
        store.set("/r/s/c1/history", b"").unwrap();
        store.set("/r/s/c1/max-rate", b"").unwrap();
        store.set("/r/s/c2/history", b"").unwrap();
        store.set("/r/sx/c3/history", b"").unwrap();

        let children = store.list_children("/r/s").unwrap();
        assert_eq!(
            children.into_iter().collect::<Vec<_>>(),
            vec!["c1".to_string(), "c2".to_string()]
        );
        assert!(store.list_children("/r/missing").unwrap().is_empty());
    }

    #[test]
    fn delete_recursive_removes_subtree_only() {
        let store = MemoryCoordinator::new();
        store.set("/r/s/c1/history", b"").unwrap();
        store.set("/r/s/c1/max-rate", b"").unwrap();
        store.set("/r/s/c10/history", b"").unwrap();

        store.delete_recursive("/r/s/c1").unwrap();

        assert!(store.get("/r/s/c1/history").unwrap().is_none());
        assert!(store.get("/r/s/c1/max-rate").unwrap().is_none());
        assert!(store.get("/r/s/c10/history").unwrap().is_some());
    }

    #[test]
    fn unavailable_store_fails_every_operation() {
        let store = MemoryCoordinator::new();
        store.set("/a", b"1").unwrap();
        store.set_available(false);

        assert!(matches!(store.get("/a"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.set("/a", b"2"), Err(StoreError::Unavailable(_))));
        assert!(store.join_election("/leader", "n1").is_err());

        store.set_available(true);
        assert_eq!(store.get("/a").unwrap().unwrap().value, b"1");
    }
}
