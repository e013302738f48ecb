use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch,
};

use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::store::election::{ElectionRegistry, LeaderLatch};
use crate::store::traits::{CoordinationStore, Versioned};

const CF_NODES: &str = "nodes";

const COLUMN_FAMILIES: &[&str] = &[CF_NODES];

/// Size of the big-endian version header stored before each payload.
const VERSION_LEN: usize = 8;

type DB = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed coordination store for a single node. Node values survive
/// restarts; elections are process-local.
pub struct RocksDbCoordinator {
    db: DB,
    // Serializes read-check-write sequences so versions stay monotonic.
    write_lock: Mutex<()>,
    elections: ElectionRegistry,
}

fn encode_node(version: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VERSION_LEN + value.len());
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode_node(path: &str, raw: &[u8]) -> StoreResult<Versioned> {
    if raw.len() < VERSION_LEN {
        return Err(StoreError::Serialization(format!(
            "node {path} is shorter than its version header"
        )));
    }
    let mut header = [0u8; VERSION_LEN];
    header.copy_from_slice(&raw[..VERSION_LEN]);
    Ok(Versioned {
        version: u64::from_be_bytes(header),
        value: raw[VERSION_LEN..].to_vec(),
    })
}

impl RocksDbCoordinator {
    /// Open or create a RocksDB database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            elections: ElectionRegistry::new(),
        })
    }

    pub fn elections(&self) -> &ElectionRegistry {
        &self.elections
    }

    /// Write bytes without the version header, as a torn write would.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, path: &str, raw: &[u8]) {
        let cf = self.db.cf_handle(CF_NODES).unwrap();
        self.db.put_cf(&cf, path.as_bytes(), raw).unwrap();
    }

    /// Version of the node at `path`. A node too short to carry a version
    /// counts as absent so writers can replace it.
    fn current_version(&self, path: &str) -> StoreResult<Option<u64>> {
        match self.get(path) {
            Ok(node) => Ok(node.map(|node| node.version)),
            Err(StoreError::Serialization(reason)) => {
                warn!(path, %reason, "overwriting corrupt node");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn put(&self, path: &str, version: u64, value: &[u8]) -> StoreResult<()> {
        let cf = self.db.cf_handle(CF_NODES).ok_or_else(|| {
            StoreError::RocksDb(format!("column family not found: {CF_NODES}"))
        })?;
        self.db.put_cf(&cf, path.as_bytes(), encode_node(version, value))?;
        Ok(())
    }

    /// Keys at or under `path`, in order.
    fn keys_under(&self, path: &str) -> StoreResult<Vec<Vec<u8>>> {
        let cf = self.db.cf_handle(CF_NODES).ok_or_else(|| {
            StoreError::RocksDb(format!("column family not found: {CF_NODES}"))
        })?;
        let prefix = path.as_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            if rest.is_empty() || rest[0] == b'/' {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }
}

impl CoordinationStore for RocksDbCoordinator {
    fn get(&self, path: &str) -> StoreResult<Option<Versioned>> {
        let cf = self.db.cf_handle(CF_NODES).ok_or_else(|| {
            StoreError::RocksDb(format!("column family not found: {CF_NODES}"))
        })?;
        match self.db.get_cf(&cf, path.as_bytes())? {
            Some(raw) => Ok(Some(decode_node(path, &raw)?)),
            None => Ok(None),
        }
    }

    fn compare_and_set(
        &self,
        path: &str,
        value: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let found = self.current_version(path)?;
        if found != expected_version {
            return Err(StoreError::Conflict {
                path: path.to_string(),
                expected: expected_version,
                found,
            });
        }
        let version = found.unwrap_or(0) + 1;
        self.put(path, version, value)?;
        Ok(version)
    }

    fn set(&self, path: &str, value: &[u8]) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.current_version(path)?.unwrap_or(0) + 1;
        self.put(path, version, value)?;
        Ok(version)
    }

    fn list_children(&self, parent: &str) -> StoreResult<BTreeSet<String>> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        let mut children = BTreeSet::new();
        for key in self.keys_under(parent.trim_end_matches('/'))? {
            let key = String::from_utf8_lossy(&key);
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                    children.insert(child.to_string());
                }
            }
        }
        Ok(children)
    }

    fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf = self.db.cf_handle(CF_NODES).ok_or_else(|| {
            StoreError::RocksDb(format!("column family not found: {CF_NODES}"))
        })?;
        let mut batch = WriteBatch::default();
        for key in self.keys_under(path.trim_end_matches('/'))? {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn join_election(&self, path: &str, candidate: &str) -> StoreResult<LeaderLatch> {
        Ok(self.elections.join(path, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (RocksDbCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbCoordinator::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn set_get_versions() {
        let (store, _dir) = test_store();
        assert!(store.get("/a").unwrap().is_none());
        assert_eq!(store.set("/a", b"one").unwrap(), 1);
        assert_eq!(store.set("/a", b"two").unwrap(), 2);

        let node = store.get("/a").unwrap().unwrap();
        assert_eq!(node.version, 2);
        assert_eq!(node.value, b"two");
    }

    #[test]
    fn compare_and_set_conflicts() {
        let (store, _dir) = test_store();
        store.compare_and_set("/a", b"x", None).unwrap();
        let err = store.compare_and_set("/a", b"y", Some(7)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: Some(1), .. }));
        assert_eq!(store.compare_and_set("/a", b"y", Some(1)).unwrap(), 2);
    }

    #[test]
    fn children_and_recursive_delete() {
        let (store, _dir) = test_store();
        store.set("/r/s/c1/history", b"").unwrap();
        store.set("/r/s/c1/max-rate", b"").unwrap();
        store.set("/r/s/c2/history", b"").unwrap();
        store.set("/r/s/c10/history", b"").unwrap();

        let children: Vec<_> = store.list_children("/r/s").unwrap().into_iter().collect();
        assert_eq!(children, vec!["c1", "c10", "c2"]);

        store.delete_recursive("/r/s/c1").unwrap();
        let children: Vec<_> = store.list_children("/r/s").unwrap().into_iter().collect();
        assert_eq!(children, vec!["c10", "c2"]);
    }

    #[test]
    fn corrupt_node_is_a_serialization_error() {
        let (store, _dir) = test_store();
        store.put_raw("/bad", b"abc");
        assert!(matches!(store.get("/bad"), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn corrupt_node_can_be_replaced() {
        let (store, _dir) = test_store();
        store.put_raw("/bad", b"abc");
        store.put_raw("/worse", b"");

        assert_eq!(store.compare_and_set("/bad", b"fresh", None).unwrap(), 1);
        assert_eq!(store.get("/bad").unwrap().unwrap().value, b"fresh");
        assert_eq!(store.set("/worse", b"fresh").unwrap(), 1);
        assert_eq!(store.get("/worse").unwrap().unwrap().version, 1);
    }

    #[test]
    fn reopen_preserves_nodes_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksDbCoordinator::open(dir.path()).unwrap();
            store.set("/a", b"1").unwrap();
            store.set("/a", b"2").unwrap();
        }
        {
            let store = RocksDbCoordinator::open(dir.path()).unwrap();
            let node = store.get("/a").unwrap().unwrap();
            assert_eq!(node.version, 2);
            assert_eq!(node.value, b"2");
        }
    }
}
