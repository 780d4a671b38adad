//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use sos_core::{Digest, Item, Manifest};

use crate::error::{Result, StoreError};
use crate::traits::{DataSource, StateStore};

/// In-memory item store and engine state store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Items indexed by digest.
    items: BTreeMap<Digest, Item>,

    /// Engine state per view.
    states: HashMap<String, Vec<u8>>,

    /// When set, `apply_changes` fails without touching the items.
    fail_applies: bool,

    /// Number of successful `apply_changes` calls.
    applies: u64,

    /// When set, `save_engine_state` fails and keeps the previous state.
    fail_saves: bool,

    /// Number of `save_engine_state` calls refused by `fail_saves`.
    refused_saves: u64,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    /// Create a store pre-filled with `items`.
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.write();
            for item in items {
                inner.items.insert(item.digest(), item);
            }
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an item directly, bypassing the engine.
    pub fn insert(&self, item: Item) -> Digest {
        let digest = item.digest();
        self.write().items.insert(digest, item);
        digest
    }

    /// Remove an item directly, bypassing the engine.
    pub fn remove(&self, digest: &Digest) -> Option<Item> {
        self.write().items.remove(digest)
    }

    /// Snapshot of the stored items.
    pub fn items(&self) -> Vec<Item> {
        self.read().items.values().cloned().collect()
    }

    /// Manifest of the stored items, without going through the trait.
    pub fn manifest(&self) -> Manifest {
        self.read().items.keys().copied().collect()
    }

    /// Make every following `apply_changes` fail (or succeed again).
    pub fn set_fail_applies(&self, fail: bool) {
        self.write().fail_applies = fail;
    }

    /// Number of successful `apply_changes` calls so far.
    pub fn apply_count(&self) -> u64 {
        self.read().applies
    }

    /// Make every following `save_engine_state` fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.write().fail_saves = fail;
    }

    /// Number of saves refused while failures were switched on.
    pub fn refused_saves(&self) -> u64 {
        self.read().refused_saves
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for MemoryStore {
    async fn current_manifest(&self) -> Result<Manifest> {
        Ok(self.manifest())
    }

    async fn fetch_items(&self, digests: &[Digest]) -> Result<HashMap<Digest, Item>> {
        let inner = self.read();
        Ok(digests
            .iter()
            .filter_map(|d| inner.items.get(d).map(|item| (*d, item.clone())))
            .collect())
    }

    async fn apply_changes(&self, added: Vec<Item>, removed: Vec<Digest>) -> Result<()> {
        let mut inner = self.write();
        if inner.fail_applies {
            return Err(StoreError::Rejected("applies disabled".into()));
        }

        for digest in &removed {
            inner.items.remove(digest);
        }
        for item in added {
            inner.items.insert(item.digest(), item);
        }
        inner.applies += 1;
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_engine_state(&self, view: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read().states.get(view).cloned())
    }

    async fn save_engine_state(&self, view: &str, state: &[u8]) -> Result<()> {
        let mut inner = self.write();
        if inner.fail_saves {
            inner.refused_saves += 1;
            return Err(StoreError::Rejected("saves disabled".into()));
        }
        inner.states.insert(view.to_string(), state.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DataSourceExt;

    #[tokio::test]
    async fn test_apply_and_manifest() {
        let store = MemoryStore::new();
        let a = Item::from(b"a".to_vec());
        let b = Item::from(b"b".to_vec());

        store.apply_changes(vec![a.clone(), b.clone()], vec![]).await.unwrap();
        let manifest = store.current_manifest().await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains(&a.digest()));

        store.apply_changes(vec![], vec![a.digest()]).await.unwrap();
        let manifest = store.current_manifest().await.unwrap();
        assert_eq!(manifest, Manifest::new(vec![b.digest()]));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MemoryStore::new();
        let a = Item::from(b"a".to_vec());
        store.apply_changes(vec![a.clone()], vec![]).await.unwrap();
        store.apply_changes(vec![a.clone()], vec![Digest::of(b"absent")]).await.unwrap();
        assert_eq!(store.items(), vec![a]);
    }

    #[tokio::test]
    async fn test_failed_apply_changes_nothing() {
        let store = MemoryStore::with_items([Item::from(b"keep".to_vec())]);
        let before = store.manifest();
        store.set_fail_applies(true);

        let result = store
            .apply_changes(vec![Item::from(b"new".to_vec())], before.entries().to_vec())
            .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(store.manifest(), before);
        assert_eq!(store.apply_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_skips_missing() {
        let store = MemoryStore::new();
        let digest = store.insert(Item::from(b"x".to_vec()));
        let fetched = store.fetch_items(&[digest, Digest::of(b"y")]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(&fetched[&digest].as_bytes()[..], b"x");
    }

    #[tokio::test]
    async fn test_ext_helpers() {
        let store = MemoryStore::new();
        let item = Item::from(b"local edit".to_vec());
        let manifest = store.insert_items(vec![item.clone()]).await.unwrap();
        assert!(manifest.contains(&item.digest()));
        let manifest = store.delete_items(vec![item.digest()]).await.unwrap();
        assert!(manifest.is_empty());
    }

    #[tokio::test]
    async fn test_engine_state_per_view() {
        let store = MemoryStore::new();
        assert!(store.load_engine_state("passwords").await.unwrap().is_none());
        store.save_engine_state("passwords", b"one").await.unwrap();
        store.save_engine_state("wifi", b"two").await.unwrap();
        store.save_engine_state("passwords", b"three").await.unwrap();
        assert_eq!(store.load_engine_state("passwords").await.unwrap().unwrap(), b"three");
        assert_eq!(store.load_engine_state("wifi").await.unwrap().unwrap(), b"two");
    }
}
