//! Process-wide manifest cache.
//!
//! Many peers (and many views) reference the same manifest state, so
//! manifests are interned by digest and shared through `Arc`. The cache only
//! holds `Weak` references: an entry disappears once the last owner drops
//! its `Arc`, which is the reference-count eviction rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::manifest::Manifest;
use crate::types::Digest;

/// Dead entries are swept once the map reaches this size, then whenever it
/// doubles from the live count left after the previous sweep.
const MIN_PRUNE_AT: usize = 64;

struct Entries {
    map: HashMap<Digest, Weak<Manifest>>,
    prune_at: usize,
}

impl Default for Entries {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            prune_at: MIN_PRUNE_AT,
        }
    }
}

impl Entries {
    fn prune(&mut self) {
        let before = self.map.len();
        self.map.retain(|_, weak| weak.strong_count() > 0);
        if self.map.len() != before {
            debug!(evicted = before - self.map.len(), "pruned manifest cache");
        }
        self.prune_at = (self.map.len() * 2).max(MIN_PRUNE_AT);
    }
}

/// Thread-safe, reference-counted manifest cache.
///
/// This is the one structure shared across view queues, so it carries its
/// own lock.
#[derive(Default)]
pub struct ManifestCache {
    inner: Mutex<Entries>,
}

impl ManifestCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // The map holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Intern a manifest, returning the shared instance.
    ///
    /// If a live manifest with the same digest is already cached, that
    /// instance is returned and `manifest` is dropped.
    pub fn intern(&self, manifest: Manifest) -> Arc<Manifest> {
        let digest = manifest.digest();
        let mut entries = self.lock();
        if let Some(existing) = entries.map.get(&digest).and_then(Weak::upgrade) {
            return existing;
        }
        let shared = Arc::new(manifest);
        entries.map.insert(digest, Arc::downgrade(&shared));
        if entries.map.len() >= entries.prune_at {
            entries.prune();
        }
        shared
    }

    /// Look up a manifest by digest.
    ///
    /// `None` means the caller must reconstruct the manifest from its data
    /// source or ask the peer for a full snapshot. It is not an error.
    pub fn acquire(&self, digest: &Digest) -> Option<Arc<Manifest>> {
        let mut entries = self.lock();
        match entries.map.get(digest).map(Weak::upgrade) {
            Some(Some(manifest)) => Some(manifest),
            Some(None) => {
                entries.map.remove(digest);
                debug!(%digest, "manifest evicted before acquire");
                None
            }
            None => None,
        }
    }

    /// Number of live manifests. Prunes dead entries as a side effect.
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        entries.prune();
        entries.map.len()
    }

    /// Whether the cache holds no live manifests.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Outstanding `Arc`s stay valid.
    pub fn purge(&self) {
        *self.lock() = Entries::default();
    }
}

impl std::fmt::Debug for ManifestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestCache")
            .field("entries", &self.lock().map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(bytes: &[u8]) -> Manifest {
        Manifest::new(bytes.iter().map(|b| Digest::from_bytes([*b; 32])))
    }

    #[test]
    fn test_intern_shares_instances() {
        let cache = ManifestCache::new();
        let a = cache.intern(manifest(&[1, 2]));
        let b = cache.intern(manifest(&[2, 1]));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_acquire_hit_and_miss() {
        let cache = ManifestCache::new();
        let m = cache.intern(manifest(&[7]));

        let hit = cache.acquire(&m.digest()).unwrap();
        assert!(Arc::ptr_eq(&m, &hit));
        assert!(cache.acquire(&Digest::ZERO).is_none());
    }

    #[test]
    fn test_evicted_when_last_owner_drops() {
        let cache = ManifestCache::new();
        let m = cache.intern(manifest(&[1]));
        let digest = m.digest();
        let second = Arc::clone(&m);

        drop(m);
        assert!(cache.acquire(&digest).is_some());

        drop(second);
        assert!(cache.acquire(&digest).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dead_entries_do_not_accumulate() {
        let cache = ManifestCache::new();
        let kept = cache.intern(manifest(&[0]));

        for i in 0..5_000u32 {
            let digests = [Digest::from_bytes([1; 32]), Digest::of(&i.to_be_bytes())];
            drop(cache.intern(Manifest::new(digests)));
            assert!(cache.lock().map.len() <= 2 * MIN_PRUNE_AT);
        }

        assert!(cache.acquire(&kept.digest()).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_live_entries_survive_sweeps() {
        let cache = ManifestCache::new();
        let held: Vec<_> = (0..200u32)
            .map(|i| cache.intern(Manifest::new([Digest::of(&i.to_be_bytes())])))
            .collect();
        for i in 0..1_000u32 {
            drop(cache.intern(Manifest::new([Digest::of(&(i + 10_000).to_be_bytes())])));
        }
        for m in &held {
            assert!(Arc::ptr_eq(m, &cache.acquire(&m.digest()).unwrap()));
        }
        assert!(cache.lock().map.len() <= 2 * (held.len() + 1));
    }

    #[test]
    fn test_shared_across_threads() {
        let cache = Arc::new(ManifestCache::new());
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.intern(manifest(&[i % 2])))
            })
            .collect();
        let held: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.len(), 2);
        drop(held);
        assert_eq!(cache.len(), 0);
    }
}
