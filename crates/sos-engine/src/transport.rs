//! KVS transport abstraction.
//!
//! The relay is an untrusted, eventually consistent key-value store with
//! last-writer-wins values. [`KvsTransport`] is the backend seam;
//! [`SosTransport`] layers the circle's key namespace and value encodings on
//! top of it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use sos_core::{Circle, KeyParameters, PeerId, RetirementTicket};

use crate::error::{EngineError, Result};
use crate::keys::{KeyField, KvsKey};

/// A key whose value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvsChange {
    pub key: String,
    pub value: Bytes,
}

/// Backend for the key-value relay.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait KvsTransport: Send + Sync {
    /// Write `value` under `key`. May fail transiently; callers retry.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Read several keys. Keys absent from the result are not yet present.
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Bytes>>;

    /// Stream of changes as they become visible. No cross-key ordering.
    fn subscribe(&self) -> broadcast::Receiver<KvsChange>;
}

/// An in-memory relay for tests.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// Shared last-writer-wins store with failure injection.
    pub struct MemoryKvs {
        values: RwLock<HashMap<String, Bytes>>,
        changes: broadcast::Sender<KvsChange>,
        /// Keys written while delivery was paused.
        held: Mutex<BTreeMap<String, Bytes>>,
        paused: AtomicBool,
        offline: AtomicBool,
        fail_puts: AtomicUsize,
    }

    impl MemoryKvs {
        /// Create a new relay.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make every put and get fail until cleared.
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Fail the next `n` puts.
        pub fn fail_next_puts(&self, n: usize) {
            self.fail_puts.store(n, Ordering::SeqCst);
        }

        /// Hold change notifications. Values are still stored.
        pub fn pause_delivery(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }

        /// Deliver the latest value of every key written while paused.
        ///
        /// Intermediate values are lost, as on a real relay.
        pub async fn resume_delivery(&self) {
            self.paused.store(false, Ordering::SeqCst);
            let held = std::mem::take(&mut *self.held.lock().await);
            for (key, value) in held {
                let _ = self.changes.send(KvsChange { key, value });
            }
        }

        /// Current value of `key`, bypassing failure injection.
        pub async fn value(&self, key: &str) -> Option<Bytes> {
            self.values.read().await.get(key).cloned()
        }

        /// All keys currently stored, sorted.
        pub async fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
            keys.sort();
            keys
        }

        fn check_online(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(EngineError::Transport("relay offline".into()));
            }
            Ok(())
        }
    }

    impl Default for MemoryKvs {
        fn default() -> Self {
            let (changes, _) = broadcast::channel(4096);
            Self {
                values: RwLock::new(HashMap::new()),
                changes,
                held: Mutex::new(BTreeMap::new()),
                paused: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                fail_puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KvsTransport for MemoryKvs {
        async fn put(&self, key: &str, value: Bytes) -> Result<()> {
            self.check_online()?;
            let failing = self
                .fail_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(EngineError::Transport(format!("injected put failure for {}", key)));
            }

            self.values.write().await.insert(key.to_string(), value.clone());
            if self.paused.load(Ordering::SeqCst) {
                self.held.lock().await.insert(key.to_string(), value);
            } else {
                // No subscribers is fine.
                let _ = self.changes.send(KvsChange {
                    key: key.to_string(),
                    value,
                });
            }
            Ok(())
        }

        async fn get(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
            self.check_online()?;
            let values = self.values.read().await;
            Ok(keys
                .iter()
                .filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone())))
                .collect())
        }

        fn subscribe(&self) -> broadcast::Receiver<KvsChange> {
            self.changes.subscribe()
        }
    }
}

/// The value stored under one message key: the latest message of every view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBundle {
    pub messages: BTreeMap<String, Bytes>,
}

impl MessageBundle {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| EngineError::Serialization(e.to_string()))
    }
}

/// Typed access to one circle's keys on a relay.
pub struct SosTransport {
    backend: Arc<dyn KvsTransport>,
    circle: KeyField,
    local: PeerId,
    /// Last bundle written per destination.
    outbound: Mutex<HashMap<PeerId, MessageBundle>>,
}

impl SosTransport {
    pub fn new(backend: Arc<dyn KvsTransport>, circle: KeyField, local: PeerId) -> Self {
        Self {
            backend,
            circle,
            local,
            outbound: Mutex::new(HashMap::new()),
        }
    }

    pub fn circle_name(&self) -> &KeyField {
        &self.circle
    }

    pub fn backend(&self) -> &Arc<dyn KvsTransport> {
        &self.backend
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KvsChange> {
        self.backend.subscribe()
    }

    async fn get_one(&self, key: &KvsKey) -> Result<Option<Bytes>> {
        let key = key.to_key();
        let mut values = self.backend.get(std::slice::from_ref(&key)).await?;
        Ok(values.remove(&key))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Circle, parameters, retirement
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn publish_circle(&self, circle: &Circle) -> Result<()> {
        let key = KvsKey::circle(&self.circle).to_key();
        debug!(%key, generation = circle.generation(), "publishing circle");
        self.backend.put(&key, circle.to_bytes()?.into()).await
    }

    /// The circle currently on the relay, if any.
    pub async fn fetch_circle(&self) -> Result<Option<Circle>> {
        match self.get_one(&KvsKey::circle(&self.circle)).await? {
            Some(bytes) => Ok(Some(Circle::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn publish_parameters(&self, params: &KeyParameters) -> Result<()> {
        let key = KvsKey::parameters(&self.circle).to_key();
        self.backend.put(&key, params.to_bytes()?.into()).await
    }

    pub async fn fetch_parameters(&self) -> Result<Option<KeyParameters>> {
        match self.get_one(&KvsKey::parameters(&self.circle)).await? {
            Some(bytes) => Ok(Some(KeyParameters::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn publish_retirement(&self, ticket: &RetirementTicket) -> Result<()> {
        let key = KvsKey::retirement(&self.circle, &ticket.peer_id).to_key();
        self.backend.put(&key, ticket.to_bytes()?.into()).await
    }

    /// Announce that this peer finished its first full sync of every view.
    pub async fn publish_initial_sync(&self) -> Result<()> {
        let key = KvsKey::initial_sync(&self.circle, &self.local).to_key();
        self.backend
            .put(&key, Bytes::copy_from_slice(self.local.as_str().as_bytes()))
            .await
    }

    pub async fn publish_account_changed(&self) -> Result<()> {
        self.backend
            .put(&KvsKey::AccountChanged.to_key(), Bytes::copy_from_slice(self.local.as_str().as_bytes()))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace this view's entry in the bundle for `to` and write the bundle.
    ///
    /// The local bundle keeps the new entry even if the put fails, so the
    /// next successful put for any view carries it.
    pub async fn send_message(&self, to: &PeerId, view: &str, message: Bytes) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        let bundle = outbound.entry(to.clone()).or_default();
        bundle.messages.insert(view.to_string(), message);
        let bytes = bundle.to_bytes()?;
        let key = KvsKey::message(&self.circle, &self.local, to).to_key();
        self.backend.put(&key, bytes.into()).await
    }

    /// Forget outbound state for a peer that left the circle.
    pub async fn forget_peer(&self, peer: &PeerId) {
        self.outbound.lock().await.remove(peer);
    }

    /// Read the bundle `from` most recently wrote for us.
    pub async fn fetch_messages(&self, from: &PeerId) -> Result<Option<MessageBundle>> {
        match self.get_one(&KvsKey::message(&self.circle, from, &self.local)).await? {
            Some(bytes) => Ok(Some(MessageBundle::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKvs;
    use super::*;
    use sos_core::DeviceIdentity;

    fn transport(kvs: &Arc<MemoryKvs>, seed: u8) -> (SosTransport, PeerId) {
        let peer = DeviceIdentity::from_seed(&[seed; 32]).peer_id();
        let backend: Arc<dyn KvsTransport> = kvs.clone();
        (
            SosTransport::new(backend, KeyField::new("keychain").unwrap(), peer.clone()),
            peer,
        )
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let kvs = MemoryKvs::new();
        let mut changes = kvs.subscribe();
        kvs.put("k", Bytes::from_static(b"1")).await.unwrap();
        kvs.put("k", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(kvs.value("k").await.unwrap(), Bytes::from_static(b"2"));
        assert_eq!(changes.recv().await.unwrap().value, Bytes::from_static(b"1"));
        assert_eq!(changes.recv().await.unwrap().value, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_absent_keys_are_not_errors() {
        let kvs = MemoryKvs::new();
        kvs.put("present", Bytes::from_static(b"v")).await.unwrap();
        let got = kvs.get(&["present".into(), "absent".into()]).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let kvs = MemoryKvs::new();
        kvs.fail_next_puts(1);
        assert!(kvs.put("k", Bytes::new()).await.is_err());
        assert!(kvs.put("k", Bytes::new()).await.is_ok());

        kvs.set_offline(true);
        assert!(kvs.get(&["k".into()]).await.is_err());
    }

    #[tokio::test]
    async fn test_paused_delivery_coalesces() {
        let kvs = MemoryKvs::new();
        let mut changes = kvs.subscribe();
        kvs.pause_delivery();
        kvs.put("k", Bytes::from_static(b"old")).await.unwrap();
        kvs.put("k", Bytes::from_static(b"new")).await.unwrap();
        assert!(changes.try_recv().is_err());

        kvs.resume_delivery().await;
        assert_eq!(changes.recv().await.unwrap().value, Bytes::from_static(b"new"));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bundle_keeps_every_view() {
        let kvs = MemoryKvs::new();
        let (a, _) = transport(&kvs, 1);
        let (b, b_id) = transport(&kvs, 2);
        let a_id = DeviceIdentity::from_seed(&[1; 32]).peer_id();

        a.send_message(&b_id, "passwords", Bytes::from_static(b"p1")).await.unwrap();
        a.send_message(&b_id, "wifi", Bytes::from_static(b"w1")).await.unwrap();
        a.send_message(&b_id, "passwords", Bytes::from_static(b"p2")).await.unwrap();

        let bundle = b.fetch_messages(&a_id).await.unwrap().unwrap();
        assert_eq!(bundle.messages.len(), 2);
        assert_eq!(bundle.messages["passwords"], Bytes::from_static(b"p2"));
        assert_eq!(bundle.messages["wifi"], Bytes::from_static(b"w1"));
    }

    #[tokio::test]
    async fn test_circle_roundtrip_through_relay() {
        let kvs = MemoryKvs::new();
        let (t, _) = transport(&kvs, 1);
        assert!(t.fetch_circle().await.unwrap().is_none());

        let identity = DeviceIdentity::from_seed(&[1; 32]);
        let info = sos_core::PeerInfo::new(&identity, "laptop").unwrap();
        let circle = Circle::new("keychain").reset_to_offering(&identity, &info).unwrap();
        t.publish_circle(&circle).await.unwrap();
        assert_eq!(t.fetch_circle().await.unwrap().unwrap(), circle);
    }
}
