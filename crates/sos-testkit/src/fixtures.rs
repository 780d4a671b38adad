//! Test fixtures and helpers.
//!
//! A [`TestDevice`] is an engine over an in-memory store, driven by hand.
//! [`pump`] moves messages between devices until every engine goes quiet,
//! which keeps multi-device scenarios deterministic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sos_core::{DeviceIdentity, Digest, Item, Manifest, ManifestCache, PeerId, PeerKeys};
use sos_engine::{Engine, EngineConfig, Received};
use sos_store::{DataSource, MemoryStore};

/// Install a test-friendly subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// An item whose content is `s`.
pub fn item(s: &str) -> Item {
    Item::from(s.as_bytes().to_vec())
}

/// One device: identity, item store, and an engine for a single view.
pub struct TestDevice {
    pub identity: Arc<DeviceIdentity>,
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
    pub config: EngineConfig,
}

/// The view every fixture engine synchronizes.
pub const VIEW: &str = "passwords";

impl TestDevice {
    /// A device with a deterministic identity derived from `seed`.
    pub async fn new(seed: u8, items: &[&str]) -> Self {
        Self::with_config(seed, items, EngineConfig::default()).await
    }

    pub async fn with_config(seed: u8, items: &[&str], config: EngineConfig) -> Self {
        let identity = Arc::new(DeviceIdentity::from_seed(&[seed; 32]));
        let store = Arc::new(MemoryStore::with_items(items.iter().map(|s| item(s))));
        let engine = Self::open_engine(&identity, &store, &config).await;
        Self {
            identity,
            store,
            engine,
            config,
        }
    }

    async fn open_engine(identity: &Arc<DeviceIdentity>, store: &Arc<MemoryStore>, config: &EngineConfig) -> Engine {
        Engine::open(
            VIEW,
            identity.clone(),
            store.clone(),
            store.clone(),
            Arc::new(ManifestCache::new()),
            config.clone(),
        )
        .await
        .expect("engine opens over a memory store")
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn keys(&self) -> PeerKeys {
        self.identity.public_keys()
    }

    /// The store's manifest right now.
    pub fn manifest(&self) -> Manifest {
        self.store.manifest()
    }

    pub fn digest(&self) -> Digest {
        self.store.manifest().digest()
    }

    /// Count sync-complete notifications from now on.
    pub fn track_sync_events(&mut self) -> SyncEvents {
        let events = SyncEvents::default();
        let sink = events.clone();
        self.engine.set_sync_listener(Arc::new(move |_: &str, _: &Digest| {
            sink.0.fetch_add(1, Ordering::SeqCst);
        }));
        events
    }

    /// A local edit: add and remove items, then tell the engine.
    pub async fn edit(&mut self, add: &[&str], remove: &[&str]) {
        self.store
            .apply_changes(
                add.iter().map(|s| item(s)).collect(),
                remove.iter().map(|s| item(s).digest()).collect(),
            )
            .await
            .expect("memory store applies");
        self.engine
            .local_changed()
            .await
            .expect("memory store reads");
    }

    /// Save, drop the engine, and reopen it from the same stores.
    pub async fn restart(&mut self) {
        self.engine.save().await.expect("memory store saves");
        self.engine = Self::open_engine(&self.identity, &self.store, &self.config).await;
    }

    /// Make every device a peer of every other.
    pub fn mesh(devices: &mut [&mut TestDevice]) {
        let all: BTreeMap<PeerId, PeerKeys> = devices.iter().map(|d| (d.peer_id(), d.keys())).collect();
        for device in devices.iter_mut() {
            let me = device.peer_id();
            let peers = all
                .iter()
                .filter(|(id, _)| **id != me)
                .map(|(id, keys)| (id.clone(), *keys))
                .collect();
            device.engine.set_peers(peers);
        }
    }
}

/// Shared counter behind [`TestDevice::track_sync_events`].
#[derive(Debug, Default, Clone)]
pub struct SyncEvents(Arc<AtomicUsize>);

impl SyncEvents {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a pump did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PumpStats {
    pub rounds: usize,
    pub sent: usize,
    pub delivered: usize,
    pub outcomes: Vec<Received>,
}

const MAX_ROUNDS: usize = 64;

/// Exchange messages until no engine has anything to send.
pub async fn pump(devices: &mut [&mut TestDevice]) -> PumpStats {
    pump_with(devices, |_, _, _| true).await
}

/// Like [`pump`], but `deliver(from, to, round)` decides whether each message
/// reaches its destination. Dropped messages still count as put.
///
/// # Panics
///
/// If the devices are still talking after a fixed number of rounds.
pub async fn pump_with<F>(devices: &mut [&mut TestDevice], mut deliver: F) -> PumpStats
where
    F: FnMut(&PeerId, &PeerId, usize) -> bool,
{
    let mut stats = PumpStats::default();
    for round in 0..MAX_ROUNDS {
        let mut outgoing = Vec::new();
        for (i, device) in devices.iter_mut().enumerate() {
            for out in device.engine.sync_all().await {
                outgoing.push((i, out));
            }
        }
        if outgoing.is_empty() {
            stats.rounds = round;
            return stats;
        }

        for (i, out) in outgoing {
            stats.sent += 1;
            let from = devices[i].peer_id();
            devices[i].engine.message_sent(&out.to, true);
            if !deliver(&from, &out.to, round) {
                continue;
            }
            let Some(j) = devices.iter().position(|d| d.peer_id() == out.to) else {
                continue;
            };
            if let Ok(outcome) = devices[j].engine.receive_message(&from, &out.bytes).await {
                stats.outcomes.push(outcome);
            }
            stats.delivered += 1;
        }
    }
    panic!("devices still exchanging messages after {MAX_ROUNDS} rounds");
}
