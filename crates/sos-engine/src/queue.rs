//! Serialized engine execution.
//!
//! Each view runs on its own task. Every mutation of an [`Engine`] goes
//! through the task's command channel, so sync passes, inbound messages, and
//! put completions never interleave. Puts run on separate tasks and report
//! back with [`Command::MessageSent`]. State saves are debounced.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use sos_core::{Digest, PeerId, PeerKeys};

use crate::config::EngineConfig;
use crate::engine::{Engine, Outbound, Phase, Received, SyncListener};
use crate::error::{EngineError, Result};
use crate::transport::SosTransport;

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub view: String,
    pub local: Digest,
    pub items: usize,
    pub peers: usize,
    pub in_sync: bool,
    pub dirty: bool,
    pub phase: Phase,
}

/// Commands accepted by the engine task.
pub enum Command {
    Sync,
    LocalChanged,
    SetPeers(BTreeMap<PeerId, PeerKeys>),
    SetListener(SyncListener),
    Receive {
        from: PeerId,
        bytes: Bytes,
        resp: Option<oneshot::Sender<Result<Received>>>,
    },
    MessageSent {
        peer: PeerId,
        ok: bool,
    },
    Status {
        resp: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Handle to an engine running on its own task.
#[derive(Clone)]
pub struct EngineHandle {
    view: String,
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Move `engine` onto a new task that sends through `transport`.
    pub fn spawn(engine: Engine, transport: Arc<SosTransport>, config: &EngineConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let view = engine.view().to_string();
        let worker = Worker {
            engine,
            transport,
            rx,
            tx: tx.downgrade(),
            debounce: config.save_debounce(),
            save_at: None,
        };
        let task = tokio::spawn(worker.run());
        (Self { view, tx }, task)
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| EngineError::Closed)
    }

    /// Ask for a sync pass.
    pub async fn sync(&self) -> Result<()> {
        self.send(Command::Sync).await
    }

    /// The data source changed outside of sync.
    pub async fn local_changed(&self) -> Result<()> {
        self.send(Command::LocalChanged).await
    }

    pub async fn set_peers(&self, peers: BTreeMap<PeerId, PeerKeys>) -> Result<()> {
        self.send(Command::SetPeers(peers)).await
    }

    pub async fn set_sync_listener(&self, listener: SyncListener) -> Result<()> {
        self.send(Command::SetListener(listener)).await
    }

    /// Queue an inbound message without waiting for it to be handled.
    pub async fn deliver(&self, from: PeerId, bytes: Bytes) -> Result<()> {
        self.send(Command::Receive { from, bytes, resp: None }).await
    }

    /// Hand an inbound message to the engine and wait for the outcome.
    pub async fn receive(&self, from: PeerId, bytes: Bytes) -> Result<Received> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Receive { from, bytes, resp: Some(resp) }).await?;
        rx.await.map_err(|_| EngineError::Closed)?
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Status { resp }).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Flush state and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp }).await?;
        rx.await.map_err(|_| EngineError::Closed)?
    }
}

struct Worker {
    engine: Engine,
    transport: Arc<SosTransport>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    debounce: std::time::Duration,
    save_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        debug!(view = %self.engine.view(), "engine task started");
        loop {
            let command = match self.save_at {
                Some(at) => tokio::select! {
                    command = self.rx.recv() => command,
                    _ = sleep_until(at) => {
                        self.save_at = None;
                        self.save().await;
                        // A failed save leaves the engine dirty; try again later.
                        self.arm_save();
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            let Some(command) = command else {
                self.save().await;
                break;
            };

            match command {
                Command::Sync => self.pass().await,
                Command::LocalChanged => {
                    if let Err(e) = self.engine.local_changed().await {
                        warn!(view = %self.engine.view(), error = %e, "could not read local manifest");
                    }
                }
                Command::SetPeers(peers) => self.engine.set_peers(peers),
                Command::SetListener(listener) => self.engine.set_sync_listener(listener),
                Command::Receive { from, bytes, resp } => {
                    let result = self.engine.receive_message(&from, &bytes).await;
                    if let Err(e) = &result {
                        warn!(view = %self.engine.view(), peer = %from, error = %e, "inbound message rejected");
                    }
                    if let Some(resp) = resp {
                        let _ = resp.send(result);
                    }
                }
                Command::MessageSent { peer, ok } => self.engine.message_sent(&peer, ok),
                Command::Status { resp } => {
                    let _ = resp.send(self.status());
                }
                Command::Shutdown { resp } => {
                    let result = if self.engine.is_dirty() {
                        self.engine.save().await
                    } else {
                        Ok(())
                    };
                    info!(view = %self.engine.view(), "engine task stopped");
                    let _ = resp.send(result);
                    return;
                }
            }

            if self.engine.take_rerun() {
                self.pass().await;
            }
            self.arm_save();
        }
        debug!(view = %self.engine.view(), "engine task finished");
    }

    fn arm_save(&mut self) {
        if self.engine.is_dirty() && self.save_at.is_none() {
            self.save_at = Some(Instant::now() + self.debounce);
        }
    }

    fn status(&self) -> EngineStatus {
        let local = self.engine.local_manifest();
        EngineStatus {
            view: self.engine.view().to_string(),
            local: local.digest(),
            items: local.len(),
            peers: self.engine.peers().count(),
            in_sync: self.engine.is_in_sync(),
            dirty: self.engine.is_dirty(),
            phase: self.engine.phase(),
        }
    }

    async fn pass(&mut self) {
        for out in self.engine.sync_all().await {
            self.put(out);
        }
    }

    fn put(&self, out: Outbound) {
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let ok = match transport.send_message(&out.to, &out.view, out.bytes).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(view = %out.view, peer = %out.to, error = %e, "put failed");
                    false
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::MessageSent { peer: out.to, ok }).await;
            }
        });
    }

    async fn save(&mut self) {
        if !self.engine.is_dirty() {
            return;
        }
        if let Err(e) = self.engine.save().await {
            warn!(view = %self.engine.view(), error = %e, "could not save engine state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{parse_key, KeyField, KvsKey};
    use crate::transport::memory::MemoryKvs;
    use crate::transport::{KvsTransport, MessageBundle};
    use sos_core::{DeviceIdentity, Item, ManifestCache};
    use sos_store::{DataSourceExt, MemoryStore, StateStore};
    use std::time::Duration;

    struct Node {
        id: PeerId,
        store: Arc<MemoryStore>,
        handle: EngineHandle,
    }

    fn fast() -> EngineConfig {
        EngineConfig {
            save_debounce_ms: 10,
            ..EngineConfig::default()
        }
    }

    async fn node(kvs: Arc<MemoryKvs>, seed: u8, items: &[&str]) -> Node {
        let identity = Arc::new(DeviceIdentity::from_seed(&[seed; 32]));
        let id = identity.peer_id();
        let store = Arc::new(MemoryStore::with_items(
            items.iter().map(|s| Item::from(s.as_bytes().to_vec())),
        ));
        let engine = Engine::open(
            "passwords",
            identity,
            store.clone(),
            store.clone(),
            Arc::new(ManifestCache::new()),
            fast(),
        )
        .await
        .unwrap();
        let transport = Arc::new(SosTransport::new(kvs.clone(), KeyField::new("keychain").unwrap(), id.clone()));
        let (handle, _) = EngineHandle::spawn(engine, transport, &fast());

        // Route bundles addressed to this node into its engine.
        let mut changes = kvs.subscribe();
        let me = id.clone();
        let inbox = handle.clone();
        tokio::spawn(async move {
            while let Ok(change) = changes.recv().await {
                if let KvsKey::Message { from, to, .. } = parse_key(&change.key) {
                    if to.as_str() != me.as_str() {
                        continue;
                    }
                    let Ok(from) = PeerId::parse(from.as_str()) else { continue };
                    let Ok(bundle) = MessageBundle::from_bytes(&change.value) else { continue };
                    for (view, bytes) in bundle.messages {
                        if view == inbox.view() {
                            let _ = inbox.deliver(from.clone(), bytes).await;
                        }
                    }
                }
            }
        });

        Node { id, store, handle }
    }

    async fn wait_in_sync(nodes: &[&Node]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut all = true;
            for n in nodes {
                all &= n.handle.status().await.unwrap().in_sync;
            }
            if all {
                return;
            }
            assert!(Instant::now() < deadline, "nodes did not converge");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn peers_of(me: &Node, all: &[(&PeerId, PeerKeys)]) -> BTreeMap<PeerId, PeerKeys> {
        all.iter()
            .filter(|(id, _)| **id != me.id)
            .map(|(id, keys)| ((*id).clone(), *keys))
            .collect()
    }

    #[tokio::test]
    async fn test_converge_over_relay() {
        let kvs = MemoryKvs::new();
        let a = node(kvs.clone(), 1, &["x"]).await;
        let b = node(kvs.clone(), 2, &["y"]).await;
        let keys = [
            (&a.id, DeviceIdentity::from_seed(&[1; 32]).public_keys()),
            (&b.id, DeviceIdentity::from_seed(&[2; 32]).public_keys()),
        ];
        a.handle.set_peers(peers_of(&a, &keys)).await.unwrap();
        b.handle.set_peers(peers_of(&b, &keys)).await.unwrap();

        wait_in_sync(&[&a, &b]).await;
        assert_eq!(a.store.manifest(), b.store.manifest());
        assert_eq!(a.store.manifest().len(), 2);

        // A local edit flows the same way.
        a.store
            .insert_items(vec![Item::from(b"z".to_vec())])
            .await
            .unwrap();
        a.handle.local_changed().await.unwrap();
        wait_in_sync(&[&a, &b]).await;
        assert_eq!(b.store.manifest().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_puts_are_retried() {
        let kvs = MemoryKvs::new();
        let a = node(kvs.clone(), 1, &["x"]).await;
        let b = node(kvs.clone(), 2, &[]).await;
        kvs.fail_next_puts(2);
        let keys = [
            (&a.id, DeviceIdentity::from_seed(&[1; 32]).public_keys()),
            (&b.id, DeviceIdentity::from_seed(&[2; 32]).public_keys()),
        ];
        a.handle.set_peers(peers_of(&a, &keys)).await.unwrap();
        b.handle.set_peers(peers_of(&b, &keys)).await.unwrap();

        // Failed puts are re-sent on the next pass.
        let deadline = Instant::now() + Duration::from_secs(5);
        while b.store.manifest().len() != 1 {
            assert!(Instant::now() < deadline, "retries never delivered");
            a.handle.sync().await.unwrap();
            b.handle.sync().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_state() {
        let kvs = MemoryKvs::new();
        let a = node(kvs.clone(), 1, &["x"]).await;
        let b = node(kvs.clone(), 2, &[]).await;
        let keys = [
            (&a.id, DeviceIdentity::from_seed(&[1; 32]).public_keys()),
            (&b.id, DeviceIdentity::from_seed(&[2; 32]).public_keys()),
        ];
        a.handle.set_peers(peers_of(&a, &keys)).await.unwrap();
        b.handle.set_peers(peers_of(&b, &keys)).await.unwrap();
        wait_in_sync(&[&a, &b]).await;

        b.handle.shutdown().await.unwrap();
        assert!(b.store.load_engine_state("passwords").await.unwrap().is_some());
        assert!(matches!(b.handle.status().await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_without_new_commands() {
        let kvs = MemoryKvs::new();
        let a = node(kvs.clone(), 1, &["x"]).await;
        let b = node(kvs.clone(), 2, &[]).await;
        b.store.set_fail_saves(true);
        let keys = [
            (&a.id, DeviceIdentity::from_seed(&[1; 32]).public_keys()),
            (&b.id, DeviceIdentity::from_seed(&[2; 32]).public_keys()),
        ];
        a.handle.set_peers(peers_of(&a, &keys)).await.unwrap();
        b.handle.set_peers(peers_of(&b, &keys)).await.unwrap();
        wait_in_sync(&[&a, &b]).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while b.store.refused_saves() == 0 {
            assert!(Instant::now() < deadline, "debounced save never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(b.store.load_engine_state("passwords").await.unwrap().is_none());

        // Only the store changes from here on; the worker must retry on its own.
        b.store.set_fail_saves(false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while b.store.load_engine_state("passwords").await.unwrap().is_none() {
            assert!(Instant::now() < deadline, "failed save was never retried");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_receive_reports_outcome() {
        let kvs = MemoryKvs::new();
        let a = node(kvs.clone(), 1, &[]).await;
        let stranger = DeviceIdentity::from_seed(&[9; 32]).peer_id();
        let outcome = a
            .handle
            .receive(stranger, Bytes::from_static(b"whatever"))
            .await
            .unwrap();
        assert_eq!(outcome, Received::Dropped);
    }
}
