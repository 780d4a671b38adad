//! The Account: one device's membership in a circle and the engines that
//! keep its views in sync.
//!
//! An [`Account`] is an explicit context object. It owns the device
//! identity, the current circle, the relay transport, and one
//! [`EngineHandle`] per view. Relay changes enter through
//! [`Account::handle_kvs_change`], normally driven by [`Account::run`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sos_core::{
    apply_circle_update, Circle, CircleDecision, CircleError, DeviceIdentity, Digest,
    KeyParameters, ManifestCache, PeerId, PeerInfo, PeerKeys, RetirementTicket,
};
use sos_engine::{
    parse_key, Engine, EngineHandle, EngineStatus, KeyField, KvsChange, KvsKey, KvsTransport,
    MessageBundle, SosTransport, SyncListener,
};
use sos_store::{DataSource, MemoryStore, SqliteStore, StateStore};

use crate::config::AccountConfig;
use crate::error::{AccountError, Result};

/// Item and engine-state storage for one view.
#[derive(Clone)]
pub struct ViewStores {
    pub data: Arc<dyn DataSource>,
    pub state: Arc<dyn StateStore>,
}

impl ViewStores {
    /// Fresh in-memory storage.
    pub fn memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    /// Use an existing in-memory store for both items and state.
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            data: store.clone(),
            state: store,
        }
    }

    /// A handle on `db` bound to `view`.
    pub fn sqlite(db: &SqliteStore, view: &str) -> Self {
        let store = Arc::new(db.for_view(view));
        Self {
            data: store.clone(),
            state: store,
        }
    }
}

/// State learned from the relay that is not part of the circle.
#[derive(Default)]
struct Shared {
    parameters: Option<KeyParameters>,
    initial_synced: BTreeSet<PeerId>,
    synced_views: BTreeSet<String>,
    initial_sync_published: bool,
    account_changed: bool,
}

/// A device's view of its circle.
pub struct Account {
    identity: Arc<DeviceIdentity>,
    info: PeerInfo,
    config: AccountConfig,
    transport: Arc<SosTransport>,
    circle: RwLock<Circle>,
    engines: BTreeMap<String, EngineHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Mutex<Shared>>,
}

/// The peers this device syncs with: every other member, if it is a member.
fn member_peers(circle: &Circle, local: &PeerId) -> BTreeMap<PeerId, PeerKeys> {
    if circle.is_member(local) {
        circle.peers_excluding(local)
    } else {
        BTreeMap::new()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publishes the initial-sync marker the first time every view is in sync.
fn initial_sync_listener(
    shared: Arc<Mutex<Shared>>,
    transport: Arc<SosTransport>,
    views: usize,
) -> SyncListener {
    Arc::new(move |view: &str, digest: &Digest| {
        debug!(view, %digest, "view in sync with every peer");
        let publish = {
            let mut s = lock(&shared);
            s.synced_views.insert(view.to_string());
            let first = !s.initial_sync_published && s.synced_views.len() == views;
            if first {
                s.initial_sync_published = true;
            }
            first
        };
        if !publish {
            return;
        }
        info!("all views synced, publishing initial-sync marker");
        let transport = transport.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.publish_initial_sync().await {
                warn!(error = %e, "could not publish initial-sync marker");
                lock(&shared).initial_sync_published = false;
            }
        });
    })
}

impl Account {
    /// Open the account and start one engine per configured view.
    ///
    /// `stores` is called once per view name.
    pub async fn open(
        config: AccountConfig,
        identity: DeviceIdentity,
        backend: Arc<dyn KvsTransport>,
        mut stores: impl FnMut(&str) -> Result<ViewStores>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = Arc::new(identity);
        let peer_id = identity.peer_id();
        let info = PeerInfo::new(&identity, config.device_name.clone())?;
        let transport = Arc::new(SosTransport::new(
            backend,
            KeyField::new(config.circle_name.as_str())?,
            peer_id.clone(),
        ));

        let mut circle = Circle::new(config.circle_name.clone());
        if let Some(remote) = transport.fetch_circle().await? {
            match apply_circle_update(&circle, &remote) {
                Ok((adopted, _)) => circle = adopted,
                Err(e) => warn!(error = %e, "ignoring invalid circle on relay"),
            }
        }
        let peers = member_peers(&circle, &peer_id);

        let cache = Arc::new(ManifestCache::new());
        let shared = Arc::new(Mutex::new(Shared::default()));
        let mut engines = BTreeMap::new();
        let mut tasks = Vec::new();
        for view in &config.views {
            let ViewStores { data, state } = stores(view)?;
            let mut engine = Engine::open(
                view.clone(),
                identity.clone(),
                data,
                state,
                cache.clone(),
                config.engine.clone(),
            )
            .await?;
            engine.set_sync_listener(initial_sync_listener(
                shared.clone(),
                transport.clone(),
                config.views.len(),
            ));
            engine.set_peers(peers.clone());
            let (handle, task) = EngineHandle::spawn(engine, transport.clone(), &config.engine);
            engines.insert(view.clone(), handle);
            tasks.push(task);
        }

        info!(
            peer = %peer_id,
            circle = %config.circle_name,
            generation = circle.generation(),
            member = circle.is_member(&peer_id),
            views = engines.len(),
            "account open"
        );
        Ok(Self {
            identity,
            info,
            config,
            transport,
            circle: RwLock::new(circle),
            engines,
            tasks: Mutex::new(tasks),
            shared,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<SosTransport> {
        &self.transport
    }

    /// Subscribe to relay changes, for [`Account::run`].
    pub fn subscribe(&self) -> broadcast::Receiver<KvsChange> {
        self.transport.subscribe()
    }

    /// A copy of the current circle.
    pub async fn circle(&self) -> Circle {
        self.circle.read().await.clone()
    }

    pub async fn is_member(&self) -> bool {
        self.circle.read().await.is_member(&self.peer_id())
    }

    pub fn engine(&self, view: &str) -> Option<&EngineHandle> {
        self.engines.get(view)
    }

    /// Last key parameters seen on the relay or published here.
    pub fn parameters(&self) -> Option<KeyParameters> {
        lock(&self.shared).parameters.clone()
    }

    /// Circle-bound key material, once parameters are known.
    pub async fn key_material(&self) -> Option<[u8; 32]> {
        let params = self.parameters()?;
        Some(self.circle.read().await.derive_key_material(&params))
    }

    /// Peers that announced finishing their first sync.
    pub fn initial_synced_peers(&self) -> BTreeSet<PeerId> {
        lock(&self.shared).initial_synced.clone()
    }

    /// Whether another device signalled an account change.
    pub fn account_changed(&self) -> bool {
        lock(&self.shared).account_changed
    }

    pub async fn status(&self) -> Result<Vec<EngineStatus>> {
        let mut out = Vec::with_capacity(self.engines.len());
        for engine in self.engines.values() {
            out.push(engine.status().await?);
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Circle operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a new circle with this device as its only member.
    pub async fn reset_to_offering(&self) -> Result<Circle> {
        self.update_circle("reset", |c| c.reset_to_offering(&self.identity, &self.info))
            .await
    }

    pub async fn request_to_join(&self) -> Result<Circle> {
        self.update_circle("join", |c| c.request_to_join(&self.identity, &self.info))
            .await
    }

    pub async fn accept_applicant(&self, applicant: &PeerId) -> Result<Circle> {
        self.update_circle("accept", |c| c.accept_applicant(&self.identity, applicant))
            .await
    }

    pub async fn reject_applicant(&self, applicant: &PeerId) -> Result<Circle> {
        self.update_circle("reject", |c| c.reject_applicant(&self.identity, applicant))
            .await
    }

    /// Leave the circle and publish a retirement ticket.
    pub async fn leave_circle(&self) -> Result<Circle> {
        let next = self.update_circle("leave", |c| c.leave(&self.identity)).await?;
        let ticket = RetirementTicket::new(&self.identity, next.name(), next.generation())?;
        self.transport.publish_retirement(&ticket).await?;
        Ok(next)
    }

    /// Evict another member.
    pub async fn remove_peer(&self, peer: &PeerId) -> Result<Circle> {
        self.update_circle("remove", |c| c.retire_peer(&self.identity, peer))
            .await
    }

    /// Rebase onto the relay's circle, mutate, publish, and adopt.
    async fn update_circle<F>(&self, op: &'static str, mutate: F) -> Result<Circle>
    where
        F: FnOnce(&Circle) -> std::result::Result<Circle, CircleError>,
    {
        let mut circle = self.circle.write().await;
        let before = circle.clone();
        self.rebase(&mut circle).await?;
        let outcome = match mutate(&*circle) {
            Ok(next) => self
                .transport
                .publish_circle(&next)
                .await
                .map(|()| next)
                .map_err(AccountError::from),
            Err(e) => Err(e.into()),
        };
        if let Ok(next) = &outcome {
            *circle = next.clone();
        }
        // The rebase alone may have changed membership.
        let after = circle.clone();
        drop(circle);
        self.circle_changed(&before, &after).await?;

        let next = outcome?;
        info!(
            op,
            generation = next.generation(),
            members = next.members().len(),
            applicants = next.applicants().len(),
            "circle updated"
        );
        Ok(next)
    }

    async fn rebase(&self, circle: &mut Circle) -> Result<()> {
        if let Some(remote) = self.transport.fetch_circle().await? {
            match apply_circle_update(circle, &remote) {
                Ok((latest, CircleDecision::Adopted)) => {
                    debug!(generation = latest.generation(), "rebased onto relay circle");
                    *circle = latest;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring invalid circle on relay"),
            }
        }
        Ok(())
    }

    /// Bring every engine's peer set in line with the new circle.
    async fn circle_changed(&self, before: &Circle, after: &Circle) -> Result<()> {
        let me = self.peer_id();
        match (before.is_member(&me), after.is_member(&me)) {
            (false, true) => info!(generation = after.generation(), "joined circle"),
            (true, false) => warn!(generation = after.generation(), "no longer a circle member"),
            _ => {}
        }

        let old = member_peers(before, &me);
        let new = member_peers(after, &me);
        if old == new {
            return Ok(());
        }
        for peer in old.keys().filter(|p| !new.contains_key(*p)) {
            self.transport.forget_peer(peer).await;
        }
        for engine in self.engines.values() {
            engine.set_peers(new.clone()).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relay changes
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch one relay change.
    pub async fn handle_kvs_change(&self, change: &KvsChange) -> Result<()> {
        let key = parse_key(&change.key);
        if let Some(circle) = key.circle_name() {
            if circle != self.transport.circle_name() {
                debug!(key = %change.key, "ignoring key for another circle");
                return Ok(());
            }
        }

        match key {
            KvsKey::Circle { .. } => self.handle_circle(&change.value).await,
            KvsKey::Message { from, to, .. } => {
                if to.as_str() != self.peer_id().as_str() {
                    return Ok(());
                }
                let from = PeerId::parse(from.as_str())?;
                let bundle = MessageBundle::from_bytes(&change.value)?;
                self.deliver(from, bundle).await
            }
            KvsKey::Parameters { .. } => {
                let params = KeyParameters::from_bytes(&change.value)?;
                debug!(iterations = params.iterations, "key parameters updated");
                lock(&self.shared).parameters = Some(params);
                Ok(())
            }
            KvsKey::InitialSync { peer, .. } => {
                let peer = PeerId::parse(peer.as_str())?;
                if peer != self.peer_id() {
                    info!(peer = %peer, "peer finished initial sync");
                    lock(&self.shared).initial_synced.insert(peer);
                }
                Ok(())
            }
            KvsKey::Retirement { .. } => self.handle_retirement(&change.value).await,
            KvsKey::AccountChanged => {
                if change.value.as_ref() != self.peer_id().as_str().as_bytes() {
                    info!("account changed on another device");
                    lock(&self.shared).account_changed = true;
                }
                Ok(())
            }
            KvsKey::Unknown(key) => {
                debug!(%key, "ignoring unknown key");
                Ok(())
            }
        }
    }

    async fn deliver(&self, from: PeerId, bundle: MessageBundle) -> Result<()> {
        for (view, bytes) in bundle.messages {
            match self.engines.get(&view) {
                Some(engine) => engine.deliver(from.clone(), bytes).await?,
                None => debug!(%view, peer = %from, "message for unknown view"),
            }
        }
        Ok(())
    }

    async fn handle_circle(&self, value: &[u8]) -> Result<()> {
        let incoming = Circle::from_bytes(value)?;
        let mut circle = self.circle.write().await;
        match apply_circle_update(&circle, &incoming) {
            Ok((next, CircleDecision::Adopted)) => {
                let before = std::mem::replace(&mut *circle, next.clone());
                drop(circle);
                info!(
                    generation = next.generation(),
                    members = next.members().len(),
                    applicants = next.applicants().len(),
                    "adopted circle update"
                );
                self.circle_changed(&before, &next).await
            }
            Ok((_, CircleDecision::NoOp)) => Ok(()),
            Ok((_, CircleDecision::Stale)) => {
                debug!(
                    incoming = incoming.generation(),
                    local = circle.generation(),
                    "discarding stale circle"
                );
                Ok(())
            }
            Ok((_, CircleDecision::LostTieBreak)) => {
                let local = circle.clone();
                drop(circle);
                info!(generation = local.generation(), "local circle won the tie-break, republishing");
                self.transport.publish_circle(&local).await?;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, generation = incoming.generation(), "rejecting circle update");
                Ok(())
            }
        }
    }

    async fn handle_retirement(&self, value: &[u8]) -> Result<()> {
        let ticket = RetirementTicket::from_bytes(value)?;
        let me = self.peer_id();
        if ticket.peer_id == me {
            return Ok(());
        }
        let keys = {
            let circle = self.circle.read().await;
            if ticket.circle != circle.name() || !circle.is_member(&me) {
                return Ok(());
            }
            match circle.members().get(&ticket.peer_id) {
                Some(info) => info.keys,
                None => {
                    debug!(peer = %ticket.peer_id, "retired peer already gone");
                    return Ok(());
                }
            }
        };
        ticket.verify(&keys)?;

        info!(peer = %ticket.peer_id, generation = ticket.generation, "retiring peer from ticket");
        match self.remove_peer(&ticket.peer_id).await {
            Ok(_) | Err(AccountError::Circle(CircleError::NotAMember(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Generate and publish fresh key parameters. Members only.
    pub async fn publish_parameters(&self) -> Result<KeyParameters> {
        if !self.is_member().await {
            return Err(AccountError::NotAMember);
        }
        let params = KeyParameters::generate();
        self.transport.publish_parameters(&params).await?;
        lock(&self.shared).parameters = Some(params.clone());
        info!("published key parameters");
        Ok(params)
    }

    /// Tell other devices the account changed.
    pub async fn signal_account_changed(&self) -> Result<()> {
        self.transport.publish_account_changed().await?;
        Ok(())
    }

    /// The data source behind `view` changed locally.
    pub async fn local_changed(&self, view: &str) -> Result<()> {
        let engine = self
            .engines
            .get(view)
            .ok_or_else(|| AccountError::UnknownView(view.to_string()))?;
        engine.local_changed().await?;
        Ok(())
    }

    /// Ask every engine for a sync pass.
    pub async fn sync(&self) -> Result<()> {
        for engine in self.engines.values() {
            engine.sync().await?;
        }
        Ok(())
    }

    /// Re-read the circle, parameters, and inbound bundles from the relay.
    ///
    /// Used at startup and after missing change notifications.
    pub async fn catch_up(&self) -> Result<()> {
        let mut circle = self.circle.write().await;
        let before = circle.clone();
        self.rebase(&mut circle).await?;
        let after = circle.clone();
        drop(circle);
        self.circle_changed(&before, &after).await?;

        if let Some(params) = self.transport.fetch_parameters().await? {
            lock(&self.shared).parameters = Some(params);
        }
        for peer in member_peers(&after, &self.peer_id()).into_keys() {
            if let Some(bundle) = self.transport.fetch_messages(&peer).await? {
                self.deliver(peer, bundle).await?;
            }
        }
        Ok(())
    }

    /// Handle relay changes until the stream closes.
    pub async fn run(&self, mut changes: broadcast::Receiver<KvsChange>) -> anyhow::Result<()> {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(e) = self.handle_kvs_change(&change).await {
                        warn!(key = %change.key, error = %e, "relay change rejected");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "change stream lagged, catching up");
                    self.catch_up().await.context("catching up after lagged change stream")?;
                }
                Err(RecvError::Closed) => {
                    debug!("change stream closed");
                    return Ok(());
                }
            }
        }
    }

    /// Flush and stop every engine.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first = None;
        for (view, engine) in &self.engines {
            if let Err(e) = engine.shutdown().await {
                warn!(%view, error = %e, "engine shutdown failed");
                first.get_or_insert(e);
            }
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        info!(peer = %self.peer_id(), "account shut down");
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("peer", &self.peer_id())
            .field("circle", &self.config.circle_name)
            .field("views", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}
