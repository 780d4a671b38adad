//! The per-view reconciliation engine.
//!
//! An [`Engine`] owns one view: the local manifest, one [`PeerState`] per
//! circle member, and the data source the view synchronizes. It never
//! touches the relay itself. [`Engine::sync_all`] returns [`Outbound`]
//! messages for the caller to put, and the caller reports each put back
//! through [`Engine::message_sent`].
//!
//! ## Protocol
//!
//! Each data message carries a [`SyncPayload`]: the sender's manifest
//! digest, a delta against the manifest the receiver last acknowledged, and
//! an acknowledgement of the receiver's own manifest. A receiver that cannot
//! rebuild the sender's manifest (unknown base, digest mismatch, sequence
//! gap) applies nothing and asks for a full snapshot instead.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sos_coder::{CoderError, CoderOutcome, CoderSnapshot, CoderState, PeerCoder, SessionId, WireMessage};
use sos_core::{DeviceIdentity, Digest, Item, Manifest, ManifestCache, PeerId, PeerKeys};
use sos_store::{DataSource, StateStore};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::messages::{SyncPayload, PROTOCOL_VERSION};

/// Called with the view name and local manifest digest when every peer
/// holds the local manifest.
pub type SyncListener = Arc<dyn Fn(&str, &Digest) + Send + Sync>;

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Syncing,
    ApplyingRemote,
    Persisting,
}

/// A message ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: PeerId,
    pub view: String,
    pub bytes: Bytes,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A payload was reconstructed and applied.
    Applied { added: usize, removed: usize },
    /// Nothing applied; a full snapshot will be requested.
    NeedFull,
    /// A handshake message was consumed.
    Handshake,
    /// Already seen.
    Duplicate,
    /// Left over from an earlier session.
    Stale,
    /// The sender is not a current peer.
    Dropped,
}

/// Summary of a sent data message, so an identical one is not sent again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SentMarker {
    session: Option<SessionId>,
    local: Digest,
    base: Option<Digest>,
    ack: Option<Digest>,
    request_full: bool,
}

#[derive(Debug, Clone)]
enum Pending {
    Data { bytes: Bytes, marker: SentMarker, full: bool },
    Handshake { message: WireMessage, bytes: Bytes },
}

impl Pending {
    fn bytes(&self) -> &Bytes {
        match self {
            Pending::Data { bytes, .. } | Pending::Handshake { bytes, .. } => bytes,
        }
    }
}

/// Everything the engine knows about one remote peer.
pub struct PeerState {
    keys: PeerKeys,
    coder: PeerCoder,
    /// Manifests rebuilt from this peer's messages, newest last.
    received: VecDeque<Arc<Manifest>>,
    /// The local manifest the peer last acknowledged.
    acked: Option<Arc<Manifest>>,
    /// The `ack` field of the peer's last payload, as sent.
    peer_ack: Option<Digest>,
    /// Local manifests recently advertised to the peer.
    sent: VecDeque<Arc<Manifest>>,
    last_sent: Option<SentMarker>,
    last_handshake: Option<WireMessage>,
    pending: Option<Pending>,
    in_flight: bool,
    reply: Option<WireMessage>,
    need_full: bool,
    send_full: bool,
}

impl PeerState {
    fn new(local: PeerId, peer: PeerId, keys: PeerKeys) -> Self {
        Self {
            keys,
            coder: PeerCoder::new(local, peer, keys),
            received: VecDeque::new(),
            acked: None,
            peer_ack: None,
            sent: VecDeque::new(),
            last_sent: None,
            last_handshake: None,
            pending: None,
            in_flight: false,
            reply: None,
            need_full: false,
            send_full: false,
        }
    }

    pub fn keys(&self) -> &PeerKeys {
        &self.keys
    }

    pub fn coder(&self) -> &PeerCoder {
        &self.coder
    }

    /// The peer's manifest as last rebuilt from its messages.
    pub fn peer_manifest(&self) -> Option<&Arc<Manifest>> {
        self.received.back()
    }

    pub fn acked(&self) -> Option<&Arc<Manifest>> {
        self.acked.as_ref()
    }

    /// Whether the peer's last payload acknowledged `manifest`.
    pub fn has_acknowledged(&self, manifest: &Digest) -> bool {
        self.peer_ack.as_ref() == Some(manifest)
    }

    pub fn need_full(&self) -> bool {
        self.need_full
    }

    pub fn send_full(&self) -> bool {
        self.send_full
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn remember_received(&mut self, manifest: Arc<Manifest>, cap: usize) {
        if self.peer_manifest().map(|m| m.digest()) == Some(manifest.digest()) {
            return;
        }
        self.received.push_back(manifest);
        while self.received.len() > cap.max(1) {
            self.received.pop_front();
        }
    }

    fn remember_sent(&mut self, manifest: Arc<Manifest>, cap: usize) {
        if self.sent.iter().any(|m| m.digest() == manifest.digest()) {
            return;
        }
        self.sent.push_back(manifest);
        while self.sent.len() > cap.max(1) {
            self.sent.pop_front();
        }
    }

    /// A new session began: anything sent under the old one must be resent.
    fn session_changed(&mut self) {
        self.last_sent = None;
        self.last_handshake = None;
    }
}

fn outbound(view: &str, peer: &PeerId, bytes: Bytes) -> Outbound {
    Outbound {
        to: peer.clone(),
        view: view.to_string(),
        bytes,
    }
}

/// First manifest among `candidates`, then the cache, whose digest is `digest`.
fn find_manifest<'a>(
    digest: &Digest,
    candidates: impl IntoIterator<Item = &'a Arc<Manifest>>,
    cache: &ManifestCache,
) -> Option<Arc<Manifest>> {
    candidates
        .into_iter()
        .find(|m| &m.digest() == digest)
        .cloned()
        .or_else(|| cache.acquire(digest))
}

/// The sync engine for one view.
pub struct Engine {
    view: String,
    local_id: PeerId,
    identity: Arc<DeviceIdentity>,
    data: Arc<dyn DataSource>,
    state_store: Arc<dyn StateStore>,
    cache: Arc<ManifestCache>,
    config: EngineConfig,
    local: Arc<Manifest>,
    peers: BTreeMap<PeerId, PeerState>,
    phase: Phase,
    dirty: bool,
    rerun: bool,
    in_sync: bool,
    listener: Option<SyncListener>,
}

impl Engine {
    /// Open the engine for `view`, restoring saved state if there is any.
    pub async fn open(
        view: impl Into<String>,
        identity: Arc<DeviceIdentity>,
        data: Arc<dyn DataSource>,
        state_store: Arc<dyn StateStore>,
        cache: Arc<ManifestCache>,
        config: EngineConfig,
    ) -> Result<Self> {
        let view = view.into();
        let local = cache.intern(data.current_manifest().await?);
        let mut engine = Self {
            local_id: identity.peer_id(),
            view,
            identity,
            data,
            state_store,
            cache,
            config,
            local,
            peers: BTreeMap::new(),
            phase: Phase::Idle,
            dirty: false,
            rerun: false,
            in_sync: false,
            listener: None,
        };

        if let Some(bytes) = engine.state_store.load_engine_state(&engine.view).await? {
            match EngineSnapshot::from_bytes(&bytes) {
                Ok(snapshot) => engine.restore(snapshot),
                Err(e) => warn!(view = %engine.view, error = %e, "discarding unreadable engine state"),
            }
        }
        debug!(view = %engine.view, local = %engine.local.digest(), peers = engine.peers.len(), "engine open");
        Ok(engine)
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn local_manifest(&self) -> &Arc<Manifest> {
        &self.local
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether every peer holds the local manifest.
    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<&PeerState> {
        self.peers.get(peer)
    }

    pub fn set_sync_listener(&mut self, listener: SyncListener) {
        self.listener = Some(listener);
    }

    /// Consume the "run another sync pass" flag.
    pub fn take_rerun(&mut self) -> bool {
        std::mem::take(&mut self.rerun)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────────────────

    /// Make the peer set match `peers`.
    ///
    /// Peers that are gone (or whose keys changed) lose their state at once,
    /// including any queued message.
    pub fn set_peers(&mut self, peers: BTreeMap<PeerId, PeerKeys>) {
        let before = self.peers.len();
        self.peers.retain(|id, state| {
            let keep = peers.get(id) == Some(&state.keys);
            if !keep {
                info!(peer = %id, "dropping peer state");
            }
            keep
        });
        for (id, keys) in peers {
            if id == self.local_id || self.peers.contains_key(&id) {
                continue;
            }
            debug!(peer = %id, "adding peer");
            self.peers
                .insert(id.clone(), PeerState::new(self.local_id.clone(), id, keys));
            self.rerun = true;
        }
        if self.peers.len() != before {
            self.dirty = true;
        }
        self.check_sync_complete();
    }

    /// Re-read the local manifest after the data source changed.
    pub async fn local_changed(&mut self) -> Result<()> {
        let manifest = self.data.current_manifest().await?;
        if manifest.digest() != self.local.digest() {
            debug!(view = %self.view, from = %self.local.digest(), to = %manifest.digest(), "local manifest changed");
            self.local = self.cache.intern(manifest);
            self.rerun = true;
            self.dirty = true;
        }
        self.check_sync_complete();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a pass over every peer. Errors are logged per peer.
    pub async fn sync_all(&mut self) -> Vec<Outbound> {
        self.phase = Phase::Syncing;
        self.rerun = false;
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        let mut out = Vec::new();
        for peer in peers {
            match self.sync_with_peer(&peer).await {
                Ok(Some(message)) => out.push(message),
                Ok(None) => {}
                Err(e) => warn!(view = %self.view, peer = %peer, error = %e, "sync failed"),
            }
        }
        self.phase = Phase::Idle;
        out
    }

    /// The next message for `peer`, if it needs one.
    ///
    /// At most one message per peer is in flight. A message whose put failed
    /// is returned again unchanged before anything new is built.
    pub async fn sync_with_peer(&mut self, peer: &PeerId) -> Result<Option<Outbound>> {
        let state = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| EngineError::UnknownPeer(peer.clone()))?;

        if state.in_flight {
            return Ok(None);
        }
        if let Some(pending) = &state.pending {
            debug!(peer = %peer, "re-sending pending message");
            state.in_flight = true;
            return Ok(Some(outbound(&self.view, peer, pending.bytes().clone())));
        }

        if state.coder.state() == CoderState::Faulted {
            warn!(peer = %peer, "coder faulted, re-negotiating");
            state.coder.reset();
            state.session_changed();
            self.dirty = true;
        }

        if let Some(reply) = state.reply.take() {
            if state.last_handshake.as_ref() != Some(&reply) {
                let bytes: Bytes = reply.to_bytes()?.into();
                state.pending = Some(Pending::Handshake { message: reply, bytes: bytes.clone() });
                state.in_flight = true;
                return Ok(Some(outbound(&self.view, peer, bytes)));
            }
        }

        if !state.coder.is_established() {
            // The payload is built once a session exists.
            let Some(out) = state.coder.send_message_if_needed(&self.identity, Some(&[]))? else {
                return Ok(None);
            };
            if state.last_handshake.as_ref() == Some(&out.message) {
                return Ok(None);
            }
            let bytes: Bytes = out.message.to_bytes()?.into();
            state.pending = Some(Pending::Handshake { message: out.message, bytes: bytes.clone() });
            state.in_flight = true;
            self.dirty = true;
            return Ok(Some(outbound(&self.view, peer, bytes)));
        }

        // A peer that already holds our manifest can rebuild deltas from it.
        if state.peer_manifest().map(|m| m.digest()) == Some(self.local.digest()) {
            state.acked = Some(self.local.clone());
        }

        let full = state.send_full || state.acked.is_none();
        let base = if full { None } else { state.acked.clone() };
        let ack = state.peer_manifest().map(|m| m.digest());
        let request_full = state.need_full;
        let marker = SentMarker {
            session: state.coder.session_id(),
            local: self.local.digest(),
            base: base.as_ref().map(|m| m.digest()),
            ack,
            request_full,
        };

        // Nothing new only if the peer has confirmed our current manifest;
        // holding the same items does not tell it what we hold.
        let unchanged_ack = state.last_sent.as_ref().map(|m| m.ack) == Some(ack);
        let confirmed = state.has_acknowledged(&marker.local);
        if !request_full && marker.base == Some(marker.local) && unchanged_ack && confirmed {
            return Ok(None);
        }
        if state.last_sent.as_ref() == Some(&marker) {
            return Ok(None);
        }

        // Gather the items; the peer state borrow ends here.
        let (added_digests, removed) = match &base {
            Some(base) => {
                let delta = Manifest::diff(base, &self.local);
                (delta.added, delta.removed)
            }
            None => (self.local.entries().to_vec(), Vec::new()),
        };
        let mut fetched = self.data.fetch_items(&added_digests).await?;
        let mut added: Vec<Item> = Vec::with_capacity(added_digests.len());
        for digest in &added_digests {
            match fetched.remove(digest) {
                Some(item) => added.push(item),
                None => {
                    let missing = added_digests.len() - added.len();
                    self.local_changed().await?;
                    return Err(EngineError::MissingItems(missing));
                }
            }
        }

        let payload = SyncPayload {
            version: PROTOCOL_VERSION,
            manifest: self.local.digest(),
            base: marker.base,
            added,
            removed,
            ack,
            request_full,
        };
        let plaintext = payload.to_bytes()?;

        let state = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| EngineError::UnknownPeer(peer.clone()))?;
        let Some(out) = state.coder.send_message_if_needed(&self.identity, Some(&plaintext))? else {
            return Ok(None);
        };
        debug!(
            view = %self.view,
            peer = %peer,
            seq = ?out.seq,
            full,
            items = payload.added.len(),
            removed = payload.removed.len(),
            request_full,
            "sending payload"
        );
        state.remember_sent(self.local.clone(), self.config.peer_manifest_history);
        let bytes: Bytes = out.message.to_bytes()?.into();
        state.pending = Some(Pending::Data { bytes: bytes.clone(), marker, full });
        state.in_flight = true;
        self.dirty = true;
        Ok(Some(outbound(&self.view, peer, bytes)))
    }

    /// Completion of a put for `peer`.
    ///
    /// On failure the message stays pending and goes out again on the next
    /// pass. Completions for peers that have since been dropped are ignored.
    pub fn message_sent(&mut self, peer: &PeerId, ok: bool) {
        let Some(state) = self.peers.get_mut(peer) else {
            debug!(peer = %peer, "ignoring completion for dropped peer");
            return;
        };
        state.in_flight = false;
        self.rerun = true;
        if !ok {
            warn!(view = %self.view, peer = %peer, "put failed, keeping message");
            return;
        }
        match state.pending.take() {
            Some(Pending::Data { marker, full, .. }) => {
                if full {
                    state.send_full = false;
                }
                state.last_sent = Some(marker);
            }
            Some(Pending::Handshake { message, .. }) => {
                state.last_handshake = Some(message);
            }
            None => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle a wire message from `from`.
    pub async fn receive_message(&mut self, from: &PeerId, bytes: &[u8]) -> Result<Received> {
        self.phase = Phase::ApplyingRemote;
        let result = self.receive_inner(from, bytes).await;
        self.phase = Phase::Idle;
        result
    }

    async fn receive_inner(&mut self, from: &PeerId, bytes: &[u8]) -> Result<Received> {
        let Some(state) = self.peers.get_mut(from) else {
            debug!(view = %self.view, peer = %from, "dropping message from non-member");
            return Ok(Received::Dropped);
        };

        let wire = WireMessage::from_bytes(bytes)?;
        let session = state.coder.session_id();
        let outcome = match state.coder.handle_message(&self.identity, &wire) {
            Ok(outcome) => outcome,
            Err(CoderError::UnknownSession)
            | Err(CoderError::HandshakeMismatch)
            | Err(CoderError::StaleHello { .. }) => {
                debug!(peer = %from, kind = wire.kind(), "stale message");
                return Ok(Received::Stale);
            }
            Err(e) => {
                self.dirty = true;
                self.rerun = true;
                return Err(e.into());
            }
        };
        if state.coder.session_id() != session {
            state.session_changed();
            self.dirty = true;
        }

        match outcome {
            CoderOutcome::Duplicate => Ok(Received::Duplicate),
            CoderOutcome::Handled { reply } => {
                if reply.is_some() {
                    state.reply = reply;
                }
                self.rerun = true;
                Ok(Received::Handshake)
            }
            CoderOutcome::Decoded { plaintext, gap, .. } => {
                self.dirty = true;
                self.rerun = true;
                let payload = SyncPayload::from_bytes(&plaintext)?;
                self.apply_payload(from, payload, gap).await
            }
        }
    }

    async fn apply_payload(&mut self, from: &PeerId, payload: SyncPayload, gap: bool) -> Result<Received> {
        let items = payload.added.len() + payload.removed.len();
        if items > self.config.max_items_per_message {
            warn!(peer = %from, items, "payload too large");
            return Err(EngineError::PayloadTooLarge(items));
        }

        let cap = self.config.peer_manifest_history;
        let state = self
            .peers
            .get_mut(from)
            .ok_or_else(|| EngineError::UnknownPeer(from.clone()))?;

        // Acknowledgement and full requests hold even if the delta fails.
        if payload.request_full {
            debug!(peer = %from, "peer asked for a full snapshot");
            state.send_full = true;
        }
        state.peer_ack = payload.ack;
        if let Some(ack) = payload.ack {
            let candidates = std::iter::once(&self.local).chain(state.sent.iter());
            state.acked = find_manifest(&ack, candidates, &self.cache);
            if state.acked.is_none() {
                debug!(peer = %from, %ack, "acknowledged manifest unknown, next send is full");
            }
        }

        let base = match payload.base {
            None => None,
            Some(_) if gap => {
                debug!(peer = %from, "delta after a sequence gap");
                state.need_full = true;
                return Ok(Received::NeedFull);
            }
            Some(digest) => {
                let candidates = state.received.iter().rev().chain(std::iter::once(&self.local));
                match find_manifest(&digest, candidates, &self.cache) {
                    Some(base) => Some(base),
                    None => {
                        debug!(peer = %from, base = %digest, "unknown delta base");
                        state.need_full = true;
                        return Ok(Received::NeedFull);
                    }
                }
            }
        };

        let Some(rebuilt) = payload.reconstruct(base.as_deref()) else {
            warn!(peer = %from, expected = %payload.manifest, "rebuilt manifest does not match");
            state.need_full = true;
            return Ok(Received::NeedFull);
        };

        let is_full = payload.base.is_none();
        let added: Vec<Item> = payload
            .added
            .into_iter()
            .filter(|item| !self.local.contains(&item.digest()))
            .collect();
        let removed: Vec<Digest> = if is_full {
            Vec::new()
        } else {
            payload
                .removed
                .into_iter()
                .filter(|d| self.local.contains(d))
                .collect()
        };
        let counts = (added.len(), removed.len());

        if counts != (0, 0) {
            if let Err(e) = self.data.apply_changes(added, removed).await {
                warn!(peer = %from, error = %e, "apply failed, requesting full snapshot");
                state.need_full = true;
                return Err(e.into());
            }
            self.local = self.cache.intern(self.data.current_manifest().await?);
        }

        state.remember_received(self.cache.intern(rebuilt), cap);
        state.need_full = false;
        debug!(
            view = %self.view,
            peer = %from,
            full = is_full,
            added = counts.0,
            removed = counts.1,
            "applied payload"
        );

        self.mark_peer_in_sync(from);
        Ok(Received::Applied {
            added: counts.0,
            removed: counts.1,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Completion
    // ─────────────────────────────────────────────────────────────────────────

    fn mark_peer_in_sync(&mut self, peer: &PeerId) {
        let matches = self
            .peers
            .get(peer)
            .and_then(PeerState::peer_manifest)
            .map(|m| m.digest() == self.local.digest())
            .unwrap_or(false);
        if matches {
            debug!(view = %self.view, peer = %peer, "peer holds local manifest");
        }
        self.check_sync_complete();
    }

    fn check_sync_complete(&mut self) {
        let local = self.local.digest();
        let complete = !self.peers.is_empty()
            && self
                .peers
                .values()
                .all(|s| s.peer_manifest().map(|m| m.digest()) == Some(local));

        if complete && !self.in_sync {
            info!(view = %self.view, manifest = %local, items = self.local.len(), "view in sync");
            if let Some(listener) = &self.listener {
                listener(&self.view, &local);
            }
        }
        self.in_sync = complete;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Capture the engine state.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            version: PROTOCOL_VERSION,
            peers: self
                .peers
                .iter()
                .map(|(id, state)| {
                    (
                        id.clone(),
                        PeerSnapshot {
                            keys: state.keys,
                            peer_manifest: state.peer_manifest().map(|m| Manifest::clone(m)),
                            acked: state.acked.as_ref().map(|m| Manifest::clone(m)),
                            peer_ack: state.peer_ack,
                            need_full: state.need_full,
                            send_full: state.send_full,
                            coder: state.coder.snapshot(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: EngineSnapshot) {
        for (id, saved) in snapshot.peers {
            if id == self.local_id {
                continue;
            }
            let mut state = PeerState::new(self.local_id.clone(), id.clone(), saved.keys);
            state.coder = PeerCoder::from_snapshot(self.local_id.clone(), id.clone(), saved.keys, saved.coder);
            if let Some(m) = saved.peer_manifest {
                state.received.push_back(self.cache.intern(m));
            }
            state.acked = saved.acked.map(|m| self.cache.intern(m));
            state.peer_ack = saved.peer_ack;
            state.need_full = saved.need_full;
            state.send_full = saved.send_full;
            self.peers.insert(id, state);
        }
        self.check_sync_complete();
    }

    /// Write the snapshot to the state store and clear the dirty flag.
    pub async fn save(&mut self) -> Result<()> {
        self.phase = Phase::Persisting;
        let result = match self.snapshot().to_bytes() {
            Ok(bytes) => self
                .state_store
                .save_engine_state(&self.view, &bytes)
                .await
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };
        self.phase = Phase::Idle;
        result?;
        self.dirty = false;
        debug!(view = %self.view, "engine state saved");
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("view", &self.view)
            .field("local", &self.local.digest())
            .field("peers", &self.peers.len())
            .field("phase", &self.phase)
            .field("in_sync", &self.in_sync)
            .finish()
    }
}

/// Persisted state of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub keys: PeerKeys,
    pub peer_manifest: Option<Manifest>,
    pub acked: Option<Manifest>,
    #[serde(default)]
    pub peer_ack: Option<Digest>,
    pub need_full: bool,
    pub send_full: bool,
    pub coder: CoderSnapshot,
}

/// Persisted engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u8,
    pub peers: BTreeMap<PeerId, PeerSnapshot>,
}

impl EngineSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self =
            ciborium::from_reader(bytes).map_err(|e| EngineError::Serialization(e.to_string()))?;
        if snapshot.version != PROTOCOL_VERSION {
            return Err(EngineError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}
