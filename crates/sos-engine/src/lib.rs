//! # SOS Engine
//!
//! Manifest-delta sync for one device and its circle peers, over a
//! key-value relay.
//!
//! ## Overview
//!
//! Every view (a named set of opaque items) is synchronized by its own
//! [`Engine`]. The engine compares its local [`Manifest`](sos_core::Manifest)
//! with what each peer last acknowledged, and sends just the difference
//! through that peer's [`PeerCoder`](sos_coder::PeerCoder). The relay is a
//! last-writer-wins key-value store, so every message between two devices
//! lands under one key and may overwrite the previous one; the protocol
//! recovers from lost messages by falling back to full snapshots.
//!
//! ## Key Properties
//!
//! - **Convergent**: all members end up holding the union of adds, minus
//!   acknowledged removals
//! - **Idempotent**: replayed or duplicated messages change nothing
//! - **Resumable**: peer state and coder sessions survive restarts
//! - **Scoped failures**: a broken peer never stalls the others
//!
//! ## Message Flow
//!
//! ```text
//! Device A                                  Device B
//!   |-------- Hello -------------------------->|
//!   |<------- HelloAck ------------------------|
//!   |-------- Data(full, ack=None) ----------->|
//!   |<------- Data(full, ack=A1) --------------|
//!   |-------- Data(delta base=B1, ack=B1) ---->|
//!   |<------- Data(delta base=A1, ack=A2) -----|
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sos_core::{DeviceIdentity, ManifestCache};
//! use sos_engine::{Engine, EngineConfig, EngineHandle, KeyField, SosTransport};
//! use sos_engine::transport::memory::MemoryKvs;
//! use sos_store::MemoryStore;
//!
//! async fn example() -> sos_engine::Result<()> {
//!     let identity = Arc::new(DeviceIdentity::generate());
//!     let store = Arc::new(MemoryStore::new());
//!     let config = EngineConfig::default();
//!     let engine = Engine::open(
//!         "passwords",
//!         identity.clone(),
//!         store.clone(),
//!         store,
//!         Arc::new(ManifestCache::new()),
//!         config.clone(),
//!     )
//!     .await?;
//!
//!     let transport = SosTransport::new(MemoryKvs::new(), KeyField::new("keychain")?, identity.peer_id());
//!     let (handle, _task) = EngineHandle::spawn(engine, Arc::new(transport), &config);
//!     handle.sync().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod messages;
pub mod queue;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{Engine, EngineSnapshot, Outbound, PeerSnapshot, PeerState, Phase, Received, SyncListener};
pub use error::{EngineError, Result};
pub use keys::{key_type, parse_key, KeyField, KvsKey, KvsKeyType, ACCOUNT_CHANGED_KEY, DELIMITER};
pub use messages::{SyncPayload, PROTOCOL_VERSION};
pub use queue::{Command, EngineHandle, EngineStatus};
pub use transport::{KvsChange, KvsTransport, MessageBundle, SosTransport};
