//! # SOS
//!
//! Secure Object Sync: a small group of devices (a *circle*) keeps its
//! keychain views identical over an untrusted key-value relay.
//!
//! ## Overview
//!
//! - **Circle**: signed, generation-counted membership with applicants and
//!   retired peers
//! - **Manifest**: the sorted digest set of a view, diffed to build deltas
//! - **PeerCoder**: authenticated, encrypted, replay-protected channel per
//!   peer pair
//! - **Engine**: per-view reconciliation that converges every member on the
//!   same item set
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sos_account::{Account, AccountConfig, ViewStores};
//! use sos_account::core::DeviceIdentity;
//! use sos_account::engine::transport::memory::MemoryKvs;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let relay = MemoryKvs::new();
//!     let account = Arc::new(
//!         Account::open(
//!             AccountConfig::default(),
//!             DeviceIdentity::generate(),
//!             relay,
//!             |_view| Ok(ViewStores::memory()),
//!         )
//!         .await?,
//!     );
//!
//!     let changes = account.subscribe();
//!     let runner = account.clone();
//!     tokio::spawn(async move { runner.run(changes).await });
//!
//!     account.reset_to_offering().await?;
//!     account.publish_parameters().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `sos_account::core` - Digests, manifests, identities, the circle
//! - `sos_account::coder` - The per-peer secure channel
//! - `sos_account::store` - Item and engine-state storage, SQLite
//! - `sos_account::engine` - Sync engine, KVS keys and transport

pub mod account;
pub mod config;
pub mod error;

// Re-export component crates
pub use sos_coder as coder;
pub use sos_core as core;
pub use sos_engine as engine;
pub use sos_store as store;

pub use account::{Account, ViewStores};
pub use config::AccountConfig;
pub use error::{AccountError, Result};

// Re-export commonly used types
pub use sos_core::{Circle, CircleDecision, DeviceIdentity, Digest, Item, Manifest, PeerId, PeerInfo};
pub use sos_engine::{EngineConfig, EngineStatus, KvsTransport};
