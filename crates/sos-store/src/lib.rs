//! # SOS Store
//!
//! Storage abstraction for the sync engine: the item store each view
//! synchronizes and the opaque engine state kept between restarts.
//!
//! ## Key Types
//!
//! - [`DataSource`] - Async trait over a view's keychain items
//! - [`StateStore`] - Async trait for saved engine snapshots
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sos_store::{DataSource, SqliteStore};
//! use sos_core::Item;
//!
//! async fn example() {
//!     let store = SqliteStore::open("sos.db", "passwords").unwrap();
//!     store
//!         .apply_changes(vec![Item::from(b"ciphertext".to_vec())], vec![])
//!         .await
//!         .unwrap();
//!     let manifest = store.current_manifest().await.unwrap();
//!     assert_eq!(manifest.len(), 1);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Transactional applies**: `apply_changes` lands every add and removal or none
//! - **Idempotent changes**: re-adding a present item or removing an absent one is a no-op
//! - **One file, many views**: SQLite handles for different views share a connection

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{DataSource, DataSourceExt, StateStore};
