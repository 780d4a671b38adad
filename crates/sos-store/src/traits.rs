//! Store traits: the abstract interfaces the engine persists through.
//!
//! [`DataSource`] is the keychain item store a view synchronizes.
//! [`StateStore`] holds the engine's own opaque state between restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use sos_core::{Digest, Item, Manifest};

use crate::error::Result;

/// The item store behind one view.
///
/// Items are opaque, already-encrypted blobs identified by their digest.
#[async_trait]
pub trait DataSource: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// The manifest of everything currently stored.
    async fn current_manifest(&self) -> Result<Manifest>;

    /// Fetch the items for `digests`.
    ///
    /// Digests the store does not hold are absent from the returned map.
    async fn fetch_items(&self, digests: &[Digest]) -> Result<HashMap<Digest, Item>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Add `added` and remove `removed` in one transaction.
    ///
    /// Either every change lands or none does. Adding an item that is
    /// already present, or removing one that is absent, is not an error.
    async fn apply_changes(&self, added: Vec<Item>, removed: Vec<Digest>) -> Result<()>;
}

/// Opaque per-view engine state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state for `view`, if any.
    async fn load_engine_state(&self, view: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the saved state for `view`.
    async fn save_engine_state(&self, view: &str, state: &[u8]) -> Result<()>;
}

/// Convenience helpers over any [`DataSource`].
pub trait DataSourceExt: DataSource {
    /// Insert items outside of sync (a local edit).
    fn insert_items(
        &self,
        items: Vec<Item>,
    ) -> impl std::future::Future<Output = Result<Manifest>> + Send;

    /// Delete items outside of sync (a local edit).
    fn delete_items(
        &self,
        digests: Vec<Digest>,
    ) -> impl std::future::Future<Output = Result<Manifest>> + Send;
}

impl<S: DataSource + ?Sized> DataSourceExt for S {
    async fn insert_items(&self, items: Vec<Item>) -> Result<Manifest> {
        self.apply_changes(items, Vec::new()).await?;
        self.current_manifest().await
    }

    async fn delete_items(&self, digests: Vec<Digest>) -> Result<Manifest> {
        self.apply_changes(Vec::new(), digests).await?;
        self.current_manifest().await
    }
}
