//! SQLite implementation of the store traits.
//!
//! One database file holds the items and engine state of every view; each
//! [`SqliteStore`] handle is bound to a single view. Blocking calls run on
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use sos_core::{Digest, Item, Manifest};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{DataSource, StateStore};

/// SQLite-backed item store and engine state store for one view.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    view: String,
}

impl SqliteStore {
    /// Open (creating and migrating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, view: impl Into<String>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            view: view.into(),
        })
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_memory(view: impl Into<String>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            view: view.into(),
        })
    }

    /// Another handle on the same database, bound to `view`.
    pub fn for_view(&self, view: impl Into<String>) -> Self {
        Self {
            conn: self.conn.clone(),
            view: view.into(),
        }
    }

    /// The view this handle reads and writes.
    pub fn view(&self) -> &str {
        &self.view
    }

    /// Run `f` with the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let view = self.view.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn, &view)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn digest_from_blob(bytes: Vec<u8>) -> rusqlite::Result<Digest> {
    Digest::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "digest".into(), rusqlite::types::Type::Blob)
    })
}

#[async_trait]
impl DataSource for SqliteStore {
    async fn current_manifest(&self) -> Result<Manifest> {
        self.blocking(|conn, view| {
            let mut stmt = conn.prepare_cached("SELECT digest FROM items WHERE view = ?1")?;
            let digests = stmt
                .query_map(params![view], |row| digest_from_blob(row.get(0)?))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Manifest::new(digests))
        })
        .await
    }

    async fn fetch_items(&self, digests: &[Digest]) -> Result<HashMap<Digest, Item>> {
        let digests = digests.to_vec();
        self.blocking(move |conn, view| {
            let mut stmt =
                conn.prepare_cached("SELECT data FROM items WHERE view = ?1 AND digest = ?2")?;
            let mut found = HashMap::with_capacity(digests.len());
            for digest in digests {
                let data: Option<Vec<u8>> = stmt
                    .query_row(params![view, digest.as_bytes().as_slice()], |row| row.get(0))
                    .optional()?;
                if let Some(data) = data {
                    found.insert(digest, Item::from(data));
                }
            }
            Ok(found)
        })
        .await
    }

    async fn apply_changes(&self, added: Vec<Item>, removed: Vec<Digest>) -> Result<()> {
        self.blocking(move |conn, view| {
            let tx = conn.transaction()?;
            let now = now_millis();
            for digest in &removed {
                tx.execute(
                    "DELETE FROM items WHERE view = ?1 AND digest = ?2",
                    params![view, digest.as_bytes().as_slice()],
                )?;
            }
            for item in &added {
                tx.execute(
                    "INSERT OR IGNORE INTO items (view, digest, data, added_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![view, item.digest().as_bytes().as_slice(), item.as_bytes().as_ref(), now],
                )?;
            }
            tx.commit()?;
            debug!(view, added = added.len(), removed = removed.len(), "applied changes");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_engine_state(&self, view: &str) -> Result<Option<Vec<u8>>> {
        let view = view.to_string();
        self.blocking(move |conn, _| {
            Ok(conn
                .query_row(
                    "SELECT state FROM engine_state WHERE view = ?1",
                    params![view],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn save_engine_state(&self, view: &str, state: &[u8]) -> Result<()> {
        let view = view.to_string();
        let state = state.to_vec();
        self.blocking(move |conn, _| {
            conn.execute(
                "INSERT INTO engine_state (view, state, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(view) DO UPDATE SET
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![view, state, now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(s: &str) -> Item {
        Item::from(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_apply_and_fetch() {
        let store = SqliteStore::open_memory("passwords").unwrap();
        let a = item("alpha");
        let b = item("beta");

        store.apply_changes(vec![a.clone(), b.clone()], vec![]).await.unwrap();
        let manifest = store.current_manifest().await.unwrap();
        assert_eq!(manifest, Manifest::new(vec![a.digest(), b.digest()]));

        let fetched = store.fetch_items(&[a.digest(), Digest::of(b"missing")]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[&a.digest()], a);
    }

    #[tokio::test]
    async fn test_remove_and_reapply() {
        let store = SqliteStore::open_memory("passwords").unwrap();
        let a = item("alpha");
        store.apply_changes(vec![a.clone()], vec![]).await.unwrap();
        store.apply_changes(vec![a.clone()], vec![]).await.unwrap();
        store.apply_changes(vec![], vec![a.digest()]).await.unwrap();
        assert!(store.current_manifest().await.unwrap().is_empty());
        store.apply_changes(vec![], vec![a.digest()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_views_are_isolated() {
        let passwords = SqliteStore::open_memory("passwords").unwrap();
        let wifi = passwords.for_view("wifi");
        passwords.apply_changes(vec![item("secret")], vec![]).await.unwrap();

        assert_eq!(passwords.current_manifest().await.unwrap().len(), 1);
        assert!(wifi.current_manifest().await.unwrap().is_empty());
        assert_eq!(wifi.view(), "wifi");
    }

    #[tokio::test]
    async fn test_engine_state_upsert() {
        let store = SqliteStore::open_memory("passwords").unwrap();
        assert!(store.load_engine_state("passwords").await.unwrap().is_none());
        store.save_engine_state("passwords", b"v1").await.unwrap();
        store.save_engine_state("passwords", b"v2").await.unwrap();
        assert_eq!(store.load_engine_state("passwords").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sos.db");
        let a = item("durable");
        {
            let store = SqliteStore::open(&path, "passwords").unwrap();
            store.apply_changes(vec![a.clone()], vec![]).await.unwrap();
            store.save_engine_state("passwords", b"state").await.unwrap();
        }
        let store = SqliteStore::open(&path, "passwords").unwrap();
        assert!(store.current_manifest().await.unwrap().contains(&a.digest()));
        assert_eq!(store.load_engine_state("passwords").await.unwrap().unwrap(), b"state");
    }
}
