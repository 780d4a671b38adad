//! SQLite schema versions.
//!
//! Every entry in [`MIGRATIONS`] runs once, in order, inside one
//! transaction; applied versions are recorded in `schema_migrations`.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};

/// `(version, sql)` pairs, strictly increasing.
const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
    -- Opaque, already-encrypted keychain blobs, keyed by content digest
    CREATE TABLE items (
        view TEXT NOT NULL,
        digest BLOB NOT NULL,
        data BLOB NOT NULL,
        added_at INTEGER NOT NULL,
        PRIMARY KEY (view, digest)
    );

    -- Serialized engine snapshot, one row per view
    CREATE TABLE engine_state (
        view TEXT PRIMARY KEY,
        state BLOB NOT NULL,
        updated_at INTEGER NOT NULL
    );
    "#,
)];

/// Schema version after [`migrate`] returns.
pub const CURRENT_VERSION: u32 = MIGRATIONS[MIGRATIONS.len() - 1].0;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let applied: u32 = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema {applied} is newer than supported {CURRENT_VERSION}"
        )));
    }

    let pending: Vec<&(u32, &str)> = MIGRATIONS.iter().filter(|(v, _)| *v > applied).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, sql) in pending {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_millis()],
        )?;
        tracing::debug!(version, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}

/// Wall clock in Unix milliseconds, or 0 before the epoch.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_gets_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(tables(&conn), vec!["engine_state", "items", "schema_migrations"]);
    }

    #[test]
    fn test_reopen_runs_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        for _ in 0..3 {
            migrate(&mut conn).unwrap();
        }
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, 0)",
            params![CURRENT_VERSION + 1],
        )
        .unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
