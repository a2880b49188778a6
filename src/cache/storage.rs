//! Cache repository trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheNamespace, CachedResponse};
use crate::http::{CacheKey, Response};

/// One entry of an atomic batch write.
#[derive(Debug, Clone)]
pub struct CacheWrite {
  pub key: CacheKey,
  pub url: String,
  pub response: Response,
}

/// Trait for cache storage backends.
///
/// Only the cache manager holds one of these; everything else goes through
/// the manager.
pub trait CacheRepository: Send + Sync {
  /// Names of every existing namespace, oldest first.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Create the namespace if it does not exist yet.
  #[cfg(test)]
  fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()>;

  /// Delete a namespace and all its entries. Returns false if it did not exist.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Get an entry from one namespace.
  #[cfg(test)]
  fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CachedResponse>>;

  /// Get an entry from the first namespace, oldest first, that holds the key.
  fn match_any(&self, key: &CacheKey) -> Result<Option<CachedResponse>>;

  /// Store an entry, replacing any previous one under the same key.
  fn put(&self, namespace: &CacheNamespace, write: &CacheWrite) -> Result<()>;

  /// Store all entries or none of them.
  fn put_all(&self, namespace: &CacheNamespace, writes: &[CacheWrite]) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per namespace generation; rowid gives creation order
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by canonical request key
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, cache_key),
    FOREIGN KEY (namespace) REFERENCES namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(cache_key);
"#;

fn insert_namespace(conn: &Connection, namespace: &CacheNamespace) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO namespaces (name, version) VALUES (?, ?)",
      params![namespace.name, namespace.version],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace.name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, namespace: &str, write: &CacheWrite) -> Result<()> {
  let headers = serde_json::to_string(&write.response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (namespace, cache_key, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        write.key.as_str(),
        write.url,
        write.response.status,
        headers,
        write.response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", write.url, e))?;
  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn row_to_cached((url, status, headers, body, stored_at): EntryRow) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
    },
    url,
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl CacheRepository for SqliteCacheStorage {
  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  #[cfg(test)]
  fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()> {
    let conn = self.conn()?;
    insert_namespace(&conn, namespace)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  #[cfg(test)]
  fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM entries
         WHERE namespace = ? AND cache_key = ?",
        params![namespace, key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    row.map(row_to_cached).transpose()
  }

  fn match_any(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.url, e.status, e.headers, e.body, e.stored_at FROM entries e
         INNER JOIN namespaces n ON n.name = e.namespace
         WHERE e.cache_key = ?
         ORDER BY n.rowid
         LIMIT 1",
        params![key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entry: {}", e))?;

    row.map(row_to_cached).transpose()
  }

  fn put(&self, namespace: &CacheNamespace, write: &CacheWrite) -> Result<()> {
    let conn = self.conn()?;
    insert_namespace(&conn, namespace)?;
    insert_entry(&conn, &namespace.name, write)
  }

  fn put_all(&self, namespace: &CacheNamespace, writes: &[CacheWrite]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_namespace(&tx, namespace)?;
    for write in writes {
      insert_entry(&tx, &namespace.name, write)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
