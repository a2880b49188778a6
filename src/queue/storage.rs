//! Durable store for queued mutations and queued notifications.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::{MutationStatus, NewMutation, QueuedMutation, QueuedNotification};

/// Persistent queue of mutations waiting for replay.
pub trait MutationQueueRepository: Send + Sync {
  /// Append a mutation. Returns the store-assigned id.
  fn enqueue(&self, mutation: &NewMutation, enqueued_at: DateTime<Utc>) -> Result<i64>;

  /// Pending mutations in `(enqueued_at, id)` order.
  fn pending(&self) -> Result<Vec<QueuedMutation>>;

  /// Every stored mutation, abandoned ones included, in `(enqueued_at, id)` order.
  fn all(&self) -> Result<Vec<QueuedMutation>>;

  /// Remove a mutation after a successful replay.
  fn remove(&self, id: i64) -> Result<()>;

  /// Count one failed replay. Returns the new attempt count.
  fn record_failure(
    &self,
    id: i64,
    next_attempt_at: Option<DateTime<Utc>>,
    status: MutationStatus,
  ) -> Result<u32>;
}

/// Persistent queue of push payloads to render on the next notification sync.
pub trait NotificationQueueRepository: Send + Sync {
  fn queue_notification(&self, payload: &str) -> Result<i64>;

  /// Queued payloads in insertion order.
  fn notifications(&self) -> Result<Vec<QueuedNotification>>;

  fn remove_notification(&self, id: i64) -> Result<()>;
}

/// SQLite-based durable store.
pub struct SqliteDurableStore {
  conn: Mutex<Connection>,
}

impl SqliteDurableStore {
  /// Open or create the durable store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open durable store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory durable store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(DURABLE_SCHEMA)
      .map_err(|e| eyre!("Failed to run durable store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn select_mutations(&self, only_pending: bool) -> Result<Vec<QueuedMutation>> {
    let conn = self.conn()?;
    let sql = if only_pending {
      "SELECT id, endpoint, payload, credential, enqueued_at, attempts, status, next_attempt_at
       FROM mutations WHERE status = 'pending' ORDER BY enqueued_at, id"
    } else {
      "SELECT id, endpoint, payload, credential, enqueued_at, attempts, status, next_attempt_at
       FROM mutations ORDER BY enqueued_at, id"
    };

    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], MutationRow::from_row)
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read mutation row: {}", e))?;

    rows.into_iter().map(MutationRow::into_mutation).collect()
  }
}

/// Schema for the durable collections.
const DURABLE_SCHEMA: &str = r#"
-- Mutations that failed for lack of connectivity, waiting for replay
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    payload TEXT NOT NULL,
    credential TEXT,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutations_order
    ON mutations(status, enqueued_at, id);

-- Push payloads to render on the next notification sync
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL
);
"#;

/// Fixed-width UTC timestamps sort lexicographically in time order.
fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

struct MutationRow {
  id: i64,
  endpoint: String,
  payload: String,
  credential: Option<String>,
  enqueued_at: String,
  attempts: u32,
  status: String,
  next_attempt_at: Option<String>,
}

impl MutationRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      endpoint: row.get(1)?,
      payload: row.get(2)?,
      credential: row.get(3)?,
      enqueued_at: row.get(4)?,
      attempts: row.get(5)?,
      status: row.get(6)?,
      next_attempt_at: row.get(7)?,
    })
  }

  fn into_mutation(self) -> Result<QueuedMutation> {
    Ok(QueuedMutation {
      id: self.id,
      endpoint: self.endpoint,
      payload: self.payload,
      credential: self.credential,
      enqueued_at: parse_timestamp(&self.enqueued_at)?,
      attempts: self.attempts,
      status: self.status.parse()?,
      next_attempt_at: self
        .next_attempt_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?,
    })
  }
}

impl MutationQueueRepository for SqliteDurableStore {
  fn enqueue(&self, mutation: &NewMutation, enqueued_at: DateTime<Utc>) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO mutations (endpoint, payload, credential, enqueued_at)
         VALUES (?, ?, ?, ?)",
        params![
          mutation.endpoint,
          mutation.payload,
          mutation.credential,
          format_timestamp(enqueued_at)
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.select_mutations(true)
  }

  fn all(&self) -> Result<Vec<QueuedMutation>> {
    self.select_mutations(false)
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(
    &self,
    id: i64,
    next_attempt_at: Option<DateTime<Utc>>,
    status: MutationStatus,
  ) -> Result<u32> {
    let conn = self.conn()?;
    conn
      .query_row(
        "UPDATE mutations
         SET attempts = attempts + 1, next_attempt_at = ?, status = ?
         WHERE id = ?
         RETURNING attempts",
        params![next_attempt_at.map(format_timestamp), status.as_str(), id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to record failed replay of mutation {}: {}", id, e))
  }
}

impl NotificationQueueRepository for SqliteDurableStore {
  fn queue_notification(&self, payload: &str) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO notifications (payload) VALUES (?)",
        params![payload],
      )
      .map_err(|e| eyre!("Failed to queue notification: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn notifications(&self) -> Result<Vec<QueuedNotification>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, payload FROM notifications ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let notifications = stmt
      .query_map([], |row| {
        Ok(QueuedNotification {
          id: row.get(0)?,
          payload: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to query notifications: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read notification row: {}", e))?;

    Ok(notifications)
  }

  fn remove_notification(&self, id: i64) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM notifications WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove notification {}: {}", id, e))?;
    Ok(())
  }
}
