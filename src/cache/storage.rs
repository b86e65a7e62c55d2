//! Storage traits and SQLite implementation for partitions, the offline
//! queue and worker lifecycle state.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};
use crate::origin::Response;
use crate::queue::{MutationStatus, NewMutation, QueuedMutation};

/// Writes applied in a single transaction.
#[derive(Debug, Default)]
pub struct Batch {
  /// Partitions to create (no-op if they exist)
  pub partitions: Vec<String>,
  /// (partition, key, response)
  pub entries: Vec<(String, RequestKey, Response)>,
  /// Worker state values to set
  pub state: Vec<(String, String)>,
}

/// Named, versioned partitions of stored request/response pairs.
pub trait CacheStorage: Send + Sync {
  /// Create a partition if it does not exist yet.
  fn open_partition(&self, name: &str) -> Result<()>;

  /// All partitions, including ones from older versions.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition and every entry in it. Returns false if it did not exist.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Store a GET response, replacing any previous one for the same key.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Apply a batch atomically: either everything lands or nothing does.
  fn write_batch(&self, batch: &Batch) -> Result<()>;

  /// Most recently stored response for `key` across `partitions`.
  fn lookup(&self, partitions: &[String], key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Keys stored in a partition, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  fn get_state(&self, name: &str) -> Result<Option<String>>;

  fn set_state(&self, name: &str, value: &str) -> Result<()>;
}

/// Durable storage behind the offline mutation queue.
pub trait QueueStorage: Send + Sync {
  /// Store a new pending mutation and return its generated id.
  fn enqueue(&self, mutation: &NewMutation) -> Result<i64>;

  fn pending_count(&self) -> Result<usize>;

  /// Pending mutations in enumeration (insertion) order.
  fn pending(&self) -> Result<Vec<QueuedMutation>>;

  fn mutation(&self, id: i64) -> Result<Option<QueuedMutation>>;

  /// Returns false if no entry had that id.
  fn remove_mutation(&self, id: i64) -> Result<bool>;

  /// Count a failed replay. Once `dead_letter_after` attempts are reached the
  /// entry is moved out of the pending set.
  fn record_failure(
    &self,
    id: i64,
    error: &str,
    dead_letter_after: Option<u32>,
  ) -> Result<MutationStatus>;

  fn dead_letters(&self) -> Result<Vec<QueuedMutation>>;
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private database that disappears with the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One captured response per (partition, request key)
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);

CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    body TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status, id);

CREATE TABLE IF NOT EXISTS worker_state (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn now() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert_partition(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![name, now()],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  if !key.is_get() {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET responses are stored",
      key.method,
      key.url
    ));
  }

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  insert_partition(conn, partition)?;
  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, key_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.hash(),
        key.method,
        key.url,
        response.status,
        headers,
        response.body,
        now()
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url, partition, e))?;
  Ok(())
}

fn upsert_state(conn: &Connection, name: &str, value: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO worker_state (name, value) VALUES (?, ?)",
      params![name, value],
    )
    .map_err(|e| eyre!("Failed to record {}: {}", name, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_partition(&conn, name)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, partition, key, response)
  }

  fn write_batch(&self, batch: &Batch) -> Result<()> {
    let conn = self.lock()?;
    // Rolled back on drop if anything below fails.
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for name in &batch.partitions {
      insert_partition(&tx, name)?;
    }
    for (partition, key, response) in &batch.entries {
      insert_entry(&tx, partition, key, response)?;
    }
    for (name, value) in &batch.state {
      upsert_state(&tx, name, value)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn lookup(&self, partitions: &[String], key: &RequestKey) -> Result<Option<CachedResponse>> {
    if partitions.is_empty() {
      return Ok(None);
    }

    let conn = self.lock()?;
    let placeholders = vec!["?"; partitions.len()].join(", ");
    let sql = format!(
      "SELECT partition, status, headers, body, stored_at FROM cache_entries
       WHERE key_hash = ? AND partition IN ({})
       ORDER BY stored_at DESC, rowid DESC
       LIMIT 1",
      placeholders
    );

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

    let hash = key.hash();
    let args = std::iter::once(hash.as_str()).chain(partitions.iter().map(String::as_str));

    let row: Option<(String, u16, String, Vec<u8>, String)> = stmt
      .query_row(params_from_iter(args), |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    match row {
      Some((partition, status, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          partition,
          key: key.clone(),
          response: Response {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url FROM cache_entries
         WHERE partition = ?
         ORDER BY stored_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn get_state(&self, name: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM worker_state WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", name, e))
  }

  fn set_state(&self, name: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    upsert_state(&conn, name, value)
  }
}

const MUTATION_COLUMNS: &str =
  "id, method, path, body, enqueued_at, attempts, last_error, status";

/// Raw queue row; timestamp and status are parsed outside rusqlite so
/// failures carry our own error messages.
struct MutationRow {
  id: i64,
  method: String,
  path: String,
  body: String,
  enqueued_at: String,
  attempts: u32,
  last_error: Option<String>,
  status: String,
}

impl MutationRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      path: row.get(2)?,
      body: row.get(3)?,
      enqueued_at: row.get(4)?,
      attempts: row.get(5)?,
      last_error: row.get(6)?,
      status: row.get(7)?,
    })
  }

  fn into_mutation(self) -> Result<QueuedMutation> {
    Ok(QueuedMutation {
      id: self.id,
      method: self.method,
      path: self.path,
      body: self.body,
      enqueued_at: parse_datetime(&self.enqueued_at)?,
      attempts: self.attempts,
      last_error: self.last_error,
      status: MutationStatus::parse(&self.status)?,
    })
  }
}

impl SqliteStorage {
  fn query_mutations(&self, status: MutationStatus) -> Result<Vec<QueuedMutation>> {
    let conn = self.lock()?;
    let sql = format!(
      "SELECT {} FROM offline_queue WHERE status = ? ORDER BY id",
      MUTATION_COLUMNS
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map(params![status.as_str()], MutationRow::from_row)
      .map_err(|e| eyre!("Failed to read offline queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;

    rows.into_iter().map(MutationRow::into_mutation).collect()
  }
}

impl QueueStorage for SqliteStorage {
  fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO offline_queue (method, path, body, enqueued_at, status)
         VALUES (?, ?, ?, ?, ?)",
        params![
          mutation.method,
          mutation.path,
          mutation.body,
          now(),
          MutationStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to queue {} {}: {}", mutation.method, mutation.path, e))?;
    Ok(conn.last_insert_rowid())
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM offline_queue WHERE status = ?",
        params![MutationStatus::Pending.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count offline queue: {}", e))?;
    Ok(count as usize)
  }

  fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.query_mutations(MutationStatus::Pending)
  }

  fn mutation(&self, id: i64) -> Result<Option<QueuedMutation>> {
    let conn = self.lock()?;
    let sql = format!("SELECT {} FROM offline_queue WHERE id = ?", MUTATION_COLUMNS);
    let row = conn
      .query_row(&sql, params![id], MutationRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read queued mutation {}: {}", id, e))?;

    row.map(MutationRow::into_mutation).transpose()
  }

  fn remove_mutation(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn record_failure(
    &self,
    id: i64,
    error: &str,
    dead_letter_after: Option<u32>,
  ) -> Result<MutationStatus> {
    let conn = self.lock()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE offline_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )
    .map_err(|e| eyre!("Failed to record failure of {}: {}", id, e))?;

    let attempts: u32 = tx
      .query_row(
        "SELECT attempts FROM offline_queue WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read attempts of {}: {}", id, e))?
      .ok_or_else(|| eyre!("Queued mutation {} not found", id))?;

    let status = match dead_letter_after {
      Some(max) if attempts >= max => MutationStatus::DeadLettered,
      _ => MutationStatus::Pending,
    };

    tx.execute(
      "UPDATE offline_queue SET status = ? WHERE id = ?",
      params![status.as_str(), id],
    )
    .map_err(|e| eyre!("Failed to update status of {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(status)
  }

  fn dead_letters(&self) -> Result<Vec<QueuedMutation>> {
    self.query_mutations(MutationStatus::DeadLettered)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
