//! SQLite cache storage implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedEntry, RegistrationStore};
use crate::http::{Headers, RequestIdentity, Response};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private database that disappears with the process.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache partitions, rowid gives creation order
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One response per (partition, request identity)
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_hash ON cache_entries(request_hash);

-- Deferred tasks waiting for connectivity
CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS worker_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "e.method, e.url, e.status, e.headers, e.body, e.cached_at";

/// Row as read from `cache_entries`, before decoding.
struct EntryRow {
  method: String,
  url: String,
  status: u16,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl EntryRow {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      method: row.get(0)?,
      url: row.get(1)?,
      status: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      cached_at: row.get(5)?,
    })
  }

  fn into_entry(self) -> Result<CachedEntry> {
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(CachedEntry {
      identity: RequestIdentity {
        method: self.method.parse()?,
        url: self.url,
      },
      response: Response {
        status: self.status,
        headers,
        body: self.body,
      },
      cached_at: parse_datetime(&self.cached_at)?,
    })
  }
}

fn insert_entry(
  conn: &Connection,
  partition: &str,
  identity: &RequestIdentity,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (partition, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        identity.cache_hash(),
        identity.method.as_str(),
        identity.url,
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", identity, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    Ok(())
  }

  fn match_request(
    &self,
    partition: &str,
    identity: &RequestIdentity,
  ) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e WHERE e.partition = ? AND e.request_hash = ?",
          ENTRY_COLUMNS
        ),
        params![partition, identity.cache_hash()],
        EntryRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity, e))?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn match_any(&self, identity: &RequestIdentity) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row = conn
      .query_row(
        &format!(
          "SELECT {} FROM cache_entries e
           INNER JOIN cache_partitions p ON p.name = e.partition
           WHERE e.request_hash = ?
           ORDER BY p.rowid
           LIMIT 1",
          ENTRY_COLUMNS
        ),
        params![identity.cache_hash()],
        EntryRow::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity, e))?;

    row.map(EntryRow::into_entry).transpose()
  }

  fn put(&self, partition: &str, identity: &RequestIdentity, response: Response) -> Result<()> {
    let conn = self.conn()?;
    insert_entry(&conn, partition, identity, &response)
  }

  fn put_all(&self, partition: &str, entries: Vec<(RequestIdentity, Response)>) -> Result<()> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (identity, response) in &entries {
      // Dropping the transaction on error rolls back everything written so far
      insert_entry(&tx, partition, identity, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, partition: &str, identity: &RequestIdentity) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND request_hash = ?",
        params![partition, identity.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", identity, e))?;

    Ok(removed > 0)
  }

  fn entries(&self, partition: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM cache_entries e WHERE e.partition = ? ORDER BY e.url, e.method",
        ENTRY_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<EntryRow> = stmt
      .query_map(params![partition], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entries: {}", e))?;

    rows.into_iter().map(EntryRow::into_entry).collect()
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partitions: {}", e))?;

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

impl RegistrationStore for SqliteStorage {
  fn register_sync_tag(&self, tag: &str) -> Result<bool> {
    let inserted = self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO sync_registrations (tag) VALUES (?)",
        params![tag],
      )
      .map_err(|e| eyre!("Failed to register sync tag {}: {}", tag, e))?;

    Ok(inserted > 0)
  }

  fn sync_tags(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT tag FROM sync_registrations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare sync query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query sync tags: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read sync tags: {}", e))?;

    Ok(tags)
  }

  fn remove_sync_tag(&self, tag: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM sync_registrations WHERE tag = ?",
        params![tag],
      )
      .map_err(|e| eyre!("Failed to remove sync tag {}: {}", tag, e))?;

    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM worker_meta WHERE key = 'active_version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active worker version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO worker_meta (key, value) VALUES ('active_version', ?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record active worker version: {}", e))?;

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
