//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};
use crate::http::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named partitions. Each partition maps request
/// keys to response snapshots and remembers the order entries were inserted in.
pub trait CacheStorage: Send + Sync {
  /// Names of every existing partition.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Create the partition if it does not exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Remove a partition and all its entries. Returns false if it did not exist.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Exact match on method and URL.
  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Insert or replace an entry. Replaced entries move to the back of the insertion order.
  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Remove a single entry. Returns false if it was not cached.
  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool>;

  /// Keys in insertion order, oldest first.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// Version tag of the deploy currently serving requests.
  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Throwaway storage that lives as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shelf-offline").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named partition (a partition may be empty)
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses; seq preserves insertion order within a partition
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    seq INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(partition, seq);

-- Small key/value table for bookkeeping (active version)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const INSERT_ENTRY: &str = "INSERT INTO entries (partition, key_hash, method, url, status, headers, body, seq, cached_at)
   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
           (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE partition = ?1),
           datetime('now'))";

/// Replace one entry on an open connection or transaction.
fn write_entry(
  conn: &Connection,
  partition: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let hash = key.cache_hash();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

  conn
    .execute(
      "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
      params![partition, hash],
    )
    .map_err(|e| eyre!("Failed to replace entry {}: {}", key, e))?;

  conn
    .execute(
      INSERT_ENTRY,
      params![
        partition,
        hash,
        key.method,
        key.url,
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn open(&self, partition: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    Ok(())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    write_entry(&tx, partition, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    for (key, response) in entries {
      write_entry(&tx, partition, key, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM meta WHERE key = 'active_version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('active_version', ?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;

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

#[cfg(test)]
mod tests {
  use super::*;

  fn key(path: &str) -> RequestKey {
    RequestKey::new("GET", format!("http://shelf.local{}", path))
  }

  #[test]
  fn test_put_and_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::html(200, "<h1>Catalogue</h1>").with_header("x-test", "1");

    storage.put("p", &key("/catalogue"), &response).unwrap();

    let cached = storage.match_entry("p", &key("/catalogue")).unwrap().unwrap();
    assert_eq!(cached.response, response);
    assert!(storage.match_entry("p", &key("/other")).unwrap().is_none());
    assert!(storage.match_entry("q", &key("/catalogue")).unwrap().is_none());
  }

  #[test]
  fn test_keys_in_insertion_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    for path in ["/a", "/b", "/c"] {
      storage.put("p", &key(path), &Response::new(200, path)).unwrap();
    }
    // Replacing /a moves it to the back
    storage.put("p", &key("/a"), &Response::new(200, "again")).unwrap();

    let keys = storage.keys("p").unwrap();
    assert_eq!(keys, vec![key("/b"), key("/c"), key("/a")]);
  }

  #[test]
  fn test_partitions_and_delete_partition() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("empty").unwrap();
    storage.put("full", &key("/"), &Response::new(200, "x")).unwrap();

    assert_eq!(storage.partitions().unwrap(), vec!["empty", "full"]);

    assert!(storage.delete_partition("full").unwrap());
    assert!(!storage.delete_partition("full").unwrap());
    assert_eq!(storage.partitions().unwrap(), vec!["empty"]);
    assert!(storage.match_entry("full", &key("/")).unwrap().is_none());
    assert!(storage.keys("full").unwrap().is_empty());
  }

  #[test]
  fn test_put_all_and_delete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let entries = vec![
      (key("/"), Response::new(200, "home")),
      (key("/offline"), Response::new(200, "offline")),
    ];
    storage.put_all("static", &entries).unwrap();
    assert_eq!(storage.keys("static").unwrap().len(), 2);

    assert!(storage.delete("static", &key("/")).unwrap());
    assert!(!storage.delete("static", &key("/")).unwrap());
    assert_eq!(storage.keys("static").unwrap(), vec![key("/offline")]);
  }

  #[test]
  fn test_active_version() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.active_version().unwrap(), None);
    storage.set_active_version("v1").unwrap();
    storage.set_active_version("v2").unwrap();
    assert_eq!(storage.active_version().unwrap(), Some("v2".to_string()));
  }
}
