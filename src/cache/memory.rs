//! In-memory storage with the same semantics as the SQLite backend.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey};
use crate::http::Response;

#[derive(Default)]
struct Inner {
  /// Entries per partition, oldest first
  partitions: BTreeMap<String, Vec<(RequestKey, CachedResponse)>>,
  active_version: Option<String>,
}

/// Storage that forgets everything when dropped.
#[derive(Default)]
pub struct MemoryStorage {
  inner: Mutex<Inner>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn insert(entries: &mut Vec<(RequestKey, CachedResponse)>, key: &RequestKey, response: &Response) {
  entries.retain(|(k, _)| k != key);
  entries.push((
    key.clone(),
    CachedResponse {
      response: response.clone(),
      cached_at: Utc::now(),
    },
  ));
}

impl CacheStorage for MemoryStorage {
  fn partitions(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.partitions.keys().cloned().collect())
  }

  fn open(&self, partition: &str) -> Result<()> {
    self
      .lock()?
      .partitions
      .entry(partition.to_string())
      .or_default();
    Ok(())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    Ok(self.lock()?.partitions.remove(partition).is_some())
  }

  fn match_entry(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let inner = self.lock()?;
    Ok(
      inner
        .partitions
        .get(partition)
        .and_then(|entries| entries.iter().find(|(k, _)| k == key))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut inner = self.lock()?;
    let entries = inner.partitions.entry(partition.to_string()).or_default();
    insert(entries, key, response);
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    // A single lock makes the batch atomic for other callers
    let mut inner = self.lock()?;
    let stored = inner.partitions.entry(partition.to_string()).or_default();
    for (key, response) in entries {
      insert(stored, key, response);
    }
    Ok(())
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let mut inner = self.lock()?;
    let Some(entries) = inner.partitions.get_mut(partition) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|(k, _)| k != key);
    Ok(entries.len() != before)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let inner = self.lock()?;
    Ok(
      inner
        .partitions
        .get(partition)
        .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }

  fn active_version(&self) -> Result<Option<String>> {
    Ok(self.lock()?.active_version.clone())
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    self.lock()?.active_version = Some(version.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(path: &str) -> RequestKey {
    RequestKey::new("GET", format!("http://shelf.local{}", path))
  }

  #[test]
  fn test_replace_moves_to_back() {
    let storage = MemoryStorage::new();
    storage.put("p", &key("/a"), &Response::new(200, "1")).unwrap();
    storage.put("p", &key("/b"), &Response::new(200, "2")).unwrap();
    storage.put("p", &key("/a"), &Response::new(200, "3")).unwrap();

    assert_eq!(storage.keys("p").unwrap(), vec![key("/b"), key("/a")]);
    let cached = storage.match_entry("p", &key("/a")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"3");
  }

  #[test]
  fn test_delete_partition() {
    let storage = MemoryStorage::new();
    storage.open("a").unwrap();
    storage.put("b", &key("/"), &Response::new(200, "")).unwrap();
    assert_eq!(storage.partitions().unwrap(), vec!["a", "b"]);
    assert!(storage.delete_partition("b").unwrap());
    assert!(storage.match_entry("b", &key("/")).unwrap().is_none());
  }

  #[test]
  fn test_delete_missing() {
    let storage = MemoryStorage::new();
    assert!(!storage.delete("nope", &key("/")).unwrap());
  }
}
