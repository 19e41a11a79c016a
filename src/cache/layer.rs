//! Cache layer that executes caching strategies around a network fetch.

use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::partition::{PartitionKind, PartitionSet};
use super::queue::EvictionQueue;
use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey, Served};
use crate::http::{FetchError, Response};

/// Cache layer that manages partition reads/writes and network fallbacks.
///
/// Each strategy takes the network fetch as a closure so the layer never needs
/// to know how requests reach the network.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  partitions: PartitionSet,
  /// Key of the precached offline page in the static partition
  offline_key: RequestKey,
  /// Cleared once a newer version takes over, so late responses are not written back
  writable: Arc<AtomicBool>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, partitions: PartitionSet, offline_key: RequestKey) -> Self {
    Self {
      storage,
      partitions,
      offline_key,
      writable: Arc::new(AtomicBool::new(true)),
    }
  }

  /// Allow or refuse writes. Reads and network fetches are unaffected.
  pub fn set_writable(&self, writable: bool) {
    self.writable.store(writable, Ordering::SeqCst);
  }

  pub fn partitions(&self) -> &PartitionSet {
    &self.partitions
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Look up an entry, treating storage errors as a miss.
  fn lookup(&self, kind: PartitionKind, key: &RequestKey) -> Option<CachedResponse> {
    let partition = self.partitions.name(kind).to_string();
    match self.storage.match_entry(&partition, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(%partition, %key, "Cache read failed: {}", e);
        None
      }
    }
  }

  /// Store a copy of a response. Storage errors are logged, never surfaced.
  fn store(&self, kind: PartitionKind, key: &RequestKey, response: &Response) {
    let partition = self.partitions.name(kind).to_string();
    if !self.writable.load(Ordering::SeqCst) {
      debug!(%partition, %key, "Partition is read-only, not caching");
      return;
    }
    if let Err(e) = self.storage.put(&partition, key, response) {
      warn!(%partition, %key, "Cache write failed: {}", e);
      return;
    }
    debug!(%partition, %key, "Cached response");

    if self.partitions.limit(kind).is_some() {
      self.schedule_trim(kind);
    }
  }

  /// Run a trim pass without blocking the caller.
  fn schedule_trim(&self, kind: PartitionKind) {
    let Some(limit) = self.partitions.limit(kind) else {
      return;
    };
    let storage = Arc::clone(&self.storage);
    let partition = self.partitions.name(kind).to_string();

    tokio::task::spawn_blocking(move || {
      if let Err(e) = trim_partition(storage.as_ref(), &partition, limit) {
        warn!(%partition, "Trim failed: {}", e);
      }
    });
  }

  /// Trim a partition to its limit right away. Unbounded partitions are left alone.
  pub fn trim(&self, kind: PartitionKind) -> Result<Vec<RequestKey>> {
    match self.partitions.limit(kind) {
      Some(limit) => {
        trim_partition(self.storage.as_ref(), &self.partitions.name(kind).to_string(), limit)
      }
      None => Ok(Vec::new()),
    }
  }

  /// The offline page, or a synthesized placeholder if it was never precached.
  fn offline_fallback(&self) -> Served {
    match self.lookup(PartitionKind::Static, &self.offline_key) {
      Some(cached) => Served::offline(cached.response, Some(cached.cached_at)),
      None => {
        warn!("Offline page missing from the static partition");
        Served::offline(Response::offline_placeholder(), None)
      }
    }
  }

  /// Always go to the network; no partition is read or written.
  pub async fn network_only<F, Fut>(&self, fetcher: F) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    fetcher().await.map(Served::from_network)
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Serve from the static partition if present
  /// 2. On a miss, fetch and store a copy of any ok response
  /// 3. If the network fails too, serve the offline page
  pub async fn cache_first<F, Fut>(&self, key: &RequestKey, fetcher: F) -> Served
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    if let Some(cached) = self.lookup(PartitionKind::Static, key) {
      return Served::from_cache(cached);
    }

    match fetcher().await {
      Ok(response) => {
        if response.is_ok() {
          self.store(PartitionKind::Static, key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(%key, "Static asset unavailable: {}", e);
        self.offline_fallback()
      }
    }
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Try the network; cache ok responses in the dynamic partition
  /// 2. On network failure, serve the cached copy of this exact request
  /// 3. Otherwise serve the offline page
  pub async fn network_first<F, Fut>(&self, key: &RequestKey, fetcher: F) -> Served
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_ok() {
          self.store(PartitionKind::Dynamic, key, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(%key, "Network failed, falling back to cache: {}", e);
        match self.lookup(PartitionKind::Dynamic, key) {
          Some(cached) => Served::from_cache(cached),
          None => self.offline_fallback(),
        }
      }
    }
  }

  /// Network-first for images: fall back to the last cached copy, else fail.
  pub async fn network_first_image<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_ok() {
          self.store(PartitionKind::Images, key, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(e) => match self.lookup(PartitionKind::Images, key) {
        Some(cached) => Ok(Served::from_cache(cached)),
        None => Err(e),
      },
    }
  }

  /// Store a batch of precached responses into the static partition, all or nothing.
  pub fn precache(&self, entries: &[(RequestKey, Response)]) -> Result<()> {
    let partition = self.partitions.name(PartitionKind::Static).to_string();
    self.storage.put_all(&partition, entries)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      partitions: self.partitions.clone(),
      offline_key: self.offline_key.clone(),
      writable: Arc::clone(&self.writable),
    }
  }
}

/// Evict the oldest entries of `partition` until at most `limit` remain.
///
/// Not transactional: an insert racing with the trim may leave the partition
/// briefly above its limit until the next trim.
pub fn trim_partition<S: CacheStorage + ?Sized>(
  storage: &S,
  partition: &str,
  limit: usize,
) -> Result<Vec<RequestKey>> {
  let mut queue: EvictionQueue<RequestKey> = storage.keys(partition)?.into_iter().collect();
  let evicted = queue.trim(limit);

  for key in &evicted {
    storage.delete(partition, key)?;
  }
  if !evicted.is_empty() {
    debug!(%partition, evicted = evicted.len(), "Trimmed partition");
  }

  Ok(evicted)
}

/// Delete every partition that is not one of the current version's.
pub fn prune_stale<S: CacheStorage + ?Sized>(
  storage: &S,
  partitions: &PartitionSet,
) -> Result<Vec<String>> {
  let mut deleted = Vec::new();
  for name in storage.partitions()? {
    if !partitions.is_current(&name) {
      storage.delete_partition(&name)?;
      deleted.push(name);
    }
  }
  Ok(deleted)
}
