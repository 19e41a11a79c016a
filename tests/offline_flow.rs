use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use shelf_offline::cache::{CacheStorage, PartitionKind, ResponseSource, SqliteStorage};
use shelf_offline::config::{CacheConfig, Config};
use shelf_offline::controller::{LifecycleState, Registration};
use shelf_offline::http::{Destination, FetchError, Fetcher, Request, Response};

const UPSTREAM: &str = "http://127.0.0.1:8000/";

/// Backend double: serves a fixed set of pages and can be unplugged.
#[derive(Default)]
struct Backend {
  pages: Mutex<HashMap<String, Response>>,
  down: AtomicBool,
  requests: AtomicUsize,
}

impl Backend {
  fn with_pages(paths: &[&str]) -> Arc<Self> {
    let backend = Self::default();
    for path in paths {
      backend
        .pages
        .lock()
        .unwrap()
        .insert(url(path).to_string(), Response::html(200, format!("page {}", path)));
    }
    Arc::new(backend)
  }

  fn unplug(&self) {
    self.down.store(true, Ordering::SeqCst);
  }

  fn requests(&self) -> usize {
    self.requests.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetcher for Backend {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.requests.fetch_add(1, Ordering::SeqCst);
    if self.down.load(Ordering::SeqCst) {
      return Err(FetchError::Network("backend unreachable".into()));
    }
    Ok(
      self
        .pages
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| Response::new(404, "")),
    )
  }
}

fn url(path: &str) -> Url {
  Url::parse(UPSTREAM).unwrap().join(path).unwrap()
}

fn shell_paths() -> Vec<String> {
  CacheConfig::default().precache
}

fn backend_with_shell(extra: &[&str]) -> Arc<Backend> {
  let shell = shell_paths();
  let mut paths: Vec<&str> = shell.iter().map(String::as_str).collect();
  paths.extend_from_slice(extra);
  Backend::with_pages(&paths)
}

#[tokio::test]
async fn test_full_offline_cycle_with_sqlite() {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  let backend = backend_with_shell(&["/catalogue", "/media/1", "/static/img/cover.webp"]);
  let registration = Registration::new(Arc::clone(&storage), Arc::clone(&backend), url("/"));

  let controller = registration.register(&CacheConfig::default()).await.unwrap();
  assert_eq!(controller.state(), LifecycleState::Active);

  for path in ["/catalogue", "/media/1", "/static/img/cover.webp"] {
    let served = controller.handle(&Request::get(url(path))).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network, "{}", path);
  }

  backend.unplug();

  let page = controller
    .handle(&Request::get(url("/media/1")).with_destination(Destination::Document))
    .await
    .unwrap();
  assert_eq!(page.source, ResponseSource::Cache);
  assert_eq!(page.response.body, b"page /media/1");
  assert!(page.cached_at.is_some());

  let cover = controller
    .handle(&Request::get(url("/static/img/cover.webp")))
    .await
    .unwrap();
  assert_eq!(cover.source, ResponseSource::Cache);

  let unknown = controller
    .handle(&Request::get(url("/media/2")))
    .await
    .unwrap();
  assert_eq!(unknown.source, ResponseSource::OfflinePage);
  assert_eq!(unknown.response.body, b"page /offline");
}

#[tokio::test]
async fn test_api_is_always_live() {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  let backend = backend_with_shell(&["/api/stats"]);
  let registration = Registration::new(Arc::clone(&storage), Arc::clone(&backend), url("/"));
  let controller = registration.register(&CacheConfig::default()).await.unwrap();

  let before = backend.requests();
  for _ in 0..3 {
    let served = controller.handle(&Request::get(url("/api/stats"))).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
  }
  assert_eq!(backend.requests(), before + 3);

  for name in storage.partitions().unwrap() {
    let keys = storage.keys(&name).unwrap();
    assert!(keys.iter().all(|k| !k.url.contains("/api/")), "{}", name);
  }
}

#[tokio::test]
async fn test_dynamic_partition_stays_bounded() {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  let pages: Vec<String> = (0..6).map(|i| format!("/media/{}", i)).collect();
  let page_refs: Vec<&str> = pages.iter().map(String::as_str).collect();
  let backend = backend_with_shell(&page_refs);
  let registration = Registration::new(Arc::clone(&storage), Arc::clone(&backend), url("/"));

  let config = CacheConfig {
    dynamic_limit: 5,
    ..CacheConfig::default()
  };
  let controller = registration.register(&config).await.unwrap();

  for path in &pages {
    controller.handle(&Request::get(url(path))).await.unwrap();
  }
  tokio::time::sleep(Duration::from_millis(50)).await;
  controller.trim(PartitionKind::Dynamic).unwrap();

  let keys = storage.keys("shelf-dynamic-v1").unwrap();
  assert_eq!(keys.len(), 5);
  assert_eq!(keys[0].url, url("/media/1").to_string());
  assert_eq!(keys[4].url, url("/media/5").to_string());
}

#[tokio::test]
async fn test_deploy_new_version() {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  let backend = backend_with_shell(&["/catalogue"]);
  let registration = Registration::new(Arc::clone(&storage), Arc::clone(&backend), url("/"));

  let v1 = registration.register(&CacheConfig::default()).await.unwrap();
  v1.handle(&Request::get(url("/catalogue"))).await.unwrap();

  let v2_config = CacheConfig {
    version: "v2".to_string(),
    ..CacheConfig::default()
  };
  let v2 = registration.register(&v2_config).await.unwrap();

  assert_eq!(v1.state(), LifecycleState::Superseded);
  assert_eq!(v2.version(), "v2");
  // Only the precache has been written under v2 so far
  assert_eq!(storage.partitions().unwrap(), vec!["shelf-static-v2"]);
  assert!(storage
    .match_entry("shelf-dynamic-v1", &Request::get(url("/catalogue")).key())
    .unwrap()
    .is_none());
  assert_eq!(storage.active_version().unwrap(), Some("v2".to_string()));
}

#[test]
fn test_config_drives_partition_names() {
  let config = Config::parse(
    r#"
cache:
  version: "2024.10"
  prefix: media
"#,
  )
  .unwrap();
  let set = config.cache.partition_set();
  assert!(set.is_current("media-static-2024.10"));
  assert!(set.is_current("media-images-2024.10"));
  assert!(!set.is_current("shelf-static-2024.10"));
}
