//! Remembers the last catalogue view so returning users land back on their filters.
//!
//! The value lives in a session-scoped slot. The partial-update transport adds
//! its own query parameters (`partial`, `grid_only`) to catalogue URLs; those
//! are stripped both when saving and when reading back, so they never leak
//! into a restored view no matter how an old value was written.

use std::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::config::FilterConfig;

/// Transport parameter carrying pagination; values saved with it are discarded on load.
const PAGINATION_PARAM: &str = "partial";

/// Base used to resolve the relative URLs kept in the slot.
const PARSE_BASE: &str = "http://localhost/";

/// A single string slot scoped to one browsing session.
pub trait SessionStore: Send + Sync {
  fn get(&self) -> Option<String>;
  fn set(&self, value: String);
  fn clear(&self);
}

/// Session slot held in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
  slot: Mutex<Option<String>>,
}

impl MemorySessionStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
    self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl SessionStore for MemorySessionStore {
  fn get(&self) -> Option<String> {
    self.slot().clone()
  }

  fn set(&self, value: String) {
    *self.slot() = Some(value);
  }

  fn clear(&self) {
    *self.slot() = None;
  }
}

/// UI lifecycle signals that trigger a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
  /// Full page load
  PageLoad,
  /// Client-side URL change
  HistoryPushed,
  /// Partial page update finished
  ContentSwapped,
}

/// Persisted catalogue filter state.
pub struct FilterState<S: SessionStore> {
  store: S,
  catalogue_path: String,
  default_route: String,
  internal_params: Vec<String>,
}

impl<S: SessionStore> FilterState<S> {
  pub fn new(store: S, config: &FilterConfig) -> Self {
    Self {
      store,
      catalogue_path: config.catalogue_path.clone(),
      default_route: config.default_route.clone(),
      internal_params: config.internal_params.clone(),
    }
  }

  fn is_catalogue(&self, location: &Url) -> bool {
    let path = location.path();
    path == self.catalogue_path || path.trim_end_matches('/') == self.catalogue_path
  }

  /// Remove the transport parameters, dropping the `?` if nothing is left.
  fn strip(&self, url: &mut Url) {
    let kept: Vec<(String, String)> = url
      .query_pairs()
      .filter(|(name, _)| !self.internal_params.iter().any(|p| p == name))
      .map(|(name, value)| (name.into_owned(), value.into_owned()))
      .collect();

    if kept.is_empty() {
      url.set_query(None);
    } else {
      url.query_pairs_mut().clear().extend_pairs(kept);
    }
  }

  /// Persist `location` if it is the catalogue view. Returns whether it was saved.
  pub fn save(&self, location: &Url) -> bool {
    if !self.is_catalogue(location) {
      return false;
    }

    let mut cleaned = location.clone();
    self.strip(&mut cleaned);
    let value = relative(&cleaned);
    debug!(%value, "Saved catalogue filters");
    self.store.set(value);
    true
  }

  /// The last catalogue URL, or the default route if none is usable.
  pub fn get(&self) -> String {
    let Some(value) = self.store.get() else {
      return self.default_route.clone();
    };

    let parsed =
      Url::parse(PARSE_BASE).and_then(|base| Url::options().base_url(Some(&base)).parse(&value));
    match parsed {
      Ok(mut url) => {
        self.strip(&mut url);
        relative(&url)
      }
      Err(e) => {
        debug!(%value, "Ignoring unparsable filter state: {}", e);
        self.default_route.clone()
      }
    }
  }

  /// Forget the saved filters.
  pub fn clear(&self) {
    self.store.clear();
  }

  /// Discard values written with pagination state, then save the current location.
  pub fn init(&self, location: &Url) {
    let stale = self
      .store
      .get()
      .is_some_and(|value| value.contains(&format!("{}=", PAGINATION_PARAM)));
    if stale {
      debug!("Discarding filter state saved with pagination state");
      self.store.clear();
    }

    self.save(location);
  }

  pub fn on_event(&self, event: UiEvent, location: &Url) {
    match event {
      UiEvent::PageLoad => self.init(location),
      UiEvent::HistoryPushed | UiEvent::ContentSwapped => {
        self.save(location);
      }
    }
  }
}

/// Path plus query, without scheme and host.
fn relative(url: &Url) -> String {
  match url.query() {
    Some(query) => format!("{}?{}", url.path(), query),
    None => url.path().to_string(),
  }
}
