//! Offline cache controller.
//!
//! Sits in front of every request: classifies it, serves it under the matching
//! strategy, and owns the lifecycle of the current version's partitions.

mod policy;
mod registration;

pub use policy::{classify, Policy, Rules};
pub use registration::Registration;

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  prune_stale, CacheLayer, CacheStorage, PartitionKind, PartitionSet, RequestKey, Served,
};
use crate::config::CacheConfig;
use crate::http::{FetchError, Fetcher, Request};

/// Where a controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Precache manifest not stored yet
  Installing,
  /// Installed, waiting to take over
  Waiting,
  /// Handling requests
  Active,
  /// Replaced by a newer version
  Superseded,
  /// Install failed; this controller will never activate
  Redundant,
}

/// Why an install attempt failed. The previous version stays authoritative.
#[derive(thiserror::Error, Debug)]
pub enum InstallError {
  #[error("Failed to precache {url}: {source}")]
  Fetch {
    url: String,
    #[source]
    source: FetchError,
  },

  #[error("Precache of {url} returned status {status}")]
  BadStatus { url: String, status: u16 },

  #[error("Failed to store precache entries: {0}")]
  Storage(String),

  #[error("Cannot install from state {0:?}")]
  InvalidState(LifecycleState),
}

/// Snapshot of a controller for display.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
  pub version: String,
  pub state: LifecycleState,
  /// Every partition in storage with its entry count
  pub partitions: Vec<(String, usize)>,
}

impl fmt::Display for ControllerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "version {} ({:?})", self.version, self.state)?;
    for (name, count) in &self.partitions {
      writeln!(f, "  {:<28} {:>6} entries", name, count)?;
    }
    Ok(())
  }
}

/// Delete every partition except those of the version recorded as active.
///
/// Falls back to `config.version` when no version was ever activated, so a
/// configured version whose install failed never evicts the one still serving.
pub fn prune_inactive<S: CacheStorage + ?Sized>(
  storage: &S,
  config: &CacheConfig,
) -> Result<Vec<String>> {
  let keep = match storage.active_version()? {
    Some(version) => CacheConfig {
      version,
      ..config.clone()
    },
    None => config.clone(),
  };
  prune_stale(storage, &keep.partition_set())
}

/// Intercepts requests for one deploy version.
pub struct OfflineController<S: CacheStorage, F: Fetcher> {
  layer: CacheLayer<S>,
  fetcher: Arc<F>,
  rules: Rules,
  /// Absolute URLs fetched at install time
  manifest: Vec<Url>,
  state: Mutex<LifecycleState>,
}

impl<S: CacheStorage + 'static, F: Fetcher> OfflineController<S, F> {
  /// Create a controller for `config.version`. `scope` is the origin being served.
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, scope: &Url, config: &CacheConfig) -> Result<Self> {
    let resolve = |path: &str| {
      scope
        .join(path)
        .map_err(|e| eyre!("Invalid path {} for scope {}: {}", path, scope, e))
    };

    let offline_url = resolve(config.offline_path.as_str())?;
    let manifest = config
      .precache
      .iter()
      .map(|path| resolve(path.as_str()))
      .collect::<Result<Vec<_>>>()?;

    let layer = CacheLayer::new(
      storage,
      config.partition_set(),
      Request::get(offline_url).key(),
    );

    Ok(Self {
      layer,
      fetcher,
      rules: Rules::new(scope, config),
      manifest,
      state: Mutex::new(LifecycleState::Installing),
    })
  }

  fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
    // The state is a plain Copy value, so a poisoned lock still holds a valid one
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Move to `to` if currently in `from`, returning the state found otherwise.
  fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
    let mut state = self.lock_state();
    if *state != from {
      return Err(*state);
    }
    *state = to;
    Ok(())
  }

  pub fn state(&self) -> LifecycleState {
    *self.lock_state()
  }

  pub fn version(&self) -> &str {
    self.layer.partitions().version()
  }

  pub fn partitions(&self) -> &PartitionSet {
    self.layer.partitions()
  }

  /// Fetch the whole precache manifest and store it atomically.
  ///
  /// Any failed fetch or non-ok response fails the install and nothing is stored.
  pub async fn install(&self) -> Result<(), InstallError> {
    let state = self.state();
    if state != LifecycleState::Installing {
      return Err(InstallError::InvalidState(state));
    }
    info!(version = self.version(), paths = self.manifest.len(), "Installing");

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|source| InstallError::Fetch {
          url: url.to_string(),
          source,
        })?;

      if !response.is_ok() {
        return Err(InstallError::BadStatus {
          url: url.to_string(),
          status: response.status,
        });
      }
      Ok((request.key(), response))
    });

    let stored = match futures::future::try_join_all(fetches).await {
      Ok(entries) => self
        .layer
        .precache(&entries)
        .map_err(|e| InstallError::Storage(e.to_string())),
      Err(e) => Err(e),
    };

    if let Err(e) = stored {
      *self.lock_state() = LifecycleState::Redundant;
      warn!(version = self.version(), "Install failed: {}", e);
      return Err(e);
    }

    *self.lock_state() = LifecycleState::Waiting;
    info!(version = self.version(), "Installed");
    Ok(())
  }

  /// Skip the install for a version whose precache is already stored.
  pub fn resume(&self) -> Result<()> {
    let partition = self.layer.partitions().name(PartitionKind::Static).to_string();
    if !self.layer.storage().partitions()?.contains(&partition) {
      return Err(eyre!("Version {} was never installed", self.version()));
    }

    self
      .transition(LifecycleState::Installing, LifecycleState::Waiting)
      .map_err(|state| eyre!("Cannot resume from state {:?}", state))?;
    debug!(version = self.version(), "Resumed installed version");
    Ok(())
  }

  /// Delete every partition not belonging to this version and start handling requests.
  ///
  /// Returns the names of the deleted partitions.
  pub fn activate(&self) -> Result<Vec<String>> {
    let state = self.state();
    if state != LifecycleState::Waiting {
      return Err(eyre!("Cannot activate from state {:?}", state));
    }

    let storage = self.layer.storage();
    let deleted = prune_stale(storage.as_ref(), self.layer.partitions())?;
    for name in &deleted {
      info!(partition = %name, "Deleted stale partition");
    }
    storage.set_active_version(self.version())?;

    self
      .transition(LifecycleState::Waiting, LifecycleState::Active)
      .map_err(|state| eyre!("Cannot activate from state {:?}", state))?;
    info!(version = self.version(), "Activated and claimed clients");

    Ok(deleted)
  }

  /// Stop or resume writing responses into this version's partitions.
  pub(crate) fn set_writable(&self, writable: bool) {
    self.layer.set_writable(writable);
  }

  /// Mark this controller as replaced by a newer version.
  pub fn supersede(&self) -> Result<()> {
    self
      .transition(LifecycleState::Active, LifecycleState::Superseded)
      .map_err(|state| eyre!("Cannot supersede from state {:?}", state))?;
    info!(version = self.version(), "Superseded");
    Ok(())
  }

  /// Fulfil a request.
  ///
  /// Only `Passthrough`, `NetworkOnly` and uncached image requests can fail;
  /// every other policy resolves to a cached copy or the offline page.
  pub async fn handle(&self, request: &Request) -> Result<Served, FetchError> {
    let fetch = || self.fetcher.fetch(request);

    // Controllers that are not active do not intercept
    if self.state() != LifecycleState::Active {
      return self.layer.network_only(fetch).await;
    }

    let policy = classify(request, &self.rules);
    let key = request.key();
    debug!(%key, ?policy, "Intercepted request");

    match policy {
      Policy::Passthrough | Policy::NetworkOnly => self.layer.network_only(fetch).await,
      Policy::CacheFirst => Ok(self.layer.cache_first(&key, fetch).await),
      Policy::NetworkFirst => Ok(self.layer.network_first(&key, fetch).await),
      Policy::ImageNetworkFirst => self.layer.network_first_image(&key, fetch).await,
    }
  }

  /// Trim one partition to its limit immediately.
  pub fn trim(&self, kind: PartitionKind) -> Result<Vec<RequestKey>> {
    self.layer.trim(kind)
  }

  pub fn status(&self) -> Result<ControllerStatus> {
    let storage = self.layer.storage();
    let partitions = storage
      .partitions()?
      .into_iter()
      .map(|name| {
        let count = storage.keys(&name)?.len();
        Ok((name, count))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(ControllerStatus {
      version: self.version().to_string(),
      state: self.state(),
      partitions,
    })
  }
}
