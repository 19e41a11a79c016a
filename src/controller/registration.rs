//! Version handover between controllers.

use color_eyre::Result;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use url::Url;

use super::{InstallError, OfflineController};
use crate::cache::CacheStorage;
use crate::config::CacheConfig;
use crate::http::Fetcher;

/// Tracks which controller currently handles requests for a scope.
///
/// A new version only takes over once its install succeeded; until then the
/// previous version keeps serving.
pub struct Registration<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  scope: Url,
  active: RwLock<Option<Arc<OfflineController<S, F>>>>,
}

impl<S: CacheStorage + 'static, F: Fetcher> Registration<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, scope: Url) -> Self {
    Self {
      storage,
      fetcher,
      scope,
      active: RwLock::new(None),
    }
  }

  pub fn scope(&self) -> &Url {
    &self.scope
  }

  /// The controller currently handling requests, if any.
  pub fn active(&self) -> Option<Arc<OfflineController<S, F>>> {
    self
      .active
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  /// Install (if needed) and activate `config.version`.
  ///
  /// On install failure the previously active version is kept, or restored from
  /// storage when this process has not activated anything yet.
  pub async fn register(&self, config: &CacheConfig) -> Result<Arc<OfflineController<S, F>>> {
    if let Some(current) = self.active() {
      if current.version() == config.version {
        return Ok(current);
      }
    }

    let candidate = Arc::new(self.controller_for(config)?);
    let recorded = self.storage.active_version()?;

    let already_installed =
      recorded.as_deref() == Some(config.version.as_str()) && candidate.resume().is_ok();

    if !already_installed {
      if let Err(e) = candidate.install().await {
        return self.keep_previous(config, recorded, e);
      }
    }

    // Requests still in flight on the old version must not recreate its partitions
    let previous = self.active();
    if let Some(previous) = &previous {
      previous.set_writable(false);
    }
    if let Err(e) = candidate.activate() {
      if let Some(previous) = &previous {
        previous.set_writable(true);
      }
      return Err(e);
    }

    Ok(self.promote(candidate))
  }

  fn controller_for(&self, config: &CacheConfig) -> Result<OfflineController<S, F>> {
    OfflineController::new(
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
      &self.scope,
      config,
    )
  }

  fn keep_previous(
    &self,
    config: &CacheConfig,
    recorded: Option<String>,
    error: InstallError,
  ) -> Result<Arc<OfflineController<S, F>>> {
    if let Some(current) = self.active() {
      warn!(
        failed = %config.version,
        active = current.version(),
        "Install failed, keeping active version: {}",
        error
      );
      return Ok(current);
    }

    let Some(previous) = recorded.filter(|v| *v != config.version) else {
      return Err(error.into());
    };

    warn!(
      failed = %config.version,
      active = %previous,
      "Install failed, restoring previous version: {}",
      error
    );
    let fallback = self.controller_for(&CacheConfig {
      version: previous,
      ..config.clone()
    })?;
    fallback.resume()?;
    fallback.activate()?;

    Ok(self.promote(Arc::new(fallback)))
  }

  /// Make `controller` the active one and supersede the one it replaces.
  fn promote(&self, controller: Arc<OfflineController<S, F>>) -> Arc<OfflineController<S, F>> {
    let replaced = self
      .active
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .replace(Arc::clone(&controller));

    if let Some(old) = replaced {
      if let Err(e) = old.supersede() {
        warn!(version = old.version(), "Failed to supersede: {}", e);
      }
    }
    info!(version = controller.version(), "Controller registered");

    controller
  }
}
