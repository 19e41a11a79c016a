//! Versioned partition names.
//!
//! A partition name embeds the deploy version, so bumping the version is the
//! only thing needed to invalidate everything cached by a previous deploy.

use std::fmt;

/// The three kinds of partition the controller writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// Precache manifest plus static assets; never trimmed
  Static,
  /// HTML navigations
  Dynamic,
  /// Cross-origin images
  Images,
}

impl PartitionKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Images => "images",
    }
  }
}

/// Fully qualified name of one partition, e.g. `shelf-dynamic-v3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionName {
  prefix: String,
  kind: PartitionKind,
  version: String,
}

impl PartitionName {
  pub fn new(prefix: &str, kind: PartitionKind, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      kind,
      version: version.to_string(),
    }
  }

  pub fn kind(&self) -> PartitionKind {
    self.kind
  }

  pub fn version(&self) -> &str {
    &self.version
  }
}

impl fmt::Display for PartitionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}-{}", self.prefix, self.kind.as_str(), self.version)
  }
}

/// Current-version partitions and their size limits.
#[derive(Debug, Clone)]
pub struct PartitionSet {
  prefix: String,
  version: String,
  dynamic_limit: usize,
  image_limit: Option<usize>,
}

impl PartitionSet {
  /// `image_limit` is `None` when image caching is disabled.
  pub fn new(prefix: &str, version: &str, dynamic_limit: usize, image_limit: Option<usize>) -> Self {
    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
      dynamic_limit,
      image_limit,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn name(&self, kind: PartitionKind) -> PartitionName {
    PartitionName::new(&self.prefix, kind, &self.version)
  }

  /// Maximum entry count, `None` for unbounded.
  pub fn limit(&self, kind: PartitionKind) -> Option<usize> {
    match kind {
      PartitionKind::Static => None,
      PartitionKind::Dynamic => Some(self.dynamic_limit),
      PartitionKind::Images => self.image_limit,
    }
  }

  /// Kinds in use for this deploy.
  pub fn kinds(&self) -> Vec<PartitionKind> {
    let mut kinds = vec![PartitionKind::Static, PartitionKind::Dynamic];
    if self.image_limit.is_some() {
      kinds.push(PartitionKind::Images);
    }
    kinds
  }

  /// Whether `name` is one of this deploy's partitions.
  pub fn is_current(&self, name: &str) -> bool {
    self.kinds().into_iter().any(|k| self.name(k).to_string() == name)
  }
}
