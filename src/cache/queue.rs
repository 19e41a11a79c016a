//! Insertion-ordered eviction queue.

use std::collections::VecDeque;

/// FIFO queue of keys, oldest at the front.
///
/// Reads never reorder; only a re-insert moves a key to the back.
#[derive(Debug, Clone)]
pub struct EvictionQueue<K> {
  keys: VecDeque<K>,
}

impl<K: PartialEq> EvictionQueue<K> {
  pub fn new() -> Self {
    Self {
      keys: VecDeque::new(),
    }
  }

  /// Append a key, moving it to the back if already queued.
  pub fn push(&mut self, key: K) {
    if let Some(pos) = self.keys.iter().position(|k| *k == key) {
      self.keys.remove(pos);
    }
    self.keys.push_back(key);
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  /// Evict oldest keys until at most `limit` remain. Returns them oldest first.
  pub fn trim(&mut self, limit: usize) -> Vec<K> {
    let surplus = self.keys.len().saturating_sub(limit);
    self.keys.drain(..surplus).collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = &K> {
    self.keys.iter()
  }
}

impl<K: PartialEq> Default for EvictionQueue<K> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K: PartialEq> FromIterator<K> for EvictionQueue<K> {
  fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
    let mut queue = Self::new();
    for key in iter {
      queue.push(key);
    }
    queue
  }
}
