//! Map wrapper that never creates entries implicitly.
//!
//! Lookups return `Option`, reference counting goes through explicit
//! methods, and [`SyncMap::release`] removes an entry exactly when its count
//! reaches zero. This is what keeps idle metadata from outliving its last
//! physical location.

use pipe_mgr_types::{PipeMgrError, PipeResult};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Values that carry a reference count.
pub trait HasRefCount {
    /// Increments the reference count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the reference count and returns the new value.
    ///
    /// Returns `None` if the count would underflow.
    fn decrement_ref(&mut self) -> Option<u32>;

    fn ref_count(&self) -> u32;
}

/// A map that never auto-vivifies.
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key`. Never creates entries.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns the value for `key` mutably. Never creates entries.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Explicitly creates the entry when absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.inner.entry(key).or_insert_with(f)
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash + Debug,
    V: HasRefCount,
{
    /// Increments the count of an existing entry.
    pub fn increment_ref(&mut self, key: &K) -> PipeResult<u32> {
        match self.inner.get_mut(key) {
            Some(entry) => Ok(entry.increment_ref()),
            None => Err(PipeMgrError::not_found(format!("{:?}", key))),
        }
    }

    /// Decrements the count of an existing entry and removes it when the
    /// count reaches zero. Returns the removed value in that case.
    pub fn release(&mut self, key: &K) -> PipeResult<Option<V>> {
        let entry = self
            .inner
            .get_mut(key)
            .ok_or_else(|| PipeMgrError::not_found(format!("{:?}", key)))?;
        let remaining = entry
            .decrement_ref()
            .ok_or_else(|| PipeMgrError::unexpected(format!("refcount underflow for {:?}", key)))?;
        if remaining == 0 {
            Ok(self.inner.remove(key))
        } else {
            Ok(None)
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
