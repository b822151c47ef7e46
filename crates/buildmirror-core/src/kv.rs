//! Pluggable key-value tables keyed by [`CompositeKey`].
//!
//! Stores only need point reads, bulk reads, whole-value writes and a
//! per-server filtered scan. [`MemTable`] keeps everything in memory;
//! [`crate::db::SqliteTable`] persists values as JSON rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::StoreError;
use crate::key::{CompositeKey, ServerMask};

/// Predicate used by [`KvTable::scan`].
pub type ScanFilter<'a, V> = &'a dyn Fn(CompositeKey, &V) -> bool;

/// A table of whole values addressed by composite key.
pub trait KvTable<V>: Send + Sync {
    /// Table name, used in logs and errors.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns an error if the backend read fails or the value is corrupt.
    fn get(&self, key: CompositeKey) -> Result<Option<V>, StoreError>;

    /// Read every present key; missing keys are absent from the map.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails or a value is corrupt.
    fn get_all(&self, keys: &[CompositeKey]) -> Result<HashMap<CompositeKey, V>, StoreError>;

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    fn put(&self, key: CompositeKey, value: &V) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    fn contains_key(&self, key: CompositeKey) -> Result<bool, StoreError>;

    /// All entries of `server` accepted by `filter`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails or a value is corrupt.
    fn scan(
        &self,
        server: ServerMask,
        filter: ScanFilter<'_, V>,
    ) -> Result<Vec<(CompositeKey, V)>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemTable
// ---------------------------------------------------------------------------

/// In-memory table.
#[derive(Debug)]
pub struct MemTable<V> {
    name: String,
    entries: RwLock<BTreeMap<CompositeKey, V>>,
}

impl<V> MemTable<V> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored entries across all servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + Sync> KvTable<V> for MemTable<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: CompositeKey) -> Result<Option<V>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned("mem table"))?;
        Ok(entries.get(&key).cloned())
    }

    fn get_all(&self, keys: &[CompositeKey]) -> Result<HashMap<CompositeKey, V>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned("mem table"))?;
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (*k, v.clone())))
            .collect())
    }

    fn put(&self, key: CompositeKey, value: &V) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned("mem table"))?;
        entries.insert(key, value.clone());
        Ok(())
    }

    fn contains_key(&self, key: CompositeKey) -> Result<bool, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned("mem table"))?;
        Ok(entries.contains_key(&key))
    }

    fn scan(
        &self,
        server: ServerMask,
        filter: ScanFilter<'_, V>,
    ) -> Result<Vec<(CompositeKey, V)>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned("mem table"))?;
        Ok(entries
            .range(server.key(0)..=server.key(u32::MAX))
            .filter(|(k, v)| filter(**k, v))
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}
