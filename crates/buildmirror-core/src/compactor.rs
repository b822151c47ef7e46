//! String interning for compact stored records.
//!
//! Build type ids, branch names, test names and statuses repeat across
//! thousands of builds. Stored records keep a `u32` id instead of the
//! string; [`StringCompactor`] maps between the two.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;

/// Bidirectional string ↔ id mapping.
///
/// Ids are dense and never reused, so an id written into a record stays
/// resolvable for the lifetime of the store.
pub trait StringCompactor: Send + Sync {
    /// Return the id for `value`, allocating one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a newly allocated id cannot be persisted.
    fn intern(&self, value: &str) -> Result<u32, StoreError>;

    /// Return the id for `value` only if it was interned before.
    fn id_if_present(&self, value: &str) -> Option<u32>;

    /// Return the string for `id`.
    fn resolve(&self, id: u32) -> Option<String>;

    /// Intern an optional value.
    ///
    /// # Errors
    ///
    /// Same as [`StringCompactor::intern`].
    fn intern_opt(&self, value: Option<&str>) -> Result<Option<u32>, StoreError> {
        value.map(|v| self.intern(v)).transpose()
    }

    /// Resolve an optional id; unknown ids resolve to `None`.
    fn resolve_opt(&self, id: Option<u32>) -> Option<String> {
        id.and_then(|id| self.resolve(id))
    }
}

/// Plain in-memory table behind both compactor implementations.
#[derive(Debug, Default)]
pub struct Interner {
    by_value: HashMap<String, u32>,
    by_id: Vec<String>,
}

impl Interner {
    #[must_use]
    pub fn get(&self, value: &str) -> Option<u32> {
        self.by_value.get(value).copied()
    }

    #[must_use]
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.by_id.get(id as usize).map(String::as_str)
    }

    /// The id the next new value would get.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        u32::try_from(self.by_id.len()).unwrap_or(u32::MAX)
    }

    /// Allocate the next id for a value that is not present yet.
    ///
    /// Returns `(id, true)` when a new id was allocated.
    pub fn insert(&mut self, value: &str) -> (u32, bool) {
        if let Some(id) = self.get(value) {
            return (id, false);
        }
        let id = self.next_id();
        self.by_id.push(value.to_string());
        self.by_value.insert(value.to_string(), id);
        (id, true)
    }

    /// Restore a persisted `(id, value)` pair. Ids must arrive in order
    /// with no gaps.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SparseStrings`] when `id` is not the next id.
    pub fn restore(&mut self, id: u32, value: String) -> Result<(), StoreError> {
        let expected = self.next_id();
        if id != expected {
            return Err(StoreError::SparseStrings { expected, found: id });
        }
        self.by_value.insert(value.clone(), id);
        self.by_id.push(value);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Non-persistent compactor, used by tests and in-memory mirrors.
#[derive(Debug, Default)]
pub struct MemCompactor {
    inner: RwLock<Interner>,
}

impl MemCompactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StringCompactor for MemCompactor {
    fn intern(&self, value: &str) -> Result<u32, StoreError> {
        if let Some(id) = self.id_if_present(value) {
            return Ok(id);
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::Poisoned("string compactor"))?;
        Ok(inner.insert(value).0)
    }

    fn id_if_present(&self, value: &str) -> Option<u32> {
        self.inner.read().ok()?.get(value)
    }

    fn resolve(&self, id: u32) -> Option<String> {
        self.inner.read().ok()?.resolve(id).map(str::to_string)
    }
}
