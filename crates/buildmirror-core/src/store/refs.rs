//! Lightweight build history index.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::compactor::StringCompactor;
use crate::error::StoreError;
use crate::key::{CompositeKey, ServerMask};
use crate::kv::KvTable;
use crate::model::{BuildRef, BuildRefCompacted};

/// Composite key → compacted [`BuildRef`].
pub struct BuildReferenceStore {
    table: Box<dyn KvTable<BuildRefCompacted>>,
    compactor: Arc<dyn StringCompactor>,
}

impl BuildReferenceStore {
    #[must_use]
    pub fn new(
        table: Box<dyn KvTable<BuildRefCompacted>>,
        compactor: Arc<dyn StringCompactor>,
    ) -> Self {
        Self { table, compactor }
    }

    /// Upsert one page of references.
    ///
    /// Returns exactly the keys whose stored value changed. A reference
    /// repeated within `refs` is compared against what the earlier copy
    /// wrote, so identical repeats are never reported.
    ///
    /// # Errors
    ///
    /// Returns an error if a read, write or string intern fails.
    pub fn save_chunk(
        &self,
        server: ServerMask,
        refs: &[BuildRef],
    ) -> Result<BTreeSet<CompositeKey>, StoreError> {
        let keys: Vec<CompositeKey> = refs.iter().map(|r| server.key(r.id)).collect();
        let mut current = self.table.get_all(&keys)?;
        let mut changed = BTreeSet::new();

        for (key, r) in keys.into_iter().zip(refs) {
            let compacted = BuildRefCompacted::from_ref(self.compactor.as_ref(), r)?;
            if current.get(&key) == Some(&compacted) {
                continue;
            }
            self.table.put(key, &compacted)?;
            current.insert(key, compacted);
            changed.insert(key);
        }

        Ok(changed)
    }

    /// Upsert a single reference; returns whether it changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn save(&self, server: ServerMask, r: &BuildRefCompacted) -> Result<bool, StoreError> {
        let key = server.key(r.id);
        if self.table.get(key)?.as_ref() == Some(r) {
            return Ok(false);
        }
        self.table.put(key, r)?;
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get(&self, server: ServerMask, build_id: u32) -> Result<Option<BuildRef>, StoreError> {
        Ok(self
            .table
            .get(server.key(build_id))?
            .map(|r| r.to_ref(self.compactor.as_ref())))
    }

    /// History of one server, optionally narrowed to a build type and/or
    /// branch, ordered by build id.
    ///
    /// A build type or branch that was never interned cannot match anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn find_builds_in_history(
        &self,
        server: ServerMask,
        build_type_id: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Vec<BuildRef>, StoreError> {
        let build_type = match build_type_id {
            Some(bt) => match self.compactor.id_if_present(bt) {
                Some(id) => Some(id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let branch = match branch {
            Some(b) => match self.compactor.id_if_present(b) {
                Some(id) => Some(id),
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let rows = self.table.scan(server, &|_, r| {
            build_type.is_none_or(|bt| r.build_type_id == bt)
                && branch.is_none_or(|b| r.branch_name == Some(b))
        })?;

        Ok(rows
            .into_iter()
            .map(|(_, r)| r.to_ref(self.compactor.as_ref()))
            .collect())
    }

    /// References still queued or running on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn get_queued_and_running(
        &self,
        server: ServerMask,
    ) -> Result<Vec<BuildRefCompacted>, StoreError> {
        Ok(self
            .table
            .scan(server, &|_, r| r.state.is_active())?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }
}
