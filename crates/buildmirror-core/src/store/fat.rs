//! Full build records.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::compactor::StringCompactor;
use crate::error::StoreError;
use crate::key::{CompositeKey, ServerMask};
use crate::kv::KvTable;
use crate::model::remote::STATUS_SUCCESS;
use crate::model::{CompactedBuild, FatBuildInput};
use crate::store::history::{RunHistoryCache, SuiteHistory};

/// Composite key → [`CompactedBuild`], plus the derived run-history cache.
pub struct FatBuildStore {
    table: Box<dyn KvTable<CompactedBuild>>,
    compactor: Arc<dyn StringCompactor>,
    history: RunHistoryCache,
}

impl FatBuildStore {
    #[must_use]
    pub fn new(table: Box<dyn KvTable<CompactedBuild>>, compactor: Arc<dyn StringCompactor>) -> Self {
        Self {
            table,
            compactor,
            history: RunHistoryCache::default(),
        }
    }

    #[must_use]
    pub fn compactor(&self) -> &dyn StringCompactor {
        self.compactor.as_ref()
    }

    /// Normalize `input` and store it unless it equals `existing`.
    ///
    /// Returns the stored record, or `None` when nothing changed. A stored
    /// record carries `existing.revision + 1`, or 1 when there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if interning or the write fails.
    pub fn save_build(
        &self,
        key: CompositeKey,
        input: &FatBuildInput<'_>,
        existing: Option<&CompactedBuild>,
    ) -> Result<Option<CompactedBuild>, StoreError> {
        let mut build = CompactedBuild::normalize(self.compactor.as_ref(), input)?;
        if existing == Some(&build) {
            debug!(build = key.build_id(), "fat build unchanged");
            return Ok(None);
        }
        build.revision = existing.map_or(1, |e| e.revision + 1);
        self.put_fat_build(key, &build)?;
        Ok(Some(build))
    }

    /// Unconditional write.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_fat_build(&self, key: CompositeKey, build: &CompactedBuild) -> Result<(), StoreError> {
        self.table.put(key, build)?;
        self.history.invalidate(key.server(), build.build_type_id);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get_fat_build(&self, key: CompositeKey) -> Result<Option<CompactedBuild>, StoreError> {
        self.table.get(key)
    }

    /// Bulk read keyed by raw build id; absent builds are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get_all_fat_builds(
        &self,
        server: ServerMask,
        ids: &[u32],
    ) -> Result<HashMap<u32, CompactedBuild>, StoreError> {
        let keys: Vec<CompositeKey> = ids.iter().map(|id| server.key(*id)).collect();
        Ok(self
            .table
            .get_all(&keys)?
            .into_iter()
            .map(|(k, v)| (k.build_id(), v))
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn contains_key(&self, key: CompositeKey) -> Result<bool, StoreError> {
        self.table.contains_key(key)
    }

    /// Raw ids of records written under an older entity version.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn outdated_version_entries(&self, server: ServerMask) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .table
            .scan(server, &|_, b: &CompactedBuild| b.is_outdated_entity_version())?
            .into_iter()
            .map(|(k, _)| k.build_id())
            .collect())
    }

    /// Start timestamps (epoch ms) of the stored builds that have one.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn build_start_times(
        &self,
        server: ServerMask,
        ids: &[u32],
    ) -> Result<HashMap<u32, i64>, StoreError> {
        Ok(self
            .get_all_fat_builds(server, ids)?
            .into_iter()
            .filter_map(|(id, b)| b.start_date.filter(|ts| *ts > 0).map(|ts| (id, ts)))
            .collect())
    }

    /// Test history of one build type, cached until one of its builds is
    /// written again.
    ///
    /// An unknown build type has an empty history.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub fn suite_history(
        &self,
        server: ServerMask,
        build_type_id: &str,
    ) -> Result<Arc<SuiteHistory>, StoreError> {
        let Some(bt) = self.compactor.id_if_present(build_type_id) else {
            return Ok(Arc::new(SuiteHistory::default()));
        };
        self.history.get_or_compute(server, bt, || {
            let rows = self
                .table
                .scan(server, &|_, b: &CompactedBuild| b.build_type_id == bt)?;
            let success = self.compactor.id_if_present(STATUS_SUCCESS);
            debug!(%server, build_type_id, builds = rows.len(), "computed suite history");
            Ok(SuiteHistory::collect(rows.iter().map(|(_, b)| b), success))
        })
    }

    #[must_use]
    pub fn is_history_cached(&self, server: ServerMask, build_type_id: &str) -> bool {
        self.compactor
            .id_if_present(build_type_id)
            .is_some_and(|bt| self.history.is_cached(server, bt))
    }
}
