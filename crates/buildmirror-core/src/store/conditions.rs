//! User judgments on build validity.

use chrono::Utc;

use crate::error::StoreError;
use crate::key::ServerMask;
use crate::kv::KvTable;
use crate::model::BuildCondition;

/// Composite key → [`BuildCondition`]; last writer wins.
pub struct BuildConditionStore {
    table: Box<dyn KvTable<BuildCondition>>,
}

impl BuildConditionStore {
    #[must_use]
    pub fn new(table: Box<dyn KvTable<BuildCondition>>) -> Self {
        Self { table }
    }

    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get_build_condition(
        &self,
        server: ServerMask,
        build_id: u32,
    ) -> Result<Option<BuildCondition>, StoreError> {
        self.table.get(server.key(build_id))
    }

    /// Record `cond`, stamping `recorded_at` when unset.
    ///
    /// Returns `false` when the same judgment was already stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn set_build_condition(
        &self,
        server: ServerMask,
        mut cond: BuildCondition,
    ) -> Result<bool, StoreError> {
        let key = server.key(cond.build_id);
        if let Some(prev) = self.table.get(key)? {
            if prev.is_valid == cond.is_valid
                && prev.principal == cond.principal
                && prev.reason == cond.reason
            {
                return Ok(false);
            }
        }
        if cond.recorded_at.is_none() {
            cond.recorded_at = Some(Utc::now());
        }
        self.table.put(key, &cond)?;
        tracing::info!(
            build = cond.build_id,
            valid = cond.is_valid,
            principal = %cond.principal,
            "build condition recorded"
        );
        Ok(true)
    }

    /// A build is valid unless a stored judgment says otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn build_is_valid(&self, server: ServerMask, build_id: u32) -> Result<bool, StoreError> {
        Ok(self
            .get_build_condition(server, build_id)?
            .is_none_or(|c| c.is_valid))
    }
}
