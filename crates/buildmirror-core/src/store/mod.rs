//! Stores over the key-value tables.

pub mod conditions;
pub mod fat;
pub mod history;
pub mod refs;

pub use conditions::BuildConditionStore;
pub use fat::FatBuildStore;
pub use history::{BuildOutcome, RunHistoryCache, SuiteHistory, TestHistory, TestRun};
pub use refs::BuildReferenceStore;

use std::sync::Arc;

use crate::compactor::{MemCompactor, StringCompactor};
use crate::db::{MirrorDb, schema};
use crate::error::StoreError;
use crate::kv::MemTable;

/// Every store of one mirror, sharing a single string compactor.
pub struct Stores {
    pub refs: BuildReferenceStore,
    pub fat: FatBuildStore,
    pub conditions: BuildConditionStore,
    pub compactor: Arc<dyn StringCompactor>,
}

impl Stores {
    /// Non-persistent stores.
    #[must_use]
    pub fn in_memory() -> Self {
        let compactor: Arc<dyn StringCompactor> = Arc::new(MemCompactor::new());
        Self {
            refs: BuildReferenceStore::new(
                Box::new(MemTable::new(schema::BUILD_REFS_TABLE)),
                Arc::clone(&compactor),
            ),
            fat: FatBuildStore::new(
                Box::new(MemTable::new(schema::FAT_BUILDS_TABLE)),
                Arc::clone(&compactor),
            ),
            conditions: BuildConditionStore::new(Box::new(MemTable::new(
                schema::BUILD_CONDITIONS_TABLE,
            ))),
            compactor,
        }
    }

    /// Stores backed by a migrated SQLite database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] if `db` was not migrated, or
    /// an error if the intern table cannot be loaded.
    pub fn open_sqlite(db: &MirrorDb) -> Result<Self, StoreError> {
        let compactor: Arc<dyn StringCompactor> = Arc::new(db.compactor()?);
        Ok(Self {
            refs: BuildReferenceStore::new(
                Box::new(db.table(schema::BUILD_REFS_TABLE)?),
                Arc::clone(&compactor),
            ),
            fat: FatBuildStore::new(
                Box::new(db.table(schema::FAT_BUILDS_TABLE)?),
                Arc::clone(&compactor),
            ),
            conditions: BuildConditionStore::new(Box::new(
                db.table(schema::BUILD_CONDITIONS_TABLE)?,
            )),
            compactor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Stores;
    use crate::db::MirrorDb;
    use crate::key::ServerMask;
    use crate::model::{BuildRef, BuildState};

    #[test]
    fn sqlite_stores_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("mirror.sqlite3");
        let server = ServerMask::for_server("apache");
        {
            let db = MirrorDb::open(&path).expect("open");
            let stores = Stores::open_sqlite(&db).expect("stores");
            let r = BuildRef {
                id: 11,
                build_type_id: "Ignite_RunAll".into(),
                branch_name: Some("refs/heads/master".into()),
                status: None,
                state: BuildState::Queued,
            };
            let changed = stores.refs.save_chunk(server, &[r]).expect("save");
            assert_eq!(changed.len(), 1);
        }

        let db = MirrorDb::open(&path).expect("reopen");
        let stores = Stores::open_sqlite(&db).expect("stores");
        let history = stores
            .refs
            .find_builds_in_history(server, Some("Ignite_RunAll"), Some("refs/heads/master"))
            .expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, BuildState::Queued);
    }
}
