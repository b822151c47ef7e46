use std::sync::{MutexGuard, RwLock};

use rusqlite::{Connection, params};

use super::{SharedConnection, ensure_initialized};
use crate::compactor::{Interner, StringCompactor};
use crate::error::StoreError;

/// [`StringCompactor`] persisted in the `strings` table.
///
/// The whole table is loaded at open; lookups never touch SQLite and only
/// newly interned strings are written.
#[derive(Debug)]
pub struct SqliteCompactor {
    conn: SharedConnection,
    inner: RwLock<Interner>,
}

impl SqliteCompactor {
    /// # Errors
    ///
    /// Returns an error if the schema is not migrated or rows cannot be read.
    pub fn open(conn: SharedConnection) -> Result<Self, StoreError> {
        let mut interner = Interner::default();
        {
            let guard = lock(&conn)?;
            ensure_initialized(&guard, "strings")?;
            let mut stmt = guard.prepare("SELECT id, value FROM strings ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get(1)?)))?;
            for row in rows {
                let (id, value) = row?;
                interner.restore(id, value)?;
            }
        }
        tracing::debug!(strings = interner.len(), "loaded string intern table");
        Ok(Self {
            conn,
            inner: RwLock::new(interner),
        })
    }
}

fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Poisoned("sqlite connection"))
}

impl StringCompactor for SqliteCompactor {
    fn intern(&self, value: &str) -> Result<u32, StoreError> {
        if let Some(id) = self.id_if_present(value) {
            return Ok(id);
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::Poisoned("string compactor"))?;
        if let Some(id) = inner.get(value) {
            return Ok(id);
        }
        // Persist first: an id only becomes visible once its row exists.
        let id = inner.next_id();
        lock(&self.conn)?.execute(
            "INSERT INTO strings (id, value) VALUES (?1, ?2)",
            params![id, value],
        )?;
        inner.insert(value);
        Ok(id)
    }

    fn id_if_present(&self, value: &str) -> Option<u32> {
        self.inner.read().ok()?.get(value)
    }

    fn resolve(&self, id: u32) -> Option<String> {
        self.inner.read().ok()?.resolve(id).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use crate::compactor::StringCompactor;
    use crate::db::MirrorDb;
    use crate::error::StoreError;

    #[test]
    fn interned_strings_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("mirror.sqlite3");

        let first_id = {
            let db = MirrorDb::open(&path).expect("open");
            let compactor = db.compactor().expect("compactor");
            compactor.intern("Ignite_RunAll").expect("intern");
            compactor.intern("refs/heads/master").expect("intern")
        };

        let db = MirrorDb::open(&path).expect("reopen");
        let compactor = db.compactor().expect("compactor");
        assert_eq!(compactor.id_if_present("refs/heads/master"), Some(first_id));
        assert_eq!(compactor.resolve(0).as_deref(), Some("Ignite_RunAll"));
        assert_eq!(compactor.intern("new").expect("intern"), 2);
    }

    #[test]
    fn failed_write_allocates_no_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("mirror.sqlite3");

        {
            let db = MirrorDb::open(&path).expect("open");
            let compactor = db.compactor().expect("compactor");
            assert_eq!(compactor.intern("a").expect("intern"), 0);

            let conn = db.connection();
            let rename = |sql: &str| {
                conn.lock().expect("conn").execute_batch(sql).expect("rename");
            };
            rename("ALTER TABLE strings RENAME TO strings_away");
            assert!(compactor.intern("b").is_err());
            assert_eq!(compactor.id_if_present("b"), None);
            assert!(compactor.intern("b").is_err());
            rename("ALTER TABLE strings_away RENAME TO strings");

            assert_eq!(compactor.intern("c").expect("intern"), 1);
            assert_eq!(compactor.intern("b").expect("intern"), 2);
        }

        let db = MirrorDb::open(&path).expect("reopen");
        let compactor = db.compactor().expect("compactor");
        assert_eq!(compactor.resolve(1).as_deref(), Some("c"));
        assert_eq!(compactor.resolve(2).as_deref(), Some("b"));
    }

    #[test]
    fn sparse_table_refuses_to_open() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("mirror.sqlite3");
        let db = MirrorDb::open(&path).expect("open");
        db.connection()
            .lock()
            .expect("conn")
            .execute_batch("INSERT INTO strings (id, value) VALUES (0, 'a'), (2, 'c');")
            .expect("insert");
        let err = db.compactor().expect_err("gap");
        assert!(matches!(err, StoreError::SparseStrings { expected: 1, found: 2 }));
    }
}
