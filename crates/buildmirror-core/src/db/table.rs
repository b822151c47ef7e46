use std::collections::HashMap;
use std::marker::PhantomData;

use rusqlite::{OptionalExtension, params};
use serde::{Serialize, de::DeserializeOwned};

use super::{SharedConnection, ensure_initialized, schema};
use crate::error::StoreError;
use crate::key::{CompositeKey, ServerMask};
use crate::kv::{KvTable, ScanFilter};

/// [`KvTable`] persisted in one of the mirror's SQLite tables.
///
/// Values are stored as JSON text; the on-disk encoding is private to this
/// type.
pub struct SqliteTable<V> {
    conn: SharedConnection,
    table: &'static str,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for SqliteTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTable").field("table", &self.table).finish()
    }
}

impl<V> SqliteTable<V> {
    /// # Errors
    ///
    /// Returns [`StoreError::NotInitialized`] if `table` is unknown or the
    /// database schema has not been migrated.
    pub fn open(conn: SharedConnection, table: &'static str) -> Result<Self, StoreError> {
        if !schema::KV_TABLES.contains(&table) {
            return Err(StoreError::NotInitialized {
                table: table.to_string(),
            });
        }
        {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned("sqlite connection"))?;
            ensure_initialized(&guard, table)?;
        }
        Ok(Self {
            conn,
            table,
            _value: PhantomData,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Poisoned("sqlite connection"))
    }
}

impl<V: DeserializeOwned> SqliteTable<V> {
    fn decode(&self, text: &str) -> Result<V, StoreError> {
        serde_json::from_str(text).map_err(|source| StoreError::Codec {
            table: self.table.to_string(),
            source,
        })
    }
}

impl<V> KvTable<V> for SqliteTable<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn name(&self) -> &str {
        self.table
    }

    fn get(&self, key: CompositeKey) -> Result<Option<V>, StoreError> {
        let conn = self.lock()?;
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                [key.to_sql()],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| self.decode(&t)).transpose()
    }

    fn get_all(&self, keys: &[CompositeKey]) -> Result<HashMap<CompositeKey, V>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {} WHERE key = ?1",
            self.table
        ))?;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let text: Option<String> = stmt
                .query_row([key.to_sql()], |row| row.get(0))
                .optional()?;
            if let Some(text) = text {
                found.insert(*key, self.decode(&text)?);
            }
        }
        Ok(found)
    }

    fn put(&self, key: CompositeKey, value: &V) -> Result<(), StoreError> {
        let text = serde_json::to_string(value).map_err(|source| StoreError::Codec {
            table: self.table.to_string(),
            source,
        })?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (key, server, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                self.table
            ),
            params![key.to_sql(), i64::from(key.server().0), text],
        )?;
        Ok(())
    }

    fn contains_key(&self, key: CompositeKey) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE key = ?1)", self.table),
            [key.to_sql()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn scan(
        &self,
        server: ServerMask,
        filter: ScanFilter<'_, V>,
    ) -> Result<Vec<(CompositeKey, V)>, StoreError> {
        let rows: Vec<(i64, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT key, value FROM {} WHERE server = ?1 ORDER BY key",
                self.table
            ))?;
            let rows = stmt
                .query_map([i64::from(server.0)], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut out = Vec::new();
        for (raw, text) in rows {
            let key = CompositeKey::from_sql(raw);
            let value = self.decode(&text)?;
            if filter(key, &value) {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}
