//! Canonical SQLite schema for the mirror database.
//!
//! Every logical table is a key-value table:
//! - `key` is the composite key stored as its `i64` bit pattern
//! - `server` repeats the high half of the key so per-server scans use an index
//! - `value` is the JSON-encoded record
//!
//! `strings` backs the string compactor and `mirror_meta` records the schema
//! version alongside `PRAGMA user_version`.

/// Key-value tables managed by the store layer.
pub const BUILD_REFS_TABLE: &str = "build_refs";
pub const FAT_BUILDS_TABLE: &str = "fat_builds";
pub const BUILD_CONDITIONS_TABLE: &str = "build_conditions";

/// Tables that [`crate::db::SqliteTable`] may be opened against.
pub const KV_TABLES: &[&str] = &[BUILD_REFS_TABLE, FAT_BUILDS_TABLE, BUILD_CONDITIONS_TABLE];

/// Migration v1: key-value tables, intern table, metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS build_refs (
    key INTEGER PRIMARY KEY,
    server INTEGER NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fat_builds (
    key INTEGER PRIMARY KEY,
    server INTEGER NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS build_conditions (
    key INTEGER PRIMARY KEY,
    server INTEGER NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS strings (
    id INTEGER PRIMARY KEY,
    value TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS mirror_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO mirror_meta (id, schema_version, created_at_us)
VALUES (1, 1, 0);
";

/// Migration v2: per-server scan indexes.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_build_refs_server
    ON build_refs(server, key);

CREATE INDEX IF NOT EXISTS idx_fat_builds_server
    ON fat_builds(server, key);

CREATE INDEX IF NOT EXISTS idx_build_conditions_server
    ON build_conditions(server, key);
";

/// Indexes expected after all migrations.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_build_refs_server",
    "idx_fat_builds_server",
    "idx_build_conditions_server",
];
