use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Prefix of the per-schema state cache tables.
pub const CACHE_TABLE_PREFIX: &str = "state_cache_";

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Cache table name for a schema key. Keys are restricted to `[a-z0-9_]`
/// because they are spliced into SQL.
pub fn cache_table(schema_key: &str) -> Result<String, StorageError> {
    let valid = !schema_key.is_empty()
        && schema_key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StorageError::ConstraintViolation(format!(
            "schema key {schema_key:?} cannot name a cache table"
        )));
    }
    Ok(format!("{CACHE_TABLE_PREFIX}{schema_key}"))
}

pub fn create_cache_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            version_id BLOB NOT NULL CHECK (length(version_id) = 16),
            entity_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            schema_version TEXT NOT NULL,
            change_id BLOB NOT NULL CHECK (length(change_id) = 16),
            snapshot_id BLOB NOT NULL CHECK (length(snapshot_id) = 32),
            inherited_from BLOB CHECK (inherited_from IS NULL OR length(inherited_from) = 16),
            PRIMARY KEY (version_id, file_id, entity_id)
        ) WITHOUT ROWID;"
    )
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS snapshots (
    id BLOB PRIMARY KEY CHECK (length(id) = 32),
    content BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS changes (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    file_id TEXT NOT NULL,
    plugin_key TEXT NOT NULL,
    snapshot_id BLOB NOT NULL CHECK (length(snapshot_id) = 32),
    created_at BLOB NOT NULL CHECK (length(created_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_changes_entity ON changes (schema_key, file_id, entity_id);

CREATE TABLE IF NOT EXISTS change_sets (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    immutable INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS change_set_elements (
    change_set_id BLOB NOT NULL REFERENCES change_sets (id),
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    file_id TEXT NOT NULL,
    change_id BLOB NOT NULL REFERENCES changes (id),
    PRIMARY KEY (change_set_id, entity_id, schema_key, file_id)
);
CREATE INDEX IF NOT EXISTS idx_elements_entity ON change_set_elements (schema_key, file_id, entity_id);

CREATE TABLE IF NOT EXISTS change_edges (
    parent_id BLOB NOT NULL REFERENCES change_sets (id),
    child_id BLOB NOT NULL REFERENCES change_sets (id),
    PRIMARY KEY (child_id, parent_id),
    CHECK (parent_id != child_id)
);

CREATE TABLE IF NOT EXISTS commits (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    change_set_id BLOB NOT NULL UNIQUE REFERENCES change_sets (id),
    author TEXT NOT NULL,
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commit_labels (
    commit_id BLOB NOT NULL REFERENCES commits (id),
    label TEXT NOT NULL,
    PRIMARY KEY (commit_id, label)
);

CREATE TABLE IF NOT EXISTS versions (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    name TEXT NOT NULL UNIQUE,
    change_set_id BLOB NOT NULL REFERENCES change_sets (id),
    working_change_set_id BLOB NOT NULL REFERENCES change_sets (id),
    inherits_from BLOB REFERENCES versions (id)
);

CREATE TABLE IF NOT EXISTS conflicts (
    id BLOB PRIMARY KEY CHECK (length(id) = 16),
    conflict_key TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    schema_key TEXT NOT NULL,
    file_id TEXT NOT NULL,
    change_ids BLOB NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('open', 'resolved')),
    detected_at BLOB NOT NULL CHECK (length(detected_at) = 12),
    resolved_change_id BLOB CHECK (resolved_change_id IS NULL OR length(resolved_change_id) = 16),
    resolved_at BLOB CHECK (resolved_at IS NULL OR length(resolved_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_conflicts_key ON conflicts (conflict_key, status);

CREATE TABLE IF NOT EXISTS version_conflicts (
    version_id BLOB NOT NULL REFERENCES versions (id),
    conflict_id BLOB NOT NULL REFERENCES conflicts (id),
    PRIMARY KEY (version_id, conflict_id)
);

CREATE TABLE IF NOT EXISTS merge_intents (
    source_version_id BLOB NOT NULL REFERENCES versions (id),
    target_version_id BLOB NOT NULL REFERENCES versions (id),
    source_change_set_id BLOB NOT NULL REFERENCES change_sets (id),
    recorded_at BLOB NOT NULL CHECK (length(recorded_at) = 12),
    PRIMARY KEY (source_version_id, target_version_id)
);

CREATE TABLE IF NOT EXISTS cache_meta (
    schema_key TEXT NOT NULL,
    version_id BLOB NOT NULL CHECK (length(version_id) = 16),
    chain BLOB NOT NULL,
    PRIMARY KEY (schema_key, version_id)
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_table_names() {
        assert_eq!(cache_table("todo_item").unwrap(), "state_cache_todo_item");
        assert!(cache_table("todo; DROP TABLE changes").is_err());
        assert!(cache_table("").is_err());
    }

    #[test]
    fn schema_bootstraps_twice() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
