//! Per-schema state cache tables.
//!
//! One `state_cache_<schema>` table per schema holds the resolved row of every
//! `(version, file, entity)`; `cache_meta` remembers, per schema and version,
//! which chain tips the rows were computed from. Everything here is derived
//! data and may be dropped at any time.

use rusqlite::Row;

use versa_core::{ids::*, model::{EntityKey, StateRow}};

use crate::error::StorageError;
use crate::schema::{cache_table, create_cache_table_sql, CACHE_TABLE_PREFIX};
use crate::sqlite::{col, col_opt, query_all, query_one, SqliteStorage};

/// One chain member recorded when a cache slice was populated: the version
/// and the committed tip it had at that time.
pub type ChainTip = (VersionId, ChangeSetId);

/// Cache access. Writable through a shared reference because population
/// happens lazily on reads.
pub trait StateCache {
    fn cached_schemas(&self) -> Result<Vec<String>, StorageError>;

    fn cache_meta(&self, schema_key: &str, version_id: VersionId) -> Result<Option<Vec<ChainTip>>, StorageError>;

    fn set_cache_meta(&self, schema_key: &str, version_id: VersionId, chain: &[ChainTip]) -> Result<(), StorageError>;

    fn clear_cache_version(&self, schema_key: &str, version_id: VersionId) -> Result<(), StorageError>;

    /// Removes the cached rows of the given `(file_id, entity_id)` keys.
    fn delete_cache_rows(
        &self,
        schema_key: &str,
        version_id: VersionId,
        keys: &[(String, String)],
    ) -> Result<(), StorageError>;

    fn insert_cache_rows(&self, schema_key: &str, rows: &[StateRow]) -> Result<(), StorageError>;

    /// All cached rows of one schema in `(version_id, file_id, entity_id)` order.
    fn cache_rows(&self, schema_key: &str) -> Result<Vec<StateRow>, StorageError>;

    /// Cached rows of one version in `(file_id, entity_id)` order.
    fn cache_rows_for_version(&self, schema_key: &str, version_id: VersionId) -> Result<Vec<StateRow>, StorageError>;

    fn cache_row(
        &self,
        schema_key: &str,
        version_id: VersionId,
        key: &EntityKey,
    ) -> Result<Option<StateRow>, StorageError>;

    /// Drops one schema's cache, or every cache table when `schema_key` is None.
    fn drop_cache(&self, schema_key: Option<&str>) -> Result<(), StorageError>;
}

const ROW_COLUMNS: &str =
    "version_id, entity_id, file_id, schema_version, change_id, snapshot_id, inherited_from";

fn read_row(schema_key: &str, row: &Row) -> Result<StateRow, StorageError> {
    Ok(StateRow {
        version_id: VersionId::from_bytes(col(row, 0, "version id")?),
        entity_id: row.get(1)?,
        schema_key: schema_key.to_string(),
        file_id: row.get(2)?,
        schema_version: row.get(3)?,
        change_id: ChangeId::from_bytes(col(row, 4, "change id")?),
        snapshot_id: SnapshotId::from_bytes(col(row, 5, "snapshot id")?),
        inherited_from: col_opt(row, 6, "inherited_from")?.map(VersionId::from_bytes),
    })
}

impl SqliteStorage {
    fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let n: i64 = self.conn().query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            rusqlite::params![table],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}

impl StateCache for SqliteStorage {
    fn cached_schemas(&self) -> Result<Vec<String>, StorageError> {
        query_all(
            self.conn(),
            "SELECT DISTINCT schema_key FROM cache_meta ORDER BY schema_key",
            [],
            |row| Ok(row.get(0)?),
        )
    }

    fn cache_meta(&self, schema_key: &str, version_id: VersionId) -> Result<Option<Vec<ChainTip>>, StorageError> {
        let chain: Option<Vec<u8>> = query_one(
            self.conn(),
            "SELECT chain FROM cache_meta WHERE schema_key = ?1 AND version_id = ?2",
            rusqlite::params![schema_key, version_id.as_bytes().as_slice()],
            |row| Ok(row.get(0)?),
        )?;
        // A meta row without its table means the table was dropped underneath.
        if chain.is_some() && !self.table_exists(&cache_table(schema_key)?)? {
            return Ok(None);
        }
        chain
            .map(|bytes| {
                rmp_serde::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn set_cache_meta(&self, schema_key: &str, version_id: VersionId, chain: &[ChainTip]) -> Result<(), StorageError> {
        let bytes = rmp_serde::to_vec(chain).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn().execute(
            "INSERT INTO cache_meta (schema_key, version_id, chain) VALUES (?1, ?2, ?3)
             ON CONFLICT (schema_key, version_id) DO UPDATE SET chain = excluded.chain",
            rusqlite::params![schema_key, version_id.as_bytes().as_slice(), bytes],
        )?;
        Ok(())
    }

    fn clear_cache_version(&self, schema_key: &str, version_id: VersionId) -> Result<(), StorageError> {
        let table = cache_table(schema_key)?;
        self.conn().execute_batch(&create_cache_table_sql(&table))?;
        self.conn().execute(
            &format!("DELETE FROM {table} WHERE version_id = ?1"),
            rusqlite::params![version_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn delete_cache_rows(
        &self,
        schema_key: &str,
        version_id: VersionId,
        keys: &[(String, String)],
    ) -> Result<(), StorageError> {
        let table = cache_table(schema_key)?;
        self.conn().execute_batch(&create_cache_table_sql(&table))?;
        let mut stmt = self.conn().prepare_cached(&format!(
            "DELETE FROM {table} WHERE version_id = ?1 AND file_id = ?2 AND entity_id = ?3"
        ))?;
        for (file_id, entity_id) in keys {
            stmt.execute(rusqlite::params![version_id.as_bytes().as_slice(), file_id, entity_id])?;
        }
        Ok(())
    }

    fn insert_cache_rows(&self, schema_key: &str, rows: &[StateRow]) -> Result<(), StorageError> {
        let table = cache_table(schema_key)?;
        self.conn().execute_batch(&create_cache_table_sql(&table))?;
        let mut stmt = self.conn().prepare_cached(&format!(
            "INSERT OR REPLACE INTO {table} ({ROW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ))?;
        for row in rows {
            if row.schema_key != schema_key {
                return Err(StorageError::ConstraintViolation(format!(
                    "row of schema {} written to cache of {schema_key}",
                    row.schema_key
                )));
            }
            stmt.execute(rusqlite::params![
                row.version_id.as_bytes().as_slice(),
                row.entity_id,
                row.file_id,
                row.schema_version,
                row.change_id.as_bytes().as_slice(),
                row.snapshot_id.as_bytes().as_slice(),
                row.inherited_from.map(|v| v.as_bytes().to_vec()),
            ])?;
        }
        Ok(())
    }

    fn cache_rows(&self, schema_key: &str) -> Result<Vec<StateRow>, StorageError> {
        let table = cache_table(schema_key)?;
        if !self.table_exists(&table)? {
            return Ok(Vec::new());
        }
        query_all(
            self.conn(),
            &format!("SELECT {ROW_COLUMNS} FROM {table} ORDER BY version_id, file_id, entity_id"),
            [],
            |row| read_row(schema_key, row),
        )
    }

    fn cache_rows_for_version(&self, schema_key: &str, version_id: VersionId) -> Result<Vec<StateRow>, StorageError> {
        let table = cache_table(schema_key)?;
        if !self.table_exists(&table)? {
            return Ok(Vec::new());
        }
        query_all(
            self.conn(),
            &format!("SELECT {ROW_COLUMNS} FROM {table} WHERE version_id = ?1 ORDER BY file_id, entity_id"),
            rusqlite::params![version_id.as_bytes().as_slice()],
            |row| read_row(schema_key, row),
        )
    }

    fn cache_row(
        &self,
        schema_key: &str,
        version_id: VersionId,
        key: &EntityKey,
    ) -> Result<Option<StateRow>, StorageError> {
        let table = cache_table(schema_key)?;
        if key.schema_key != schema_key || !self.table_exists(&table)? {
            return Ok(None);
        }
        query_one(
            self.conn(),
            &format!(
                "SELECT {ROW_COLUMNS} FROM {table}
                 WHERE version_id = ?1 AND file_id = ?2 AND entity_id = ?3"
            ),
            rusqlite::params![version_id.as_bytes().as_slice(), key.file_id, key.entity_id],
            |row| read_row(schema_key, row),
        )
    }

    fn drop_cache(&self, schema_key: Option<&str>) -> Result<(), StorageError> {
        let tables: Vec<String> = match schema_key {
            Some(key) => vec![cache_table(key)?],
            None => query_all(
                self.conn(),
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ORDER BY name",
                rusqlite::params![format!("{CACHE_TABLE_PREFIX}%")],
                |row| Ok(row.get(0)?),
            )?,
        };
        self.with_savepoint(|conn| {
            for table in &tables {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
            }
            match schema_key {
                Some(key) => conn.execute("DELETE FROM cache_meta WHERE schema_key = ?1", rusqlite::params![key])?,
                None => conn.execute("DELETE FROM cache_meta", [])?,
            };
            Ok(())
        })
    }
}
