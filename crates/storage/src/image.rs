//! Whole-store export and import.
//!
//! Layout: `VRSA` magic, one format byte, the blake3 hash of the payload, then
//! the MessagePack-encoded [`StoreImage`]. Every table is dumped in primary-key
//! order, so two stores with the same content export identical bytes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use versa_core::{
    clock::Hlc,
    ids::*,
    model::{
        ChangeConflict, Change, ChangeEdge, ChangeSet, ChangeSetElement, Commit, MergeIntent,
        StateRow, Version,
    },
};

use crate::cache::{ChainTip, StateCache};
use crate::error::StorageError;
use crate::sqlite::{
    col, query_all, read_change, read_commit, read_conflict, read_element, read_merge_intent,
    read_version, SqliteStorage, CHANGE_COLUMNS, COMMIT_COLUMNS, CONFLICT_COLUMNS,
    ELEMENT_COLUMNS, VERSION_COLUMNS,
};
use crate::traits::Storage;

pub const IMAGE_MAGIC: &[u8; 4] = b"VRSA";
pub const IMAGE_FORMAT: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetaEntry {
    pub schema_key: String,
    pub version_id: VersionId,
    pub chain: Vec<ChainTip>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheImage {
    pub meta: Vec<CacheMetaEntry>,
    pub rows: Vec<StateRow>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreImage {
    /// Snapshot id and its canonical content bytes.
    pub snapshots: Vec<(SnapshotId, Vec<u8>)>,
    pub changes: Vec<Change>,
    pub change_sets: Vec<ChangeSet>,
    pub elements: Vec<ChangeSetElement>,
    pub edges: Vec<ChangeEdge>,
    pub commits: Vec<Commit>,
    pub labels: Vec<(CommitId, String)>,
    pub versions: Vec<Version>,
    pub conflicts: Vec<ChangeConflict>,
    pub version_conflicts: Vec<(VersionId, ConflictId)>,
    pub merge_intents: Vec<MergeIntent>,
    pub cache: Option<CacheImage>,
}

pub fn encode_image(image: &StoreImage) -> Result<Vec<u8>, StorageError> {
    let payload = rmp_serde::to_vec(image).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(IMAGE_MAGIC);
    out.push(IMAGE_FORMAT);
    out.extend_from_slice(blake3::hash(&payload).as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_image(bytes: &[u8]) -> Result<StoreImage, StorageError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != IMAGE_MAGIC {
        return Err(StorageError::BadImage("missing magic".into()));
    }
    if bytes[4] != IMAGE_FORMAT {
        return Err(StorageError::BadImage(format!("unsupported format {}", bytes[4])));
    }
    let payload = &bytes[HEADER_LEN..];
    if blake3::hash(payload).as_bytes() != &bytes[5..HEADER_LEN] {
        return Err(StorageError::BadImage("checksum mismatch".into()));
    }
    rmp_serde::from_slice(payload).map_err(|e| StorageError::BadImage(e.to_string()))
}

impl SqliteStorage {
    pub fn export_image(&self, include_cache: bool) -> Result<StoreImage, StorageError> {
        let conn = self.conn();
        let image = StoreImage {
            snapshots: query_all(conn, "SELECT id, content FROM snapshots ORDER BY id", [], |row| {
                Ok((SnapshotId::from_bytes(col(row, 0, "snapshot id")?), row.get(1)?))
            })?,
            changes: query_all(
                conn,
                &format!("SELECT {CHANGE_COLUMNS} FROM changes ORDER BY id"),
                [],
                read_change,
            )?,
            change_sets: query_all(conn, "SELECT id, immutable FROM change_sets ORDER BY id", [], |row| {
                Ok(ChangeSet {
                    id: ChangeSetId::from_bytes(col(row, 0, "change set id")?),
                    immutable: row.get(1)?,
                })
            })?,
            elements: query_all(
                conn,
                &format!(
                    "SELECT {ELEMENT_COLUMNS} FROM change_set_elements
                     ORDER BY change_set_id, entity_id, schema_key, file_id"
                ),
                [],
                read_element,
            )?,
            edges: self.get_edges()?,
            commits: query_all(
                conn,
                &format!("SELECT {COMMIT_COLUMNS} FROM commits ORDER BY id"),
                [],
                read_commit,
            )?,
            labels: query_all(
                conn,
                "SELECT commit_id, label FROM commit_labels ORDER BY commit_id, label",
                [],
                |row| Ok((CommitId::from_bytes(col(row, 0, "commit id")?), row.get(1)?)),
            )?,
            versions: self.list_versions()?,
            conflicts: query_all(
                conn,
                &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts ORDER BY id"),
                [],
                read_conflict,
            )?,
            version_conflicts: query_all(
                conn,
                "SELECT version_id, conflict_id FROM version_conflicts ORDER BY version_id, conflict_id",
                [],
                |row| {
                    Ok((
                        VersionId::from_bytes(col(row, 0, "version id")?),
                        ConflictId::from_bytes(col(row, 1, "conflict id")?),
                    ))
                },
            )?,
            merge_intents: query_all(
                conn,
                "SELECT source_version_id, target_version_id, source_change_set_id, recorded_at
                 FROM merge_intents ORDER BY source_version_id, target_version_id",
                [],
                read_merge_intent,
            )?,
            cache: if include_cache {
                Some(self.export_cache()?)
            } else {
                None
            },
        };
        debug!(
            changes = image.changes.len(),
            commits = image.commits.len(),
            include_cache,
            "exported store image"
        );
        Ok(image)
    }

    fn export_cache(&self) -> Result<CacheImage, StorageError> {
        let meta = query_all(
            self.conn(),
            "SELECT schema_key, version_id, chain FROM cache_meta ORDER BY schema_key, version_id",
            [],
            |row| {
                let chain: Vec<u8> = row.get(2)?;
                Ok(CacheMetaEntry {
                    schema_key: row.get(0)?,
                    version_id: VersionId::from_bytes(col(row, 1, "version id")?),
                    chain: rmp_serde::from_slice(&chain)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                })
            },
        )?;
        let mut rows = Vec::new();
        for schema_key in self.cached_schemas()? {
            rows.extend(self.cache_rows(&schema_key)?);
        }
        Ok(CacheImage { meta, rows })
    }

    /// Replaces the whole store with `image`. Without a cache section the
    /// cache starts empty and is rebuilt on first read.
    pub fn import_image(&mut self, image: &StoreImage) -> Result<(), StorageError> {
        self.drop_cache(None)?;
        self.with_savepoint(|conn| {
            conn.execute_batch(
                "DELETE FROM version_conflicts;
                 DELETE FROM merge_intents;
                 DELETE FROM conflicts;
                 DELETE FROM versions;
                 DELETE FROM commit_labels;
                 DELETE FROM commits;
                 DELETE FROM change_edges;
                 DELETE FROM change_set_elements;
                 DELETE FROM change_sets;
                 DELETE FROM changes;
                 DELETE FROM snapshots;",
            )?;

            for (id, content) in &image.snapshots {
                conn.execute(
                    "INSERT INTO snapshots (id, content) VALUES (?1, ?2)",
                    rusqlite::params![id.as_bytes().as_slice(), content],
                )?;
            }
            for change in &image.changes {
                conn.execute(
                    &format!("INSERT INTO changes ({CHANGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                    rusqlite::params![
                        change.id.as_bytes().as_slice(),
                        change.entity_id,
                        change.schema_key,
                        change.schema_version,
                        change.file_id,
                        change.plugin_key,
                        change.snapshot_id.as_bytes().as_slice(),
                        &change.created_at.to_bytes()[..],
                    ],
                )?;
            }
            for change_set in &image.change_sets {
                conn.execute(
                    "INSERT INTO change_sets (id, immutable) VALUES (?1, ?2)",
                    rusqlite::params![change_set.id.as_bytes().as_slice(), change_set.immutable],
                )?;
            }
            for element in &image.elements {
                conn.execute(
                    &format!("INSERT INTO change_set_elements ({ELEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                    rusqlite::params![
                        element.change_set_id.as_bytes().as_slice(),
                        element.entity_id,
                        element.schema_key,
                        element.file_id,
                        element.change_id.as_bytes().as_slice(),
                    ],
                )?;
            }
            for edge in &image.edges {
                conn.execute(
                    "INSERT INTO change_edges (parent_id, child_id) VALUES (?1, ?2)",
                    rusqlite::params![edge.parent_id.as_bytes().as_slice(), edge.child_id.as_bytes().as_slice()],
                )?;
            }
            for commit in &image.commits {
                conn.execute(
                    &format!("INSERT INTO commits ({COMMIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                    rusqlite::params![
                        commit.id.as_bytes().as_slice(),
                        commit.change_set_id.as_bytes().as_slice(),
                        commit.author,
                        &commit.created_at.to_bytes()[..],
                        commit.description,
                    ],
                )?;
            }
            for (commit_id, label) in &image.labels {
                conn.execute(
                    "INSERT INTO commit_labels (commit_id, label) VALUES (?1, ?2)",
                    rusqlite::params![commit_id.as_bytes().as_slice(), label],
                )?;
            }

            // Parents before children so the inheritance reference always resolves.
            let mut inserted = BTreeSet::new();
            let mut pending: Vec<&Version> = image.versions.iter().collect();
            while !pending.is_empty() {
                let before = pending.len();
                let mut rest = Vec::new();
                for version in pending {
                    let ready = version
                        .inherits_from
                        .is_none_or(|parent| inserted.contains(&parent));
                    if !ready {
                        rest.push(version);
                        continue;
                    }
                    conn.execute(
                        &format!("INSERT INTO versions ({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                        rusqlite::params![
                            version.id.as_bytes().as_slice(),
                            version.name,
                            version.change_set_id.as_bytes().as_slice(),
                            version.working_change_set_id.as_bytes().as_slice(),
                            version.inherits_from.map(|v| v.as_bytes().to_vec()),
                        ],
                    )?;
                    inserted.insert(version.id);
                }
                if rest.len() == before {
                    return Err(StorageError::BadImage(
                        "version inheritance references a missing or cyclic parent".into(),
                    ));
                }
                pending = rest;
            }

            for conflict in &image.conflicts {
                let change_ids = rmp_serde::to_vec(&conflict.conflicting_change_ids)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                conn.execute(
                    &format!(
                        "INSERT INTO conflicts ({CONFLICT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                    ),
                    rusqlite::params![
                        conflict.id.as_bytes().as_slice(),
                        conflict.key,
                        conflict.entity.entity_id,
                        conflict.entity.schema_key,
                        conflict.entity.file_id,
                        change_ids,
                        conflict.status.as_str(),
                        &conflict.detected_at.to_bytes()[..],
                        conflict.resolved_change_id.map(|c| c.as_bytes().to_vec()),
                        conflict.resolved_at.map(|h: Hlc| h.to_bytes().to_vec()),
                    ],
                )?;
            }
            for (version_id, conflict_id) in &image.version_conflicts {
                conn.execute(
                    "INSERT INTO version_conflicts (version_id, conflict_id) VALUES (?1, ?2)",
                    rusqlite::params![version_id.as_bytes().as_slice(), conflict_id.as_bytes().as_slice()],
                )?;
            }
            for intent in &image.merge_intents {
                conn.execute(
                    "INSERT INTO merge_intents (source_version_id, target_version_id, source_change_set_id, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        intent.source_version_id.as_bytes().as_slice(),
                        intent.target_version_id.as_bytes().as_slice(),
                        intent.source_change_set_id.as_bytes().as_slice(),
                        &intent.recorded_at.to_bytes()[..],
                    ],
                )?;
            }
            Ok(())
        })?;

        if let Some(cache) = &image.cache {
            let mut by_schema: std::collections::BTreeMap<&str, Vec<StateRow>> = Default::default();
            for row in &cache.rows {
                by_schema.entry(row.schema_key.as_str()).or_default().push(row.clone());
            }
            for (schema_key, rows) in by_schema {
                self.insert_cache_rows(schema_key, &rows)?;
            }
            for entry in &cache.meta {
                self.set_cache_meta(&entry.schema_key, entry.version_id, &entry.chain)?;
            }
        }

        info!(
            changes = image.changes.len(),
            versions = image.versions.len(),
            with_cache = image.cache.is_some(),
            "imported store image"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_checked() {
        let image = StoreImage::default();
        let mut bytes = encode_image(&image).unwrap();
        assert_eq!(&bytes[..4], IMAGE_MAGIC);
        assert_eq!(decode_image(&bytes).unwrap(), image);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode_image(&bytes), Err(StorageError::BadImage(_))));
        assert!(matches!(decode_image(b"NOPE"), Err(StorageError::BadImage(_))));
    }

    #[test]
    fn empty_store_roundtrip() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let image = store.export_image(true).unwrap();
        let mut other = SqliteStorage::open_in_memory().unwrap();
        other.import_image(&image).unwrap();
        assert_eq!(other.export_image(true).unwrap(), image);
    }
}
