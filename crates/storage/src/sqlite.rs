use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Params, Row};
use uuid::Uuid;

use versa_core::{
    clock::Hlc,
    graph::GraphSource,
    ids::*,
    model::{
        ChangeConflict, Change, ChangeEdge, ChangeSet, ChangeSetElement, Commit, ConflictStatus,
        EntityKey, MergeIntent, Version,
    },
    snapshot::{self, Snapshot},
    CoreError,
};

use crate::error::StorageError;
use crate::traits::Storage;

/// Convert Vec<u8> to fixed-size array with proper error handling.
pub(crate) fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub(crate) fn col<const N: usize>(row: &Row, idx: usize, label: &str) -> Result<[u8; N], StorageError> {
    let bytes: Vec<u8> = row.get(idx)?;
    to_array::<N>(bytes, label)
}

pub(crate) fn col_opt<const N: usize>(
    row: &Row,
    idx: usize,
    label: &str,
) -> Result<Option<[u8; N]>, StorageError> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes.map(|b| to_array::<N>(b, label)).transpose()
}

pub(crate) fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: impl Fn(&Row) -> Result<T, StorageError>,
) -> Result<Vec<T>, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read(row)?);
    }
    Ok(out)
}

pub(crate) fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    read: impl Fn(&Row) -> Result<T, StorageError>,
) -> Result<Option<T>, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(read(row)?)),
        None => Ok(None),
    }
}

/// Maps a unique/foreign-key failure to a readable constraint violation.
fn constrained(
    result: rusqlite::Result<usize>,
    describe: impl FnOnce() -> String,
) -> Result<usize, StorageError> {
    match result {
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::ConstraintViolation(describe()))
        }
        other => Ok(other?),
    }
}

pub(crate) const CHANGE_COLUMNS: &str =
    "id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at";
pub(crate) const ELEMENT_COLUMNS: &str = "change_set_id, entity_id, schema_key, file_id, change_id";
pub(crate) const COMMIT_COLUMNS: &str = "id, change_set_id, author, created_at, description";
pub(crate) const VERSION_COLUMNS: &str =
    "id, name, change_set_id, working_change_set_id, inherits_from";
pub(crate) const CONFLICT_COLUMNS: &str = "id, conflict_key, entity_id, schema_key, file_id, change_ids, status, detected_at, resolved_change_id, resolved_at";

pub(crate) fn read_change(row: &Row) -> Result<Change, StorageError> {
    Ok(Change {
        id: ChangeId::from_bytes(col(row, 0, "change id")?),
        entity_id: row.get(1)?,
        schema_key: row.get(2)?,
        schema_version: row.get(3)?,
        file_id: row.get(4)?,
        plugin_key: row.get(5)?,
        snapshot_id: SnapshotId::from_bytes(col(row, 6, "snapshot id")?),
        created_at: Hlc::from_bytes(&col(row, 7, "created_at")?),
    })
}

pub(crate) fn read_element(row: &Row) -> Result<ChangeSetElement, StorageError> {
    Ok(ChangeSetElement {
        change_set_id: ChangeSetId::from_bytes(col(row, 0, "change set id")?),
        entity_id: row.get(1)?,
        schema_key: row.get(2)?,
        file_id: row.get(3)?,
        change_id: ChangeId::from_bytes(col(row, 4, "change id")?),
    })
}

pub(crate) fn read_commit(row: &Row) -> Result<Commit, StorageError> {
    Ok(Commit {
        id: CommitId::from_bytes(col(row, 0, "commit id")?),
        change_set_id: ChangeSetId::from_bytes(col(row, 1, "change set id")?),
        author: row.get(2)?,
        created_at: Hlc::from_bytes(&col(row, 3, "created_at")?),
        description: row.get(4)?,
    })
}

pub(crate) fn read_version(row: &Row) -> Result<Version, StorageError> {
    Ok(Version {
        id: VersionId::from_bytes(col(row, 0, "version id")?),
        name: row.get(1)?,
        change_set_id: ChangeSetId::from_bytes(col(row, 2, "change set id")?),
        working_change_set_id: ChangeSetId::from_bytes(col(row, 3, "working change set id")?),
        inherits_from: col_opt(row, 4, "inherits_from")?.map(VersionId::from_bytes),
    })
}

pub(crate) fn read_conflict(row: &Row) -> Result<ChangeConflict, StorageError> {
    let change_ids: Vec<u8> = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(ChangeConflict {
        id: ConflictId::from_bytes(col(row, 0, "conflict id")?),
        key: row.get(1)?,
        entity: EntityKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?, row.get::<_, String>(4)?),
        conflicting_change_ids: rmp_serde::from_slice(&change_ids)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        status: ConflictStatus::parse(&status)?,
        detected_at: Hlc::from_bytes(&col(row, 7, "detected_at")?),
        resolved_change_id: col_opt(row, 8, "resolved change id")?.map(ChangeId::from_bytes),
        resolved_at: col_opt(row, 9, "resolved_at")?.map(|b| Hlc::from_bytes(&b)),
    })
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside its own SAVEPOINT: an error undoes everything `f` wrote
    /// through this storage, inside or outside an outer transaction.
    pub fn in_savepoint<T, E: From<StorageError>>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        self.conn
            .execute_batch("SAVEPOINT versa_step")
            .map_err(StorageError::from)?;
        match f() {
            Ok(value) => {
                self.conn
                    .execute_batch("RELEASE versa_step")
                    .map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK TO versa_step; RELEASE versa_step");
                Err(e)
            }
        }
    }

    /// Runs `f` inside a SAVEPOINT so multi-statement helpers stay atomic and
    /// still nest inside an outer `BEGIN IMMEDIATE`.
    pub(crate) fn with_savepoint<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.conn.execute_batch("SAVEPOINT versa_sp")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE versa_sp")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK TO versa_sp; RELEASE versa_sp");
                Err(e)
            }
        }
    }
}

fn ensure_mutable(conn: &Connection, id: ChangeSetId) -> Result<(), StorageError> {
    let immutable: Option<bool> = conn
        .query_row(
            "SELECT immutable FROM change_sets WHERE id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
            |r| r.get(0),
        )
        .optional()?;
    match immutable {
        None => Err(StorageError::MissingReference(format!("change set {id}"))),
        Some(true) => Err(StorageError::ImmutableChangeSet(id.to_string())),
        Some(false) => Ok(()),
    }
}

/// The element must point at an existing change of the same entity.
fn ensure_element_target(conn: &Connection, element: &ChangeSetElement) -> Result<(), StorageError> {
    let found: Option<(String, String, String)> = conn
        .query_row(
            "SELECT entity_id, schema_key, file_id FROM changes WHERE id = ?1",
            rusqlite::params![element.change_id.as_bytes().as_slice()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    match found {
        None => Err(StorageError::MissingReference(format!("change {}", element.change_id))),
        Some((entity_id, schema_key, file_id))
            if entity_id != element.entity_id
                || schema_key != element.schema_key
                || file_id != element.file_id =>
        {
            Err(StorageError::ConstraintViolation(format!(
                "change {} does not belong to {}",
                element.change_id,
                element.key()
            )))
        }
        Some(_) => Ok(()),
    }
}

fn insert_element(conn: &Connection, element: &ChangeSetElement) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO change_set_elements (change_set_id, entity_id, schema_key, file_id, change_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (change_set_id, entity_id, schema_key, file_id)
         DO UPDATE SET change_id = excluded.change_id",
        rusqlite::params![
            element.change_set_id.as_bytes().as_slice(),
            element.entity_id,
            element.schema_key,
            element.file_id,
            element.change_id.as_bytes().as_slice(),
        ],
    )?;
    Ok(())
}

impl Storage for SqliteStorage {
    fn put_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let Some(bytes) = snapshot.canonical_bytes()? else {
            return Ok(());
        };
        self.conn.execute(
            "INSERT OR IGNORE INTO snapshots (id, content) VALUES (?1, ?2)",
            rusqlite::params![snapshot.id.as_bytes().as_slice(), bytes],
        )?;
        Ok(())
    }

    fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StorageError> {
        if id.is_no_content() {
            return Ok(Snapshot::tombstone());
        }
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT content FROM snapshots WHERE id = ?1",
                rusqlite::params![id.as_bytes().as_slice()],
                |r| r.get(0),
            )
            .optional()?;
        let bytes = bytes.ok_or_else(|| StorageError::NotFound(format!("snapshot {id}")))?;
        Ok(Snapshot {
            id,
            content: Some(snapshot::parse_content(&bytes)?),
        })
    }

    fn insert_change(&mut self, change: &Change) -> Result<(), StorageError> {
        if !change.snapshot_id.is_no_content() {
            let stored: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM snapshots WHERE id = ?1",
                    rusqlite::params![change.snapshot_id.as_bytes().as_slice()],
                    |r| r.get(0),
                )
                .optional()?;
            if stored.is_none() {
                return Err(StorageError::MissingReference(format!("snapshot {}", change.snapshot_id)));
            }
        }
        constrained(
            self.conn.execute(
                "INSERT INTO changes (id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
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
            ),
            || format!("change {} already exists", change.id),
        )?;
        Ok(())
    }

    fn get_change(&self, id: ChangeId) -> Result<Option<Change>, StorageError> {
        query_one(
            &self.conn,
            &format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id = ?1"),
            rusqlite::params![id.as_bytes().as_slice()],
            read_change,
        )
    }

    fn change_count(&self) -> Result<u64, StorageError> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM changes", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn create_change_set(
        &mut self,
        change_set: &ChangeSet,
        elements: &[ChangeSetElement],
    ) -> Result<(), StorageError> {
        let mut seen = BTreeSet::new();
        for element in elements {
            if element.change_set_id != change_set.id {
                return Err(StorageError::ConstraintViolation(format!(
                    "element for {} belongs to change set {}",
                    element.key(),
                    element.change_set_id
                )));
            }
            if !seen.insert(element.key()) {
                return Err(StorageError::DuplicatePointer {
                    change_set_id: change_set.id.to_string(),
                    entity: element.key().to_string(),
                });
            }
        }

        self.with_savepoint(|conn| {
            constrained(
                conn.execute(
                    "INSERT INTO change_sets (id, immutable) VALUES (?1, ?2)",
                    rusqlite::params![change_set.id.as_bytes().as_slice(), change_set.immutable],
                ),
                || format!("change set {} already exists", change_set.id),
            )?;
            for element in elements {
                ensure_element_target(conn, element)?;
                insert_element(conn, element)?;
            }
            Ok(())
        })
    }

    fn get_change_set(&self, id: ChangeSetId) -> Result<Option<ChangeSet>, StorageError> {
        query_one(
            &self.conn,
            "SELECT id, immutable FROM change_sets WHERE id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
            |row| {
                Ok(ChangeSet {
                    id: ChangeSetId::from_bytes(col(row, 0, "change set id")?),
                    immutable: row.get(1)?,
                })
            },
        )
    }

    fn upsert_element(&mut self, element: &ChangeSetElement) -> Result<(), StorageError> {
        self.with_savepoint(|conn| {
            ensure_mutable(conn, element.change_set_id)?;
            ensure_element_target(conn, element)?;
            insert_element(conn, element)
        })
    }

    fn remove_element(&mut self, change_set_id: ChangeSetId, key: &EntityKey) -> Result<(), StorageError> {
        ensure_mutable(&self.conn, change_set_id)?;
        self.conn.execute(
            "DELETE FROM change_set_elements
             WHERE change_set_id = ?1 AND entity_id = ?2 AND schema_key = ?3 AND file_id = ?4",
            rusqlite::params![
                change_set_id.as_bytes().as_slice(),
                key.entity_id,
                key.schema_key,
                key.file_id,
            ],
        )?;
        Ok(())
    }

    fn get_element(
        &self,
        change_set_id: ChangeSetId,
        key: &EntityKey,
    ) -> Result<Option<ChangeSetElement>, StorageError> {
        query_one(
            &self.conn,
            &format!(
                "SELECT {ELEMENT_COLUMNS} FROM change_set_elements
                 WHERE change_set_id = ?1 AND entity_id = ?2 AND schema_key = ?3 AND file_id = ?4"
            ),
            rusqlite::params![
                change_set_id.as_bytes().as_slice(),
                key.entity_id,
                key.schema_key,
                key.file_id,
            ],
            read_element,
        )
    }

    fn get_elements(&self, change_set_id: ChangeSetId) -> Result<Vec<ChangeSetElement>, StorageError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {ELEMENT_COLUMNS} FROM change_set_elements WHERE change_set_id = ?1
                 ORDER BY entity_id, schema_key, file_id"
            ),
            rusqlite::params![change_set_id.as_bytes().as_slice()],
            read_element,
        )
    }

    fn elements_for_key(&self, key: &EntityKey) -> Result<Vec<ChangeSetElement>, StorageError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {ELEMENT_COLUMNS} FROM change_set_elements
                 WHERE schema_key = ?1 AND file_id = ?2 AND entity_id = ?3
                 ORDER BY change_set_id"
            ),
            rusqlite::params![key.schema_key, key.file_id, key.entity_id],
            read_element,
        )
    }

    fn elements_for_schema(&self, schema_key: &str) -> Result<Vec<ChangeSetElement>, StorageError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {ELEMENT_COLUMNS} FROM change_set_elements WHERE schema_key = ?1
                 ORDER BY change_set_id, entity_id, file_id"
            ),
            rusqlite::params![schema_key],
            read_element,
        )
    }

    fn insert_commit(&mut self, commit: &Commit, parents: &[ChangeSetId]) -> Result<(), StorageError> {
        self.with_savepoint(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM change_sets WHERE id = ?1",
                    rusqlite::params![commit.change_set_id.as_bytes().as_slice()],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StorageError::MissingReference(format!(
                    "change set {}",
                    commit.change_set_id
                )));
            }
            if commit_of(conn, commit.change_set_id)?.is_some() {
                return Err(StorageError::AlreadyCommitted(commit.change_set_id.to_string()));
            }
            for parent in parents {
                if *parent == commit.change_set_id {
                    return Err(CoreError::CyclicAncestry(format!(
                        "change set {parent} cannot be its own parent"
                    ))
                    .into());
                }
                if commit_of(conn, *parent)?.is_none() {
                    return Err(StorageError::MissingReference(format!(
                        "parent change set {parent} is not committed"
                    )));
                }
            }

            constrained(
                conn.execute(
                    "INSERT INTO commits (id, change_set_id, author, created_at, description)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        commit.id.as_bytes().as_slice(),
                        commit.change_set_id.as_bytes().as_slice(),
                        commit.author,
                        &commit.created_at.to_bytes()[..],
                        commit.description,
                    ],
                ),
                || format!("commit {} already exists", commit.id),
            )?;
            conn.execute(
                "UPDATE change_sets SET immutable = 1 WHERE id = ?1",
                rusqlite::params![commit.change_set_id.as_bytes().as_slice()],
            )?;
            for parent in parents {
                conn.execute(
                    "INSERT OR IGNORE INTO change_edges (parent_id, child_id) VALUES (?1, ?2)",
                    rusqlite::params![
                        parent.as_bytes().as_slice(),
                        commit.change_set_id.as_bytes().as_slice(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn get_commit(&self, id: CommitId) -> Result<Option<Commit>, StorageError> {
        query_one(
            &self.conn,
            &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE id = ?1"),
            rusqlite::params![id.as_bytes().as_slice()],
            read_commit,
        )
    }

    fn commit_for_change_set(&self, change_set_id: ChangeSetId) -> Result<Option<Commit>, StorageError> {
        commit_of(&self.conn, change_set_id)
    }

    fn get_edges(&self) -> Result<Vec<ChangeEdge>, StorageError> {
        query_all(
            &self.conn,
            "SELECT parent_id, child_id FROM change_edges ORDER BY child_id, parent_id",
            [],
            |row| {
                Ok(ChangeEdge {
                    parent_id: ChangeSetId::from_bytes(col(row, 0, "parent id")?),
                    child_id: ChangeSetId::from_bytes(col(row, 1, "child id")?),
                })
            },
        )
    }

    fn add_label(&mut self, commit_id: CommitId, label: &str) -> Result<(), StorageError> {
        constrained(
            self.conn.execute(
                "INSERT OR IGNORE INTO commit_labels (commit_id, label) VALUES (?1, ?2)",
                rusqlite::params![commit_id.as_bytes().as_slice(), label],
            ),
            || format!("commit {commit_id} does not exist"),
        )?;
        Ok(())
    }

    fn has_label(&self, commit_id: CommitId, label: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM commit_labels WHERE commit_id = ?1 AND label = ?2",
                rusqlite::params![commit_id.as_bytes().as_slice(), label],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn commits_with_label(&self, label: &str) -> Result<Vec<Commit>, StorageError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {} FROM commits c JOIN commit_labels l ON l.commit_id = c.id
                 WHERE l.label = ?1 ORDER BY c.created_at, c.id",
                COMMIT_COLUMNS
                    .split(", ")
                    .map(|c| format!("c.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            rusqlite::params![label],
            read_commit,
        )
    }

    fn insert_version(&mut self, version: &Version) -> Result<(), StorageError> {
        constrained(
            self.conn.execute(
                "INSERT INTO versions (id, name, change_set_id, working_change_set_id, inherits_from)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    version.id.as_bytes().as_slice(),
                    version.name,
                    version.change_set_id.as_bytes().as_slice(),
                    version.working_change_set_id.as_bytes().as_slice(),
                    version.inherits_from.map(|v| v.as_bytes().to_vec()),
                ],
            ),
            || format!("version {} conflicts with an existing version", version.name),
        )?;
        Ok(())
    }

    fn get_version(&self, id: VersionId) -> Result<Option<Version>, StorageError> {
        query_one(
            &self.conn,
            &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?1"),
            rusqlite::params![id.as_bytes().as_slice()],
            read_version,
        )
    }

    fn get_version_by_name(&self, name: &str) -> Result<Option<Version>, StorageError> {
        query_one(
            &self.conn,
            &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE name = ?1"),
            rusqlite::params![name],
            read_version,
        )
    }

    fn list_versions(&self) -> Result<Vec<Version>, StorageError> {
        query_all(
            &self.conn,
            &format!("SELECT {VERSION_COLUMNS} FROM versions ORDER BY id"),
            [],
            read_version,
        )
    }

    fn set_version_tip(&mut self, id: VersionId, change_set_id: ChangeSetId) -> Result<(), StorageError> {
        if commit_of(&self.conn, change_set_id)?.is_none() {
            return Err(StorageError::MissingReference(format!(
                "change set {change_set_id} is not committed"
            )));
        }
        let updated = self.conn.execute(
            "UPDATE versions SET change_set_id = ?1 WHERE id = ?2",
            rusqlite::params![change_set_id.as_bytes().as_slice(), id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("version {id}")));
        }
        Ok(())
    }

    fn set_working_change_set(&mut self, id: VersionId, change_set_id: ChangeSetId) -> Result<(), StorageError> {
        ensure_mutable(&self.conn, change_set_id)?;
        let updated = self.conn.execute(
            "UPDATE versions SET working_change_set_id = ?1 WHERE id = ?2",
            rusqlite::params![change_set_id.as_bytes().as_slice(), id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("version {id}")));
        }
        Ok(())
    }

    fn insert_conflict(&mut self, conflict: &ChangeConflict) -> Result<(), StorageError> {
        let change_ids = rmp_serde::to_vec(&conflict.conflicting_change_ids)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO conflicts (id, conflict_key, entity_id, schema_key, file_id, change_ids, status, detected_at, resolved_change_id, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
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
                conflict.resolved_at.map(|h| h.to_bytes().to_vec()),
            ],
        )?;
        Ok(())
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ChangeConflict>, StorageError> {
        query_one(
            &self.conn,
            &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
            rusqlite::params![id.as_bytes().as_slice()],
            read_conflict,
        )
    }

    fn find_open_conflict(
        &self,
        conflict_key: &str,
        change_ids: &[ChangeId],
    ) -> Result<Option<ChangeConflict>, StorageError> {
        let open = query_all(
            &self.conn,
            &format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts
                 WHERE conflict_key = ?1 AND status = 'open' ORDER BY id"
            ),
            rusqlite::params![conflict_key],
            read_conflict,
        )?;
        Ok(open
            .into_iter()
            .find(|c| c.conflicting_change_ids.as_slice() == change_ids))
    }

    fn attach_conflict(&mut self, version_id: VersionId, conflict_id: ConflictId) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO version_conflicts (version_id, conflict_id) VALUES (?1, ?2)",
            rusqlite::params![version_id.as_bytes().as_slice(), conflict_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    fn conflicts_for_version(&self, version_id: VersionId) -> Result<Vec<ChangeConflict>, StorageError> {
        query_all(
            &self.conn,
            &format!(
                "SELECT {} FROM conflicts c
                 JOIN version_conflicts vc ON vc.conflict_id = c.id
                 WHERE vc.version_id = ?1
                 ORDER BY c.detected_at, c.id",
                CONFLICT_COLUMNS
                    .split(", ")
                    .map(|c| format!("c.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            rusqlite::params![version_id.as_bytes().as_slice()],
            read_conflict,
        )
    }

    fn mark_conflict_resolved(
        &mut self,
        id: ConflictId,
        winner: ChangeId,
        resolved_at: Hlc,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE conflicts SET status = 'resolved', resolved_change_id = ?1, resolved_at = ?2
             WHERE id = ?3 AND status = 'open'",
            rusqlite::params![
                winner.as_bytes().as_slice(),
                &resolved_at.to_bytes()[..],
                id.as_bytes().as_slice(),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("open conflict {id}")));
        }
        Ok(())
    }

    fn upsert_merge_intent(&mut self, intent: &MergeIntent) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO merge_intents (source_version_id, target_version_id, source_change_set_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (source_version_id, target_version_id)
             DO UPDATE SET source_change_set_id = excluded.source_change_set_id,
                           recorded_at = excluded.recorded_at",
            rusqlite::params![
                intent.source_version_id.as_bytes().as_slice(),
                intent.target_version_id.as_bytes().as_slice(),
                intent.source_change_set_id.as_bytes().as_slice(),
                &intent.recorded_at.to_bytes()[..],
            ],
        )?;
        Ok(())
    }

    fn get_merge_intent(
        &self,
        source: VersionId,
        target: VersionId,
    ) -> Result<Option<MergeIntent>, StorageError> {
        query_one(
            &self.conn,
            "SELECT source_version_id, target_version_id, source_change_set_id, recorded_at
             FROM merge_intents WHERE source_version_id = ?1 AND target_version_id = ?2",
            rusqlite::params![source.as_bytes().as_slice(), target.as_bytes().as_slice()],
            read_merge_intent,
        )
    }

    fn id_watermark(&self) -> Result<(Option<Uuid>, Option<Hlc>), StorageError> {
        let highest: Option<Vec<u8>> = self.conn.query_row(
            "SELECT MAX(id) FROM (
                SELECT id FROM changes
                UNION ALL SELECT id FROM change_sets
                UNION ALL SELECT id FROM commits
                UNION ALL SELECT id FROM versions
                UNION ALL SELECT id FROM conflicts
            )",
            [],
            |r| r.get(0),
        )?;
        let latest: Option<Vec<u8>> = self.conn.query_row(
            "SELECT MAX(t) FROM (
                SELECT created_at AS t FROM changes
                UNION ALL SELECT created_at FROM commits
                UNION ALL SELECT detected_at FROM conflicts
                UNION ALL SELECT resolved_at FROM conflicts WHERE resolved_at IS NOT NULL
                UNION ALL SELECT recorded_at FROM merge_intents
            )",
            [],
            |r| r.get(0),
        )?;
        let highest = highest
            .map(|b| to_array::<16>(b, "id").map(Uuid::from_bytes))
            .transpose()?;
        let latest = latest
            .map(|b| to_array::<12>(b, "timestamp").map(|a| Hlc::from_bytes(&a)))
            .transpose()?;
        Ok((highest, latest))
    }
}

pub(crate) fn read_merge_intent(row: &Row) -> Result<MergeIntent, StorageError> {
    Ok(MergeIntent {
        source_version_id: VersionId::from_bytes(col(row, 0, "source version id")?),
        target_version_id: VersionId::from_bytes(col(row, 1, "target version id")?),
        source_change_set_id: ChangeSetId::from_bytes(col(row, 2, "source change set id")?),
        recorded_at: Hlc::from_bytes(&col(row, 3, "recorded_at")?),
    })
}

fn commit_of(conn: &Connection, change_set_id: ChangeSetId) -> Result<Option<Commit>, StorageError> {
    query_one(
        conn,
        &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE change_set_id = ?1"),
        rusqlite::params![change_set_id.as_bytes().as_slice()],
        read_commit,
    )
}

impl GraphSource for SqliteStorage {
    type Error = StorageError;

    fn parents(&self, id: ChangeSetId) -> Result<Vec<ChangeSetId>, StorageError> {
        query_all(
            &self.conn,
            "SELECT parent_id FROM change_edges WHERE child_id = ?1 ORDER BY parent_id",
            rusqlite::params![id.as_bytes().as_slice()],
            |row| Ok(ChangeSetId::from_bytes(col(row, 0, "parent id")?)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use versa_core::graph;
    use versa_core::id_service::IdService;

    struct Fixture {
        store: SqliteStorage,
        ids: IdService,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: SqliteStorage::open_in_memory().unwrap(),
                ids: IdService::deterministic(),
            }
        }

        fn change(&mut self, entity: &str, content: Option<serde_json::Value>) -> Change {
            let snapshot = Snapshot::new(content).unwrap();
            self.store.put_snapshot(&snapshot).unwrap();
            let change = Change {
                id: self.ids.change_id(),
                entity_id: entity.into(),
                schema_key: "todo".into(),
                schema_version: "1".into(),
                file_id: "f".into(),
                plugin_key: "test".into(),
                snapshot_id: snapshot.id,
                created_at: self.ids.now().unwrap(),
            };
            self.store.insert_change(&change).unwrap();
            change
        }

        fn committed(&mut self, changes: &[&Change], parents: &[ChangeSetId]) -> ChangeSetId {
            let cs = ChangeSet {
                id: self.ids.change_set_id(),
                immutable: false,
            };
            let elements: Vec<_> = changes
                .iter()
                .map(|c| ChangeSetElement::new(cs.id, &c.key(), c.id))
                .collect();
            self.store.create_change_set(&cs, &elements).unwrap();
            let commit = Commit {
                id: self.ids.commit_id(),
                change_set_id: cs.id,
                author: "tester".into(),
                created_at: self.ids.now().unwrap(),
                description: String::new(),
            };
            self.store.insert_commit(&commit, parents).unwrap();
            cs.id
        }
    }

    #[test]
    fn snapshots_are_deduplicated() {
        let mut f = Fixture::new();
        let a = f.change("t1", Some(json!({"title": "same"})));
        let b = f.change("t2", Some(json!({"title": "same"})));
        assert_eq!(a.snapshot_id, b.snapshot_id);
        let n: i64 = f
            .store
            .conn()
            .query_row("SELECT count(*) FROM snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        let back = f.store.get_snapshot(a.snapshot_id).unwrap();
        assert_eq!(back.content, Some(json!({"title": "same"})));
    }

    #[test]
    fn tombstones_are_never_stored() {
        let mut f = Fixture::new();
        let t = f.change("t1", None);
        assert!(t.is_tombstone());
        assert!(f.store.get_snapshot(t.snapshot_id).unwrap().is_tombstone());
        assert_eq!(f.store.get_change(t.id).unwrap(), Some(t));
    }

    #[test]
    fn change_requires_stored_snapshot() {
        let mut f = Fixture::new();
        let change = Change {
            id: f.ids.change_id(),
            entity_id: "t1".into(),
            schema_key: "todo".into(),
            schema_version: "1".into(),
            file_id: "f".into(),
            plugin_key: "test".into(),
            snapshot_id: SnapshotId::from_bytes([9; 32]),
            created_at: f.ids.now().unwrap(),
        };
        assert!(matches!(
            f.store.insert_change(&change),
            Err(StorageError::MissingReference(_))
        ));
    }

    #[test]
    fn duplicate_pointer_is_rejected() {
        let mut f = Fixture::new();
        let a = f.change("t1", Some(json!({"v": 1})));
        let b = f.change("t1", Some(json!({"v": 2})));
        let cs = ChangeSet {
            id: f.ids.change_set_id(),
            immutable: false,
        };
        let elements = vec![
            ChangeSetElement::new(cs.id, &a.key(), a.id),
            ChangeSetElement::new(cs.id, &b.key(), b.id),
        ];
        let err = f.store.create_change_set(&cs, &elements).unwrap_err();
        assert!(matches!(err, StorageError::DuplicatePointer { .. }));
        assert!(f.store.get_change_set(cs.id).unwrap().is_none());
    }

    #[test]
    fn unknown_change_rolls_back_change_set() {
        let mut f = Fixture::new();
        let cs = ChangeSet {
            id: f.ids.change_set_id(),
            immutable: false,
        };
        let key = EntityKey::new("ghost", "todo", "f");
        let elements = vec![ChangeSetElement::new(cs.id, &key, f.ids.change_id())];
        assert!(matches!(
            f.store.create_change_set(&cs, &elements),
            Err(StorageError::MissingReference(_))
        ));
        assert!(f.store.get_change_set(cs.id).unwrap().is_none());
    }

    #[test]
    fn committed_change_sets_are_frozen() {
        let mut f = Fixture::new();
        let a = f.change("t1", Some(json!({"v": 1})));
        let root = f.committed(&[&a], &[]);
        assert!(f.store.get_change_set(root).unwrap().unwrap().immutable);

        let b = f.change("t1", Some(json!({"v": 2})));
        let err = f
            .store
            .upsert_element(&ChangeSetElement::new(root, &b.key(), b.id))
            .unwrap_err();
        assert!(matches!(err, StorageError::ImmutableChangeSet(_)));

        let again = Commit {
            id: f.ids.commit_id(),
            change_set_id: root,
            author: "tester".into(),
            created_at: f.ids.now().unwrap(),
            description: String::new(),
        };
        assert!(matches!(
            f.store.insert_commit(&again, &[]),
            Err(StorageError::AlreadyCommitted(_))
        ));
    }

    #[test]
    fn commit_rejects_uncommitted_parent() {
        let mut f = Fixture::new();
        let loose = ChangeSet {
            id: f.ids.change_set_id(),
            immutable: false,
        };
        f.store.create_change_set(&loose, &[]).unwrap();
        let child = ChangeSet {
            id: f.ids.change_set_id(),
            immutable: false,
        };
        f.store.create_change_set(&child, &[]).unwrap();
        let commit = Commit {
            id: f.ids.commit_id(),
            change_set_id: child.id,
            author: "tester".into(),
            created_at: f.ids.now().unwrap(),
            description: String::new(),
        };
        assert!(matches!(
            f.store.insert_commit(&commit, &[loose.id]),
            Err(StorageError::MissingReference(_))
        ));
        assert!(f.store.commit_for_change_set(child.id).unwrap().is_none());
    }

    #[test]
    fn graph_queries_over_sqlite() {
        let mut f = Fixture::new();
        let a = f.change("t1", Some(json!({"v": 1})));
        let root = f.committed(&[&a], &[]);
        let left = f.committed(&[], &[root]);
        let right = f.committed(&[], &[root]);
        let merged = f.committed(&[], &[left, right]);

        assert!(graph::is_ancestor_of(&f.store, root, merged).unwrap());
        assert_eq!(graph::merge_base(&f.store, left, right).unwrap(), Some(root));
        assert_eq!(graph::ancestors(&f.store, merged).unwrap().len(), 4);
        assert_eq!(f.store.get_edges().unwrap().len(), 4);
    }

    #[test]
    fn version_names_are_unique() {
        let mut f = Fixture::new();
        let root = f.committed(&[], &[]);
        let working = ChangeSet {
            id: f.ids.change_set_id(),
            immutable: false,
        };
        f.store.create_change_set(&working, &[]).unwrap();
        let version = Version {
            id: f.ids.version_id(),
            name: "main".into(),
            change_set_id: root,
            working_change_set_id: working.id,
            inherits_from: None,
        };
        f.store.insert_version(&version).unwrap();
        let mut clash = version.clone();
        clash.id = f.ids.version_id();
        assert!(matches!(
            f.store.insert_version(&clash),
            Err(StorageError::ConstraintViolation(_))
        ));
        assert_eq!(f.store.get_version_by_name("main").unwrap(), Some(version));
    }

    #[test]
    fn open_conflict_lookup_matches_change_ids() {
        let mut f = Fixture::new();
        let a = f.change("doc1", Some(json!({"v": 1})));
        let b = f.change("doc1", Some(json!({"v": 2})));
        let conflict = ChangeConflict {
            id: f.ids.conflict_id(),
            key: "diverging:todo:f:doc1".into(),
            entity: a.key(),
            conflicting_change_ids: vec![a.id, b.id],
            status: ConflictStatus::Open,
            detected_at: f.ids.now().unwrap(),
            resolved_change_id: None,
            resolved_at: None,
        };
        f.store.insert_conflict(&conflict).unwrap();
        let found = f.store.find_open_conflict(&conflict.key, &[a.id, b.id]).unwrap();
        assert_eq!(found, Some(conflict.clone()));
        assert!(f.store.find_open_conflict(&conflict.key, &[b.id]).unwrap().is_none());

        f.store
            .mark_conflict_resolved(conflict.id, b.id, f.ids.now().unwrap())
            .unwrap();
        assert!(f.store.find_open_conflict(&conflict.key, &[a.id, b.id]).unwrap().is_none());
        let resolved = f.store.get_conflict(conflict.id).unwrap().unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolved_change_id, Some(b.id));
    }

    #[test]
    fn watermark_tracks_highest_id() {
        let mut f = Fixture::new();
        assert_eq!(f.store.id_watermark().unwrap(), (None, None));
        let a = f.change("t1", Some(json!({"v": 1})));
        let (highest, latest) = f.store.id_watermark().unwrap();
        assert_eq!(highest, Some(*a.id.as_uuid()));
        assert_eq!(latest, Some(a.created_at));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        let (change, tip) = {
            let mut f = Fixture {
                store: SqliteStorage::open(path).unwrap(),
                ids: IdService::deterministic(),
            };
            let change = f.change("t1", Some(json!({"title": "kept"})));
            let tip = f.committed(&[&change], &[]);
            (change, tip)
        };

        let store = SqliteStorage::open(path).unwrap();
        assert_eq!(store.get_change(change.id).unwrap(), Some(change.clone()));
        let set = store.get_change_set(tip).unwrap().unwrap();
        assert!(set.immutable);
        assert_eq!(store.get_elements(tip).unwrap().len(), 1);
        assert_eq!(store.id_watermark().unwrap().1, Some(change.created_at));
    }

    #[test]
    fn failed_savepoint_step_leaves_nothing_behind() {
        let mut f = Fixture::new();
        let kept = f.change("t1", Some(json!({"v": 1})));

        let result: Result<(), StorageError> = f.store.in_savepoint(|| {
            f.store.conn().execute("DELETE FROM change_set_elements", [])?;
            f.store.conn().execute("DELETE FROM changes", [])?;
            Err(StorageError::NotFound("abandoned".into()))
        });
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(f.store.get_change(kept.id).unwrap(), Some(kept.clone()));

        let count: Result<u64, StorageError> = f.store.in_savepoint(|| f.store.change_count());
        assert_eq!(count.unwrap(), 1);
    }
}
