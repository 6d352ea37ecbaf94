use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Hlc;
use crate::error::CoreError;
use crate::ids::*;

/// Label attached to commits that close a working change set.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

/// The logical identity of an entity: `entity_id + schema_key + file_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.schema_key, self.file_id, self.entity_id)
    }
}

/// Everything needed to append one change; the log assigns id, snapshot and time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeInput {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub content: Option<Value>,
}

impl ChangeInput {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// One value of one entity at one point in time. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub created_at: Hlc,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_no_content()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub immutable: bool,
}

/// Current pointer of one entity inside one change set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub change_id: ChangeId,
}

impl ChangeSetElement {
    pub fn new(change_set_id: ChangeSetId, key: &EntityKey, change_id: ChangeId) -> Self {
        Self {
            change_set_id,
            entity_id: key.entity_id.clone(),
            schema_key: key.schema_key.clone(),
            file_id: key.file_id.clone(),
            change_id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeEdge {
    pub parent_id: ChangeSetId,
    pub child_id: ChangeSetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub author: String,
    pub created_at: Hlc,
    pub description: String,
}

/// A mutable branch pointer into the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    /// Last committed state.
    pub change_set_id: ChangeSetId,
    /// Mutable set of pointers changed since the last checkpoint.
    pub working_change_set_id: ChangeSetId,
    pub inherits_from: Option<VersionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Open,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            _ => Err(CoreError::InvalidData(format!("unknown conflict status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub id: ConflictId,
    /// Stable description of what conflicts, e.g. `diverging:<entity key>`.
    pub key: String,
    pub entity: EntityKey,
    pub conflicting_change_ids: Vec<ChangeId>,
    pub status: ConflictStatus,
    pub detected_at: Hlc,
    pub resolved_change_id: Option<ChangeId>,
    pub resolved_at: Option<Hlc>,
}

/// The last source state merged into a target version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeIntent {
    pub source_version_id: VersionId,
    pub target_version_id: VersionId,
    pub source_change_set_id: ChangeSetId,
    pub recorded_at: Hlc,
}

/// A derived row of the current state of one entity in one version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRow {
    pub version_id: VersionId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub schema_version: String,
    pub change_id: ChangeId,
    pub snapshot_id: SnapshotId,
    /// Set when the row is visible through an ancestor version.
    pub inherited_from: Option<VersionId>,
}

impl StateRow {
    pub fn from_change(version_id: VersionId, change: &Change, inherited_from: Option<VersionId>) -> Self {
        Self {
            version_id,
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
            schema_version: change.schema_version.clone(),
            change_id: change.id,
            snapshot_id: change.snapshot_id,
            inherited_from,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_no_content()
    }
}

/// Sort order shared by every materialized table.
pub fn sort_state_rows(rows: &mut [StateRow]) {
    rows.sort_by(|a, b| {
        a.version_id
            .cmp(&b.version_id)
            .then_with(|| a.file_id.cmp(&b.file_id))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_status_roundtrip() {
        for status in [ConflictStatus::Open, ConflictStatus::Resolved] {
            assert_eq!(ConflictStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ConflictStatus::parse("stale").is_err());
    }

    #[test]
    fn entity_key_orders_by_entity_then_schema() {
        let a = EntityKey::new("a", "todo", "f");
        let b = EntityKey::new("b", "note", "f");
        assert!(a < b);
        assert_eq!(a.to_string(), "todo:f:a");
    }
}
