use versa_core::{
    clock::Hlc,
    ids::*,
    model::{
        ChangeConflict, Change, ChangeEdge, ChangeSet, ChangeSetElement, Commit, EntityKey,
        MergeIntent, Version,
    },
    snapshot::Snapshot,
};

use crate::error::StorageError;

pub trait Storage {
    // Content store and change log. Both are append-only.

    fn put_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Returns the tombstone snapshot for [`SnapshotId::NO_CONTENT`].
    fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StorageError>;

    fn insert_change(&mut self, change: &Change) -> Result<(), StorageError>;

    fn get_change(&self, id: ChangeId) -> Result<Option<Change>, StorageError>;

    fn change_count(&self) -> Result<u64, StorageError>;

    // Change sets and the commit graph.

    /// Creates a change set with its elements. Rejects two elements for the
    /// same entity and elements pointing at unknown changes.
    fn create_change_set(
        &mut self,
        change_set: &ChangeSet,
        elements: &[ChangeSetElement],
    ) -> Result<(), StorageError>;

    fn get_change_set(&self, id: ChangeSetId) -> Result<Option<ChangeSet>, StorageError>;

    /// Sets the pointer for one entity in a mutable change set.
    fn upsert_element(&mut self, element: &ChangeSetElement) -> Result<(), StorageError>;

    fn remove_element(&mut self, change_set_id: ChangeSetId, key: &EntityKey) -> Result<(), StorageError>;

    fn get_element(
        &self,
        change_set_id: ChangeSetId,
        key: &EntityKey,
    ) -> Result<Option<ChangeSetElement>, StorageError>;

    /// Elements of one change set, ordered by entity key.
    fn get_elements(&self, change_set_id: ChangeSetId) -> Result<Vec<ChangeSetElement>, StorageError>;

    /// Every element, in any change set, that points at this entity.
    fn elements_for_key(&self, key: &EntityKey) -> Result<Vec<ChangeSetElement>, StorageError>;

    /// Every element, in any change set, of one schema.
    fn elements_for_schema(&self, schema_key: &str) -> Result<Vec<ChangeSetElement>, StorageError>;

    /// Records `commit` for its change set, freezes the change set and links it
    /// below `parents`. Parents must already be committed.
    fn insert_commit(&mut self, commit: &Commit, parents: &[ChangeSetId]) -> Result<(), StorageError>;

    fn get_commit(&self, id: CommitId) -> Result<Option<Commit>, StorageError>;

    fn commit_for_change_set(&self, change_set_id: ChangeSetId) -> Result<Option<Commit>, StorageError>;

    fn get_edges(&self) -> Result<Vec<ChangeEdge>, StorageError>;

    fn add_label(&mut self, commit_id: CommitId, label: &str) -> Result<(), StorageError>;

    fn has_label(&self, commit_id: CommitId, label: &str) -> Result<bool, StorageError>;

    fn commits_with_label(&self, label: &str) -> Result<Vec<Commit>, StorageError>;

    // Versions.

    fn insert_version(&mut self, version: &Version) -> Result<(), StorageError>;

    fn get_version(&self, id: VersionId) -> Result<Option<Version>, StorageError>;

    fn get_version_by_name(&self, name: &str) -> Result<Option<Version>, StorageError>;

    fn list_versions(&self) -> Result<Vec<Version>, StorageError>;

    /// Moves the committed pointer. The target must be committed.
    fn set_version_tip(&mut self, id: VersionId, change_set_id: ChangeSetId) -> Result<(), StorageError>;

    fn set_working_change_set(&mut self, id: VersionId, change_set_id: ChangeSetId) -> Result<(), StorageError>;

    // Conflicts and merge intents.

    fn insert_conflict(&mut self, conflict: &ChangeConflict) -> Result<(), StorageError>;

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ChangeConflict>, StorageError>;

    /// An open conflict with this key over exactly these changes.
    fn find_open_conflict(
        &self,
        conflict_key: &str,
        change_ids: &[ChangeId],
    ) -> Result<Option<ChangeConflict>, StorageError>;

    fn attach_conflict(&mut self, version_id: VersionId, conflict_id: ConflictId) -> Result<(), StorageError>;

    fn conflicts_for_version(&self, version_id: VersionId) -> Result<Vec<ChangeConflict>, StorageError>;

    fn mark_conflict_resolved(
        &mut self,
        id: ConflictId,
        winner: ChangeId,
        resolved_at: Hlc,
    ) -> Result<(), StorageError>;

    fn upsert_merge_intent(&mut self, intent: &MergeIntent) -> Result<(), StorageError>;

    fn get_merge_intent(
        &self,
        source: VersionId,
        target: VersionId,
    ) -> Result<Option<MergeIntent>, StorageError>;

    // Housekeeping.

    /// Highest stored id and latest stored timestamp, used to resume id
    /// generation after reopening a store.
    fn id_watermark(&self) -> Result<(Option<uuid::Uuid>, Option<Hlc>), StorageError>;
}
