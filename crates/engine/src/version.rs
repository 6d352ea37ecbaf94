//! Versions: named pointers into the commit graph, each with a working change
//! set that tracks what changed since its last checkpoint.

use std::collections::BTreeSet;

use tracing::{debug, info};

use versa_core::{
    graph,
    ids::*,
    model::{Change, ChangeSet, ChangeSetElement, Commit, EntityKey, Version, CHECKPOINT_LABEL},
    CoreError,
};
use versa_storage::Storage;

use crate::config::CheckpointPolicy;
use crate::error::EngineError;
use crate::observer::CommitEvent;
use crate::session::Session;
use crate::state::{self, load_change, load_version, ChainView, Lineage};
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One entry of a version's working set, classified against its checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingChange {
    pub kind: WorkingChangeKind,
    pub change: Change,
}

impl Engine {
    /// Creates a version whose history starts at `from`'s tip (the root when
    /// `None`) and which inherits from `inherits_from` (`global` when `None`).
    pub fn create_version(
        &mut self,
        name: &str,
        from: Option<VersionId>,
        inherits_from: Option<VersionId>,
    ) -> Result<Version, EngineError> {
        if self.storage.get_version_by_name(name)?.is_some() {
            return Err(EngineError::VersionExists(name.to_string()));
        }
        let tip = match from {
            Some(id) => load_version(&self.storage, id)?.change_set_id,
            None => self.anchors.root,
        };
        let parent = inherits_from.unwrap_or(self.anchors.global);
        state::version_chain(&self.storage, parent)?;

        let version = self.atomically(|engine| {
            let working = ChangeSet {
                id: engine.ids.change_set_id(),
                immutable: false,
            };
            engine.storage.create_change_set(&working, &[])?;
            let version = Version {
                id: engine.ids.version_id(),
                name: name.to_string(),
                change_set_id: tip,
                working_change_set_id: working.id,
                inherits_from: Some(parent),
            };
            engine.storage.insert_version(&version)?;
            engine.refresh_populated()?;
            Ok(version)
        })?;
        info!(version = %version.name, id = %version.id, "version created");
        Ok(version)
    }

    pub fn version(&self, id: VersionId) -> Result<Version, EngineError> {
        load_version(&self.storage, id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Version, EngineError> {
        self.storage
            .get_version_by_name(name)?
            .ok_or_else(|| EngineError::VersionNotFound(name.to_string()))
    }

    pub fn versions(&self) -> Result<Vec<Version>, EngineError> {
        Ok(self.storage.list_versions()?)
    }

    pub fn switch_version(&self, session: &mut Session, name: &str) -> Result<VersionId, EngineError> {
        let version = self.version_by_name(name)?;
        session.active_version = version.id;
        debug!(version = %version.name, "session switched version");
        Ok(version.id)
    }

    /// A session with `name` as its active version.
    pub fn session_on(&self, name: &str) -> Result<Session, EngineError> {
        let mut session = self.session();
        self.switch_version(&mut session, name)?;
        Ok(session)
    }

    /// Moves a version's committed pointer to another committed change set.
    pub fn advance(&mut self, version_id: VersionId, change_set_id: ChangeSetId) -> Result<(), EngineError> {
        let version = load_version(&self.storage, version_id)?;
        self.atomically(|engine| {
            engine.storage.set_version_tip(version_id, change_set_id)?;
            engine.reconcile_moved_tip(&version, change_set_id)?;
            engine.refresh_populated()
        })?;
        debug!(version = %version_id, tip = %change_set_id, "version advanced");
        Ok(())
    }

    /// Replaces a version's working set with a fresh empty one.
    pub fn open_working_change_set(&mut self, version_id: VersionId) -> Result<ChangeSetId, EngineError> {
        load_version(&self.storage, version_id)?;
        self.atomically(|engine| engine.replace_working_set(version_id))
    }

    fn replace_working_set(&mut self, version_id: VersionId) -> Result<ChangeSetId, EngineError> {
        let working = ChangeSet {
            id: self.ids.change_set_id(),
            immutable: false,
        };
        self.storage.create_change_set(&working, &[])?;
        self.storage.set_working_change_set(version_id, working.id)?;
        Ok(working.id)
    }

    /// Labels the version's tip commit as a checkpoint and starts an empty
    /// working set.
    pub fn create_checkpoint(&mut self, version_id: VersionId) -> Result<Commit, EngineError> {
        let version = load_version(&self.storage, version_id)?;
        let commit = self
            .storage
            .commit_for_change_set(version.change_set_id)?
            .ok_or_else(|| CoreError::InvalidData(format!("tip of {} is not committed", version.name)))?;
        self.atomically(|engine| {
            engine.storage.add_label(commit.id, CHECKPOINT_LABEL)?;
            engine.replace_working_set(version_id)?;
            Ok(())
        })?;
        info!(version = %version.name, commit = %commit.id, "checkpoint created");
        Ok(commit)
    }

    /// The version's working set, classified against its last checkpoint.
    pub fn working_changes(&self, version_id: VersionId) -> Result<Vec<WorkingChange>, EngineError> {
        let version = load_version(&self.storage, version_id)?;
        let checkpoint = self.nearest_checkpoint(version.change_set_id)?;
        let baseline = ChainView::with_head_tip(&self.storage, version_id, checkpoint)?;

        let mut out = Vec::new();
        for element in self.storage.get_elements(version.working_change_set_id)? {
            let change = load_change(&self.storage, element.change_id)?;
            let kind = if change.is_tombstone() {
                WorkingChangeKind::Deleted
            } else if baseline.resolve(&self.storage, &element.key(), None)?.is_absent() {
                WorkingChangeKind::Added
            } else {
                WorkingChangeKind::Modified
            };
            out.push(WorkingChange { kind, change });
        }
        Ok(out)
    }

    /// One change set and one commit on top of the version's tip. Must run
    /// inside an open transaction; the changes must already be in the log.
    pub(crate) fn commit_to_version(
        &mut self,
        version_id: VersionId,
        author: &str,
        description: &str,
        changes: &[Change],
    ) -> Result<CommitEvent, EngineError> {
        let version = load_version(&self.storage, version_id)?;
        let change_set = ChangeSet {
            id: self.ids.change_set_id(),
            immutable: false,
        };
        let elements: Vec<ChangeSetElement> = changes
            .iter()
            .map(|c| ChangeSetElement::new(change_set.id, &c.key(), c.id))
            .collect();
        self.storage.create_change_set(&change_set, &elements)?;

        let commit = Commit {
            id: self.ids.commit_id(),
            change_set_id: change_set.id,
            author: author.to_string(),
            created_at: self.ids.now()?,
            description: description.to_string(),
        };
        self.storage.insert_commit(&commit, &[version.change_set_id])?;
        self.storage.set_version_tip(version.id, change_set.id)?;
        self.reconcile_working_set(&version, changes)?;
        debug!(version = %version.name, commit = %commit.id, changes = changes.len(), "committed to version");

        Ok(CommitEvent {
            version_id: version.id,
            commit_id: commit.id,
            change_set_id: change_set.id,
            changes: changes.iter().map(Change::key).collect(),
        })
    }

    /// Keeps the working set equal to the net difference from the checkpoint.
    /// `version` is the state before the commit that carried `changes`.
    fn reconcile_working_set(&mut self, version: &Version, changes: &[Change]) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Ok(());
        }
        let baseline = self.working_baseline(version)?;
        for change in changes {
            self.reconcile_key(version, &baseline, &change.key(), Some(change))?;
        }
        Ok(())
    }

    /// Reconciles every entity touched between the old tip of `version` and
    /// `new_tip` against what `new_tip` now points at.
    fn reconcile_moved_tip(&mut self, version: &Version, new_tip: ChangeSetId) -> Result<(), EngineError> {
        let mut keys = BTreeSet::new();
        for change_set_id in graph::symmetric_difference(&self.storage, version.change_set_id, new_tip)? {
            for element in self.storage.get_elements(change_set_id)? {
                keys.insert(element.key());
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        let baseline = self.working_baseline(version)?;
        let lineage = Lineage::of(&self.storage, new_tip)?;
        for key in &keys {
            let current = lineage.pointer(&self.storage, key)?;
            self.reconcile_key(version, &baseline, key, current.as_ref())?;
        }
        debug!(version = %version.name, keys = keys.len(), "working set reconciled after tip move");
        Ok(())
    }

    /// The checkpoint state a working set is measured against, given the
    /// version as it was before its tip moved.
    fn working_baseline(&self, version: &Version) -> Result<ChainView, EngineError> {
        let checkpoint = match self.config.checkpoint_policy {
            CheckpointPolicy::NearestCommit => Some(version.change_set_id),
            CheckpointPolicy::NearestLabel => self.nearest_checkpoint(version.change_set_id)?,
        };
        ChainView::with_head_tip(&self.storage, version.id, checkpoint)
    }

    /// Points the working set at `current` when it differs from the baseline,
    /// otherwise drops the entry. No pointer at all also drops it.
    fn reconcile_key(
        &mut self,
        version: &Version,
        baseline: &ChainView,
        key: &EntityKey,
        current: Option<&Change>,
    ) -> Result<(), EngineError> {
        let before = baseline.resolve(&self.storage, key, None)?;
        let differs = match current {
            Some(change) if change.is_tombstone() => !before.is_absent(),
            Some(change) => before.change().map(|c| c.snapshot_id) != Some(change.snapshot_id),
            None => false,
        };
        match current {
            Some(change) if differs => {
                self.storage
                    .upsert_element(&ChangeSetElement::new(version.working_change_set_id, key, change.id))?;
            }
            _ => self.storage.remove_element(version.working_change_set_id, key)?,
        }
        Ok(())
    }

    /// Nearest commit at or below `tip` labelled as a checkpoint.
    fn nearest_checkpoint(&self, tip: ChangeSetId) -> Result<Option<ChangeSetId>, EngineError> {
        let mut ancestors: Vec<(usize, ChangeSetId)> = graph::ancestors(&self.storage, tip)?
            .into_iter()
            .map(|(id, depth)| (depth, id))
            .collect();
        ancestors.sort();
        for (_, change_set_id) in ancestors {
            if let Some(commit) = self.storage.commit_for_change_set(change_set_id)? {
                if self.storage.has_label(commit.id, CHECKPOINT_LABEL)? {
                    return Ok(Some(change_set_id));
                }
            }
        }
        Ok(None)
    }
}
