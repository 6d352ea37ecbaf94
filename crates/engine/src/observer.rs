use versa_core::{ids::*, model::EntityKey};

/// Emitted once per version commit, after the SQLite transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub version_id: VersionId,
    pub commit_id: CommitId,
    pub change_set_id: ChangeSetId,
    pub changes: Vec<EntityKey>,
}

pub trait CommitObserver {
    fn on_commit(&self, event: &CommitEvent);
}

impl<F: Fn(&CommitEvent)> CommitObserver for F {
    fn on_commit(&self, event: &CommitEvent) {
        self(event)
    }
}
