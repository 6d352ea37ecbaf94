//! Per-session transaction staging.
//!
//! Staged changes already carry their final id, snapshot and timestamp; they
//! reach the log only when the transaction commits.

use std::collections::BTreeMap;

use versa_core::{
    ids::*,
    model::{Change, EntityKey},
    snapshot::Snapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StagedChange {
    pub version_id: VersionId,
    pub change: Change,
    pub snapshot: Snapshot,
}

#[derive(Debug)]
pub struct TxOverlay {
    id: TxId,
    staged: BTreeMap<(VersionId, EntityKey), (u64, StagedChange)>,
    next_seq: u64,
}

impl TxOverlay {
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            staged: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Stages a change. A later write to the same entity in the same version
    /// replaces the earlier one.
    pub fn stage(&mut self, staged: StagedChange) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.staged
            .insert((staged.version_id, staged.change.key()), (seq, staged));
    }

    pub fn get(&self, version_id: VersionId, key: &EntityKey) -> Option<&StagedChange> {
        self.staged
            .get(&(version_id, key.clone()))
            .map(|(_, staged)| staged)
    }

    /// The staged change with this id, if it is still the latest for its key.
    pub fn find(&self, change_id: ChangeId) -> Option<&StagedChange> {
        self.staged
            .values()
            .map(|(_, staged)| staged)
            .find(|staged| staged.change.id == change_id)
    }

    /// Staged keys of one schema in one version.
    pub fn keys_for_schema(&self, version_id: VersionId, schema_key: &str) -> Vec<EntityKey> {
        self.staged
            .keys()
            .filter(|(v, key)| *v == version_id && key.schema_key == schema_key)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Staged changes in the order their final write was issued.
    pub fn into_ordered(self) -> Vec<StagedChange> {
        let mut entries: Vec<(u64, StagedChange)> = self.staged.into_values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, staged)| staged).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use versa_core::{clock::Hlc, id_service::IdService};

    fn staged(ids: &mut IdService, version: VersionId, entity: &str, v: i64) -> StagedChange {
        let snapshot = Snapshot::new(Some(json!({ "v": v }))).unwrap();
        StagedChange {
            version_id: version,
            change: Change {
                id: ids.change_id(),
                entity_id: entity.into(),
                schema_key: "todo".into(),
                schema_version: "1".into(),
                file_id: "f".into(),
                plugin_key: "test".into(),
                snapshot_id: snapshot.id,
                created_at: Hlc::new(1, 0),
            },
            snapshot,
        }
    }

    #[test]
    fn latest_write_wins_and_keeps_issue_order() {
        let mut ids = IdService::deterministic();
        let v = ids.version_id();
        let mut tx = TxOverlay::new(ids.tx_id());
        tx.stage(staged(&mut ids, v, "a", 1));
        tx.stage(staged(&mut ids, v, "b", 1));
        tx.stage(staged(&mut ids, v, "a", 2));
        assert_eq!(tx.len(), 2);

        let key_a = EntityKey::new("a", "todo", "f");
        let a = tx.get(v, &key_a).unwrap();
        assert_eq!(a.snapshot.content, Some(json!({"v": 2})));
        assert!(tx.find(a.change.id).is_some());
        assert_eq!(tx.keys_for_schema(v, "todo").len(), 2);

        let order: Vec<_> = tx
            .into_ordered()
            .into_iter()
            .map(|s| s.change.entity_id)
            .collect();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }
}
