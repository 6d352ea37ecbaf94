//! Three-way merge between versions.
//!
//! Candidates are the entities whose source pointer differs from the target's
//! and moved since the base. The base is the source tip recorded by the last
//! merge between the same pair, or the graph merge base. Entities that both
//! sides moved become conflicts unless one side's history already contains the
//! other's change; the rest are applied to the target through one ordinary
//! commit.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use versa_core::{
    graph,
    ids::*,
    model::{Change, ChangeConflict, ConflictStatus, EntityKey, MergeIntent},
};
use versa_storage::Storage;

use crate::error::EngineError;
use crate::observer::CommitEvent;
use crate::plugin::MergeCandidate;
use crate::session::Session;
use crate::state::{load_change, load_version, Lineage};
use crate::Engine;

/// Detector key used for entities both sides moved away from the base.
pub const DIVERGING: &str = "diverging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedConflict {
    /// `<detector>:<entity key>` for divergence, `<detector>:<reason>:<entity key>` otherwise.
    pub key: String,
    pub entity: EntityKey,
    pub change_ids: Vec<ChangeId>,
}

/// What a merge would do, computed without writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub source: VersionId,
    pub target: VersionId,
    pub source_tip: ChangeSetId,
    pub base: Option<ChangeSetId>,
    /// Source changes the target will point at, in entity key order.
    pub apply: Vec<Change>,
    /// In conflict key order.
    pub conflicts: Vec<PlannedConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub applied: Vec<EntityKey>,
    pub conflicts: Vec<ChangeConflict>,
    pub commit: Option<CommitEvent>,
}

impl Engine {
    pub fn plan_merge(&self, source_id: VersionId, target_id: VersionId) -> Result<MergePlan, EngineError> {
        let source = load_version(&self.storage, source_id)?;
        let target = load_version(&self.storage, target_id)?;

        let source_lineage = Lineage::of(&self.storage, source.change_set_id)?;
        let target_lineage = Lineage::of(&self.storage, target.change_set_id)?;
        let source_pointers = source_lineage.pointers(&self.storage, None)?;
        let target_pointers = target_lineage.pointers(&self.storage, None)?;

        let dag_base = graph::merge_base(&self.storage, source.change_set_id, target.change_set_id)?;
        let intent = self.storage.get_merge_intent(source.id, target.id)?;
        let base = intent.as_ref().map(|i| i.source_change_set_id).or(dag_base);
        let base_pointers = self.pointers_at(base)?;

        // Keys with an open conflict on the target compare against the graph
        // base so the conflict is reported again instead of being skipped.
        let open: BTreeSet<EntityKey> = self
            .storage
            .conflicts_for_version(target.id)?
            .into_iter()
            .filter(|c| c.status == ConflictStatus::Open)
            .map(|c| c.entity)
            .collect();
        let graph_base_pointers = if intent.is_some() && !open.is_empty() {
            Some(self.pointers_at(dag_base)?)
        } else {
            None
        };

        let mut candidates = Vec::new();
        for (key, source_change) in &source_pointers {
            let target_change = target_pointers.get(key);
            if target_change.map(|c| c.id) == Some(source_change.id) {
                continue;
            }
            let base_change = match &graph_base_pointers {
                Some(pointers) if open.contains(key) => pointers.get(key),
                _ => base_pointers.get(key),
            };
            if base_change.map(|c| c.id) == Some(source_change.id) {
                continue;
            }
            // The target already took this change and moved past it.
            if target_change.is_some() && target_lineage.has_pointed(&self.storage, key, source_change.id)? {
                continue;
            }
            candidates.push(MergeCandidate {
                key: key.clone(),
                source: source_change.clone(),
                source_content: self.storage.get_snapshot(source_change.snapshot_id)?.content,
                target: target_change.cloned(),
                target_content: match target_change {
                    Some(c) => self.storage.get_snapshot(c.snapshot_id)?.content,
                    None => None,
                },
                base: base_change.cloned(),
            });
        }

        let contested: Vec<MergeCandidate> = candidates.iter().filter(|c| c.target.is_some()).cloned().collect();
        let mut conflicts: BTreeMap<String, PlannedConflict> = BTreeMap::new();
        for candidate in &contested {
            let Some(target_change) = &candidate.target else {
                continue;
            };
            let target_moved = candidate.base.as_ref().map(|b| b.id) != Some(target_change.id);
            // A source change written on top of the target's change is a fast-forward.
            if target_moved && !source_lineage.has_pointed(&self.storage, &candidate.key, target_change.id)? {
                let key = format!("{DIVERGING}:{}", candidate.key);
                conflicts.insert(
                    key.clone(),
                    PlannedConflict {
                        key,
                        entity: candidate.key.clone(),
                        change_ids: vec![target_change.id, candidate.source.id],
                    },
                );
            }
        }
        for detector in &self.detectors {
            let found = detector.detect(&contested).map_err(|e| EngineError::Plugin {
                plugin_key: detector.key().to_string(),
                operation: "detect".into(),
                message: e.0,
            })?;
            for detected in found {
                let key = format!("{}:{}:{}", detector.key(), detected.reason, detected.entity);
                conflicts.insert(
                    key.clone(),
                    PlannedConflict {
                        key,
                        entity: detected.entity,
                        change_ids: detected.change_ids,
                    },
                );
            }
        }

        let conflicted: BTreeSet<&EntityKey> = conflicts.values().map(|c| &c.entity).collect();
        let apply = candidates
            .iter()
            .filter(|c| !conflicted.contains(&c.key))
            .map(|c| c.source.clone())
            .collect();

        Ok(MergePlan {
            source: source.id,
            target: target.id,
            source_tip: source.change_set_id,
            base,
            apply,
            conflicts: conflicts.into_values().collect(),
        })
    }

    /// Merges `source` into `target`. The session supplies the author of the
    /// merge commit.
    pub fn merge(&mut self, session: &Session, source_id: VersionId, target_id: VersionId) -> Result<MergeOutcome, EngineError> {
        let plan = self.plan_merge(source_id, target_id)?;
        let source_name = load_version(&self.storage, source_id)?.name;
        let target_name = load_version(&self.storage, target_id)?.name;
        let description = format!("merge {source_name} into {target_name}");
        let author = session.author.clone();

        let outcome = self.atomically(|engine| {
            let commit = if plan.apply.is_empty() {
                None
            } else {
                Some(engine.commit_to_version(plan.target, &author, &description, &plan.apply)?)
            };

            let mut conflicts = Vec::with_capacity(plan.conflicts.len());
            for planned in &plan.conflicts {
                let conflict = match engine.storage.find_open_conflict(&planned.key, &planned.change_ids)? {
                    Some(existing) => existing,
                    None => {
                        let conflict = ChangeConflict {
                            id: engine.ids.conflict_id(),
                            key: planned.key.clone(),
                            entity: planned.entity.clone(),
                            conflicting_change_ids: planned.change_ids.clone(),
                            status: ConflictStatus::Open,
                            detected_at: engine.ids.now()?,
                            resolved_change_id: None,
                            resolved_at: None,
                        };
                        engine.storage.insert_conflict(&conflict)?;
                        conflict
                    }
                };
                engine.storage.attach_conflict(plan.target, conflict.id)?;
                conflicts.push(conflict);
            }

            engine.storage.upsert_merge_intent(&MergeIntent {
                source_version_id: plan.source,
                target_version_id: plan.target,
                source_change_set_id: plan.source_tip,
                recorded_at: engine.ids.now()?,
            })?;
            engine.refresh_populated()?;

            Ok(MergeOutcome {
                applied: plan.apply.iter().map(Change::key).collect(),
                conflicts,
                commit,
            })
        })?;

        info!(
            source = %source_name,
            target = %target_name,
            applied = outcome.applied.len(),
            conflicts = outcome.conflicts.len(),
            "merge finished"
        );
        if let Some(event) = &outcome.commit {
            self.notify(std::slice::from_ref(event));
        }
        Ok(outcome)
    }

    /// Points the target at `winner` and closes the conflict. Returns the
    /// commit when the target pointer had to move.
    pub fn resolve_conflict(
        &mut self,
        session: &Session,
        target_id: VersionId,
        conflict_id: ConflictId,
        winner: ChangeId,
    ) -> Result<Option<CommitEvent>, EngineError> {
        let target = load_version(&self.storage, target_id)?;
        let conflict = self
            .storage
            .conflicts_for_version(target.id)?
            .into_iter()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| EngineError::ConflictNotFound(conflict_id.to_string()))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(EngineError::ConflictAlreadyResolved(conflict_id.to_string()));
        }
        if !conflict.conflicting_change_ids.contains(&winner) {
            return Err(EngineError::NotAConflictSide {
                conflict_id: conflict_id.to_string(),
                change_id: winner.to_string(),
            });
        }
        let change = load_change(&self.storage, winner)?;
        let current = Lineage::of(&self.storage, target.change_set_id)?.pointer(&self.storage, &conflict.entity)?;
        let author = session.author.clone();

        let event = self.atomically(|engine| {
            let event = if current.map(|c| c.id) == Some(winner) {
                None
            } else {
                let description = format!("resolve {}", conflict.key);
                Some(engine.commit_to_version(target.id, &author, &description, std::slice::from_ref(&change))?)
            };
            let resolved_at = engine.ids.now()?;
            engine.storage.mark_conflict_resolved(conflict.id, winner, resolved_at)?;
            engine.refresh_populated()?;
            Ok(event)
        })?;

        debug!(conflict = %conflict_id, winner = %winner, "conflict resolved");
        if let Some(event) = &event {
            self.notify(std::slice::from_ref(event));
        }
        Ok(event)
    }

    pub fn conflicts(&self, version_id: VersionId) -> Result<Vec<ChangeConflict>, EngineError> {
        load_version(&self.storage, version_id)?;
        Ok(self.storage.conflicts_for_version(version_id)?)
    }

    fn pointers_at(&self, tip: Option<ChangeSetId>) -> Result<BTreeMap<EntityKey, Change>, EngineError> {
        match tip {
            Some(tip) => Lineage::of(&self.storage, tip)?.pointers(&self.storage, None),
            None => Ok(BTreeMap::new()),
        }
    }
}
