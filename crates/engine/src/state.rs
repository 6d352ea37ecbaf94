//! Resolution of the visible change for an entity in a version.
//!
//! A version sees, in order: the session's staged changes, the nearest
//! pointer in its own committed lineage, then its parent version, recursively.
//! A tombstone at any level hides everything further down the chain.

use std::collections::{BTreeMap, BTreeSet};

use versa_core::{
    graph,
    ids::*,
    model::{Change, EntityKey, StateRow, Version},
    CoreError,
};
use versa_storage::{ChainTip, SqliteStorage, Storage};

use crate::error::EngineError;
use crate::overlay::TxOverlay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Own(Change),
    Inherited { from: VersionId, change: Change },
    Absent,
}

impl Resolved {
    pub fn change(&self) -> Option<&Change> {
        match self {
            Self::Own(change) | Self::Inherited { change, .. } => Some(change),
            Self::Absent => None,
        }
    }

    pub fn inherited_from(&self) -> Option<VersionId> {
        match self {
            Self::Inherited { from, .. } => Some(*from),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn into_row(self, version_id: VersionId) -> Option<StateRow> {
        let inherited_from = self.inherited_from();
        self.change()
            .map(|change| StateRow::from_change(version_id, change, inherited_from))
    }
}

/// Committed ancestry of one tip.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lineage {
    depths: BTreeMap<ChangeSetId, usize>,
}

impl Lineage {
    pub(crate) fn of(storage: &SqliteStorage, tip: ChangeSetId) -> Result<Self, EngineError> {
        Ok(Self {
            depths: graph::ancestors(storage, tip)?,
        })
    }

    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Nearest pointer for one entity, tombstones included.
    pub(crate) fn pointer(&self, storage: &SqliteStorage, key: &EntityKey) -> Result<Option<Change>, EngineError> {
        let candidates: Vec<(usize, ChangeId)> = storage
            .elements_for_key(key)?
            .into_iter()
            .filter_map(|e| self.depths.get(&e.change_set_id).map(|d| (*d, e.change_id)))
            .collect();
        nearest(storage, candidates)
    }

    /// Whether any change set in this lineage ever pointed `key` at `change_id`.
    pub(crate) fn has_pointed(
        &self,
        storage: &SqliteStorage,
        key: &EntityKey,
        change_id: ChangeId,
    ) -> Result<bool, EngineError> {
        Ok(storage
            .elements_for_key(key)?
            .iter()
            .any(|e| e.change_id == change_id && self.depths.contains_key(&e.change_set_id)))
    }

    /// Nearest pointer for every entity reachable from the tip, optionally
    /// restricted to one schema.
    pub(crate) fn pointers(
        &self,
        storage: &SqliteStorage,
        schema_key: Option<&str>,
    ) -> Result<BTreeMap<EntityKey, Change>, EngineError> {
        let elements = match schema_key {
            Some(schema_key) => storage
                .elements_for_schema(schema_key)?
                .into_iter()
                .filter(|e| self.depths.contains_key(&e.change_set_id))
                .collect(),
            None => {
                let mut all = Vec::new();
                for change_set_id in self.depths.keys() {
                    all.extend(storage.get_elements(*change_set_id)?);
                }
                all
            }
        };

        let mut grouped: BTreeMap<EntityKey, Vec<(usize, ChangeId)>> = BTreeMap::new();
        for element in elements {
            let depth = self.depths[&element.change_set_id];
            grouped
                .entry(element.key())
                .or_default()
                .push((depth, element.change_id));
        }

        let mut out = BTreeMap::new();
        for (key, candidates) in grouped {
            if let Some(change) = nearest(storage, candidates)? {
                out.insert(key, change);
            }
        }
        Ok(out)
    }
}

/// Smallest depth wins; ties go to the newest change, then the highest id.
fn nearest(storage: &SqliteStorage, candidates: Vec<(usize, ChangeId)>) -> Result<Option<Change>, EngineError> {
    let Some(best_depth) = candidates.iter().map(|(d, _)| *d).min() else {
        return Ok(None);
    };
    let mut best: Option<Change> = None;
    let tied: BTreeSet<ChangeId> = candidates
        .into_iter()
        .filter(|(d, _)| *d == best_depth)
        .map(|(_, id)| id)
        .collect();
    for change_id in tied {
        let change = load_change(storage, change_id)?;
        let newer = best
            .as_ref()
            .is_none_or(|b| (change.created_at, change.id) > (b.created_at, b.id));
        if newer {
            best = Some(change);
        }
    }
    Ok(best)
}

pub(crate) fn load_change(storage: &SqliteStorage, id: ChangeId) -> Result<Change, EngineError> {
    storage
        .get_change(id)?
        .ok_or_else(|| EngineError::ChangeNotFound(id.to_string()))
}

pub(crate) fn load_version(storage: &SqliteStorage, id: VersionId) -> Result<Version, EngineError> {
    storage
        .get_version(id)?
        .ok_or_else(|| EngineError::VersionNotFound(id.to_string()))
}

/// The version followed by its ancestors through `inherits_from`.
pub(crate) fn version_chain(storage: &SqliteStorage, id: VersionId) -> Result<Vec<Version>, EngineError> {
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut next = Some(id);
    while let Some(current) = next {
        if !seen.insert(current) {
            return Err(CoreError::CyclicAncestry(format!("version inheritance loops at {current}")).into());
        }
        let version = load_version(storage, current)?;
        next = version.inherits_from;
        chain.push(version);
    }
    Ok(chain)
}

/// A version's inheritance chain with the committed lineage of each member.
#[derive(Debug, Clone)]
pub(crate) struct ChainView {
    members: Vec<(Version, Lineage)>,
}

impl ChainView {
    pub(crate) fn load(storage: &SqliteStorage, version_id: VersionId) -> Result<Self, EngineError> {
        let mut members = Vec::new();
        for version in version_chain(storage, version_id)? {
            let lineage = Lineage::of(storage, version.change_set_id)?;
            members.push((version, lineage));
        }
        Ok(Self { members })
    }

    /// The same chain with the head's lineage replaced, e.g. by the state at
    /// its last checkpoint. `None` means an empty head.
    pub(crate) fn with_head_tip(
        storage: &SqliteStorage,
        version_id: VersionId,
        tip: Option<ChangeSetId>,
    ) -> Result<Self, EngineError> {
        let mut view = Self::load(storage, version_id)?;
        if let Some((_, lineage)) = view.members.first_mut() {
            *lineage = match tip {
                Some(tip) => Lineage::of(storage, tip)?,
                None => Lineage::empty(),
            };
        }
        Ok(view)
    }

    pub(crate) fn version(&self) -> &Version {
        &self.members[0].0
    }

    pub(crate) fn tips(&self) -> Vec<ChainTip> {
        self.members
            .iter()
            .map(|(v, _)| (v.id, v.change_set_id))
            .collect()
    }

    pub(crate) fn resolve(
        &self,
        storage: &SqliteStorage,
        key: &EntityKey,
        overlay: Option<&TxOverlay>,
    ) -> Result<Resolved, EngineError> {
        for (depth, (member, lineage)) in self.members.iter().enumerate() {
            let found = match overlay.and_then(|tx| tx.get(member.id, key)) {
                Some(staged) => Some(staged.change.clone()),
                None => lineage.pointer(storage, key)?,
            };
            if let Some(change) = found {
                if change.is_tombstone() {
                    return Ok(Resolved::Absent);
                }
                return Ok(if depth == 0 {
                    Resolved::Own(change)
                } else {
                    Resolved::Inherited {
                        from: member.id,
                        change,
                    }
                });
            }
        }
        Ok(Resolved::Absent)
    }

    /// Visible committed rows of one schema, in `(file_id, entity_id)` order.
    pub(crate) fn rows(&self, storage: &SqliteStorage, schema_key: &str) -> Result<Vec<StateRow>, EngineError> {
        let head = self.version().id;
        let mut seen = BTreeSet::new();
        let mut rows = BTreeMap::new();
        for (depth, (member, lineage)) in self.members.iter().enumerate() {
            for (key, change) in lineage.pointers(storage, Some(schema_key))? {
                if !seen.insert(key.clone()) || change.is_tombstone() {
                    continue;
                }
                let inherited_from = (depth > 0).then_some(member.id);
                rows.insert(
                    (key.file_id.clone(), key.entity_id.clone()),
                    StateRow::from_change(head, &change, inherited_from),
                );
            }
        }
        Ok(rows.into_values().collect())
    }
}
