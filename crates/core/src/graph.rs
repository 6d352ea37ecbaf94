//! Ancestry queries over the change-set DAG.
//!
//! Nodes are addressed by id and edges are stored as parent lists keyed by the
//! child. Every walk is an explicit BFS with a visited set, so a corrupted graph
//! can slow a query down but never loop it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::CoreError;
use crate::ids::ChangeSetId;

pub trait GraphSource {
    type Error: From<CoreError>;

    fn parents(&self, id: ChangeSetId) -> Result<Vec<ChangeSetId>, Self::Error>;
}

/// All ancestors of `start` (inclusive) with their minimal distance from it.
pub fn ancestors<G: GraphSource + ?Sized>(
    graph: &G,
    start: ChangeSetId,
) -> Result<BTreeMap<ChangeSetId, usize>, G::Error> {
    let mut depth = BTreeMap::new();
    let mut queue = VecDeque::new();
    depth.insert(start, 0usize);
    queue.push_back(start);

    while let Some(id) = queue.pop_front() {
        let next = depth[&id] + 1;
        for parent in graph.parents(id)? {
            if depth.contains_key(&parent) {
                continue;
            }
            depth.insert(parent, next);
            queue.push_back(parent);
        }
    }
    Ok(depth)
}

/// True if `a` is a proper ancestor of `b`.
pub fn is_ancestor_of<G: GraphSource + ?Sized>(
    graph: &G,
    a: ChangeSetId,
    b: ChangeSetId,
) -> Result<bool, G::Error> {
    if a == b {
        return Ok(false);
    }
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([b]);
    while let Some(id) = queue.pop_front() {
        for parent in graph.parents(id)? {
            if parent == a {
                return Ok(true);
            }
            if visited.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    Ok(false)
}

/// True if `a` is a proper descendant of `b`.
pub fn is_descendant_of<G: GraphSource + ?Sized>(
    graph: &G,
    a: ChangeSetId,
    b: ChangeSetId,
) -> Result<bool, G::Error> {
    is_ancestor_of(graph, b, a)
}

/// Change sets reachable from exactly one of `a` and `b`.
pub fn symmetric_difference<G: GraphSource + ?Sized>(
    graph: &G,
    a: ChangeSetId,
    b: ChangeSetId,
) -> Result<BTreeSet<ChangeSetId>, G::Error> {
    let from_a: BTreeSet<ChangeSetId> = ancestors(graph, a)?.into_keys().collect();
    let from_b: BTreeSet<ChangeSetId> = ancestors(graph, b)?.into_keys().collect();
    Ok(from_a.symmetric_difference(&from_b).copied().collect())
}

/// Best common ancestor of `a` and `b`.
///
/// Common ancestors that are themselves ancestors of another common ancestor
/// are discarded; among the rest the one closest to both tips wins, ties broken
/// by id so the answer never depends on call order.
pub fn merge_base<G: GraphSource + ?Sized>(
    graph: &G,
    a: ChangeSetId,
    b: ChangeSetId,
) -> Result<Option<ChangeSetId>, G::Error> {
    let from_a = ancestors(graph, a)?;
    let from_b = ancestors(graph, b)?;
    let common: BTreeSet<ChangeSetId> = from_a
        .keys()
        .filter(|id| from_b.contains_key(id))
        .copied()
        .collect();
    if common.is_empty() {
        return Ok(None);
    }

    // Common ancestors are closed under ancestry, so everything reachable from
    // their parents is redundant.
    let mut redundant = BTreeSet::new();
    let mut queue = VecDeque::new();
    for id in &common {
        for parent in graph.parents(*id)? {
            if redundant.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    while let Some(id) = queue.pop_front() {
        for parent in graph.parents(id)? {
            if redundant.insert(parent) {
                queue.push_back(parent);
            }
        }
    }

    Ok(common
        .iter()
        .filter(|id| !redundant.contains(id))
        .min_by_key(|id| (from_a[*id] + from_b[*id], **id))
        .copied())
}

/// In-memory DAG arena. Nodes can only be added with already-present parents,
/// so cycles cannot be formed.
#[derive(Debug, Default, Clone)]
pub struct DagArena {
    parents_by_child: BTreeMap<ChangeSetId, Vec<ChangeSetId>>,
}

impl DagArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ChangeSetId) -> bool {
        self.parents_by_child.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.parents_by_child.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents_by_child.is_empty()
    }

    pub fn add_node(&mut self, id: ChangeSetId, parents: &[ChangeSetId]) -> Result<(), CoreError> {
        if self.contains(id) {
            return Err(CoreError::CyclicAncestry(format!("{id} is already in the graph")));
        }
        for parent in parents {
            if !self.contains(*parent) {
                return Err(CoreError::InvalidData(format!("unknown parent {parent}")));
            }
        }
        let mut list = parents.to_vec();
        list.sort();
        list.dedup();
        self.parents_by_child.insert(id, list);
        Ok(())
    }
}

impl GraphSource for DagArena {
    type Error = CoreError;

    fn parents(&self, id: ChangeSetId) -> Result<Vec<ChangeSetId>, CoreError> {
        Ok(self.parents_by_child.get(&id).cloned().unwrap_or_default())
    }
}
