//! Materialized state through the per-schema cache.
//!
//! A schema's cache is populated on first read and kept current from then on:
//! every commit refreshes the populated schemas inside its own transaction.
//! When only tips moved since the last refresh, only the entities touched by
//! the change sets between the old and new tips are recomputed.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use versa_core::{
    graph,
    ids::*,
    model::{sort_state_rows, EntityKey, StateRow, Version},
};
use versa_storage::{ChainTip, StateCache, Storage};

use crate::config::CacheMode;
use crate::error::EngineError;
use crate::state::{self, load_change, ChainView, Resolved};
use crate::Engine;

impl Engine {
    /// Visible rows of one schema across every version, in
    /// `(version_id, file_id, entity_id)` order.
    pub fn materialize(&self, schema_key: &str) -> Result<Vec<StateRow>, EngineError> {
        if self.config.cache_mode == CacheMode::Bypass {
            return self.materialize_live(schema_key);
        }
        self.refresh_cache(schema_key)?;
        let mut rows = self.storage.cache_rows(schema_key)?;
        sort_state_rows(&mut rows);
        Ok(rows)
    }

    /// The same rows computed from the log and the graph, ignoring the cache.
    pub fn materialize_live(&self, schema_key: &str) -> Result<Vec<StateRow>, EngineError> {
        let mut rows = Vec::new();
        for version in self.storage.list_versions()? {
            rows.extend(ChainView::load(&self.storage, version.id)?.rows(&self.storage, schema_key)?);
        }
        sort_state_rows(&mut rows);
        Ok(rows)
    }

    /// Drops one schema's cache, or all of them. The next read repopulates.
    pub fn evict_cache(&self, schema_key: Option<&str>) -> Result<(), EngineError> {
        self.storage.drop_cache(schema_key)?;
        info!(schema = schema_key.unwrap_or("*"), "state cache evicted");
        Ok(())
    }

    /// Brings every version's slice of one schema's cache up to date. Each
    /// version's slice is refreshed atomically, meta last.
    pub(crate) fn refresh_cache(&self, schema_key: &str) -> Result<(), EngineError> {
        for version in self.storage.list_versions()? {
            let current: Vec<ChainTip> = state::version_chain(&self.storage, version.id)?
                .iter()
                .map(|v| (v.id, v.change_set_id))
                .collect();
            let previous = self.storage.cache_meta(schema_key, version.id)?;
            if previous.as_deref() == Some(current.as_slice()) {
                continue;
            }
            self.storage
                .in_savepoint(|| self.refresh_version(schema_key, &version, previous, &current))?;
        }
        Ok(())
    }

    fn refresh_version(
        &self,
        schema_key: &str,
        version: &Version,
        previous: Option<Vec<ChainTip>>,
        current: &[ChainTip],
    ) -> Result<(), EngineError> {
        let view = ChainView::load(&self.storage, version.id)?;
        match previous {
            Some(previous) if same_members(&previous, current) => {
                let keys = self.touched_keys(schema_key, &previous, current)?;
                self.storage.delete_cache_rows(schema_key, version.id, &keys)?;
                let mut rows = Vec::new();
                for (file_id, entity_id) in &keys {
                    let key = EntityKey::new(entity_id, schema_key, file_id);
                    if let Some(row) = view.resolve(&self.storage, &key, None)?.into_row(version.id) {
                        rows.push(row);
                    }
                }
                self.storage.insert_cache_rows(schema_key, &rows)?;
                debug!(schema = schema_key, version = %version.name, keys = keys.len(), "cache refreshed");
            }
            previous => {
                if previous.is_some() {
                    warn!(schema = schema_key, version = %version.name, "inheritance chain changed, rebuilding cache");
                }
                self.storage.clear_cache_version(schema_key, version.id)?;
                let rows = view.rows(&self.storage, schema_key)?;
                self.storage.insert_cache_rows(schema_key, &rows)?;
                debug!(schema = schema_key, version = %version.name, rows = rows.len(), "cache populated");
            }
        }
        self.storage.set_cache_meta(schema_key, version.id, current)?;
        Ok(())
    }

    /// Refreshes every schema that has been populated so far.
    pub(crate) fn refresh_populated(&self) -> Result<(), EngineError> {
        if self.config.cache_mode == CacheMode::Bypass {
            return Ok(());
        }
        for schema_key in self.storage.cached_schemas()? {
            self.refresh_cache(&schema_key)?;
        }
        Ok(())
    }

    /// `(file_id, entity_id)` of every entity of `schema_key` pointed at by a
    /// change set between an old tip and its new one.
    fn touched_keys(
        &self,
        schema_key: &str,
        previous: &[ChainTip],
        current: &[ChainTip],
    ) -> Result<Vec<(String, String)>, EngineError> {
        let mut keys = BTreeSet::new();
        for ((_, old), (_, new)) in previous.iter().zip(current) {
            if old == new {
                continue;
            }
            for change_set_id in graph::symmetric_difference(&self.storage, *old, *new)? {
                for element in self.storage.get_elements(change_set_id)? {
                    if element.schema_key == schema_key {
                        keys.insert((element.file_id, element.entity_id));
                    }
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Committed resolution of one entity, served from the cache when enabled.
    pub(crate) fn committed_resolve(&self, version_id: VersionId, key: &EntityKey) -> Result<Resolved, EngineError> {
        if self.config.cache_mode == CacheMode::Bypass {
            return ChainView::load(&self.storage, version_id)?.resolve(&self.storage, key, None);
        }
        self.refresh_cache(&key.schema_key)?;
        match self.storage.cache_row(&key.schema_key, version_id, key)? {
            Some(row) => {
                let change = load_change(&self.storage, row.change_id)?;
                Ok(match row.inherited_from {
                    Some(from) => Resolved::Inherited { from, change },
                    None => Resolved::Own(change),
                })
            }
            None => Ok(Resolved::Absent),
        }
    }

    /// Committed rows of one schema in one version.
    pub(crate) fn committed_rows(&self, version_id: VersionId, schema_key: &str) -> Result<Vec<StateRow>, EngineError> {
        if self.config.cache_mode == CacheMode::Bypass {
            return ChainView::load(&self.storage, version_id)?.rows(&self.storage, schema_key);
        }
        self.refresh_cache(schema_key)?;
        Ok(self.storage.cache_rows_for_version(schema_key, version_id)?)
    }
}

fn same_members(previous: &[ChainTip], current: &[ChainTip]) -> bool {
    previous.len() == current.len() && previous.iter().zip(current).all(|(a, b)| a.0 == b.0)
}
