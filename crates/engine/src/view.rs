//! Entity CRUD over registered schemas.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use versa_core::{
    ids::*,
    model::{Change, ChangeInput, EntityKey, StateRow},
    schema::SchemaDefinition,
};
use versa_storage::Storage;

use crate::error::EngineError;
use crate::overlay::TxOverlay;
use crate::session::Session;
use crate::state::{self, ChainView, Resolved};
use crate::{Engine, DEFAULT_FILE_ID, DIRECT_PLUGIN_KEY};

/// The visible value of one entity as seen from a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub content: Value,
    pub change_id: ChangeId,
    pub inherited_from: Option<VersionId>,
}

impl Engine {
    pub fn register_schema(&mut self, schema: SchemaDefinition) -> Result<(), EngineError> {
        schema.check()?;
        if self.schemas.contains_key(&schema.key) {
            return Err(EngineError::SchemaExists(schema.key));
        }
        debug!(schema = %schema.key, version = %schema.version, "schema registered");
        self.schemas.insert(schema.key.clone(), schema);
        Ok(())
    }

    pub fn schema(&self, schema_key: &str) -> Result<&SchemaDefinition, EngineError> {
        self.schemas
            .get(schema_key)
            .ok_or_else(|| EngineError::UnknownSchema(schema_key.to_string()))
    }

    pub fn insert(&mut self, session: &mut Session, schema_key: &str, content: Value) -> Result<Change, EngineError> {
        let (version_id, key, input) = self.direct_write(session, schema_key, content)?;
        if !self.resolve_in(session, version_id, &key)?.is_absent() {
            return Err(EngineError::EntityExists {
                schema_key: key.schema_key,
                entity_id: key.entity_id,
            });
        }
        self.stage_one(session, version_id, input)
    }

    pub fn update(&mut self, session: &mut Session, schema_key: &str, content: Value) -> Result<Change, EngineError> {
        let (version_id, key, input) = self.direct_write(session, schema_key, content)?;
        self.require_visible(session, version_id, &key)?;
        self.stage_one(session, version_id, input)
    }

    pub fn delete(&mut self, session: &mut Session, schema_key: &str, entity_id: &str) -> Result<Change, EngineError> {
        let schema = self.schema(schema_key)?;
        let version_id = self.target_version(session, schema_key);
        let input = ChangeInput {
            entity_id: entity_id.to_string(),
            schema_key: schema.key.clone(),
            schema_version: schema.version.clone(),
            file_id: DEFAULT_FILE_ID.to_string(),
            plugin_key: DIRECT_PLUGIN_KEY.to_string(),
            content: None,
        };
        self.require_visible(session, version_id, &input.key())?;
        self.stage_one(session, version_id, input)
    }

    pub fn get(&self, session: &Session, schema_key: &str, entity_id: &str) -> Result<Option<Entity>, EngineError> {
        self.schema(schema_key)?;
        let key = EntityKey::new(entity_id, schema_key, DEFAULT_FILE_ID);
        let version_id = session.active_version;
        let Some(row) = self.resolve_in(session, version_id, &key)?.into_row(version_id) else {
            return Ok(None);
        };
        self.entity_from_row(session.overlay(), row)
    }

    /// Every visible entity of one schema in the session's active version,
    /// ordered by `(file_id, entity_id)`.
    pub fn select(&self, session: &Session, schema_key: &str) -> Result<Vec<Entity>, EngineError> {
        self.schema(schema_key)?;
        let version_id = session.active_version;
        let mut rows: BTreeMap<(String, String), StateRow> = self
            .committed_rows(version_id, schema_key)?
            .into_iter()
            .map(|row| ((row.file_id.clone(), row.entity_id.clone()), row))
            .collect();

        if let Some(tx) = session.overlay().filter(|tx| !tx.is_empty()) {
            let view = ChainView::load(&self.storage, version_id)?;
            for member in state::version_chain(&self.storage, version_id)? {
                for key in tx.keys_for_schema(member.id, schema_key) {
                    let slot = (key.file_id.clone(), key.entity_id.clone());
                    match view.resolve(&self.storage, &key, Some(tx))?.into_row(version_id) {
                        Some(row) => rows.insert(slot, row),
                        None => rows.remove(&slot),
                    };
                }
            }
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows.into_values() {
            if let Some(entity) = self.entity_from_row(session.overlay(), row)? {
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Resolution of any entity key in the session's active version.
    pub fn resolve(&self, session: &Session, key: &EntityKey) -> Result<Resolved, EngineError> {
        self.resolve_in(session, session.active_version, key)
    }

    /// Staged writes of the session win over committed state.
    pub(crate) fn resolve_in(
        &self,
        session: &Session,
        version_id: VersionId,
        key: &EntityKey,
    ) -> Result<Resolved, EngineError> {
        match session.overlay().filter(|tx| !tx.is_empty()) {
            Some(tx) => ChainView::load(&self.storage, version_id)?.resolve(&self.storage, key, Some(tx)),
            None => self.committed_resolve(version_id, key),
        }
    }

    /// Content of a visible change, looking at staged snapshots first.
    pub(crate) fn content_of(
        &self,
        overlay: Option<&TxOverlay>,
        change_id: ChangeId,
        snapshot_id: SnapshotId,
    ) -> Result<Option<Value>, EngineError> {
        if let Some(staged) = overlay.and_then(|tx| tx.find(change_id)) {
            return Ok(staged.snapshot.content.clone());
        }
        Ok(self.storage.get_snapshot(snapshot_id)?.content)
    }

    fn entity_from_row(&self, overlay: Option<&TxOverlay>, row: StateRow) -> Result<Option<Entity>, EngineError> {
        let content = self.content_of(overlay, row.change_id, row.snapshot_id)?;
        Ok(content.map(|content| Entity {
            entity_id: row.entity_id,
            schema_key: row.schema_key,
            file_id: row.file_id,
            content,
            change_id: row.change_id,
            inherited_from: row.inherited_from,
        }))
    }

    /// Validates `content` and builds the change for it.
    fn direct_write(
        &self,
        session: &Session,
        schema_key: &str,
        content: Value,
    ) -> Result<(VersionId, EntityKey, ChangeInput), EngineError> {
        let schema = self.schema(schema_key)?;
        schema.validate(&content)?;
        let entity_id = schema.entity_id_for(&content)?;
        let input = ChangeInput {
            entity_id,
            schema_key: schema.key.clone(),
            schema_version: schema.version.clone(),
            file_id: DEFAULT_FILE_ID.to_string(),
            plugin_key: DIRECT_PLUGIN_KEY.to_string(),
            content: Some(content),
        };
        Ok((self.target_version(session, schema_key), input.key(), input))
    }

    fn require_visible(&self, session: &Session, version_id: VersionId, key: &EntityKey) -> Result<(), EngineError> {
        if self.resolve_in(session, version_id, key)?.is_absent() {
            return Err(EngineError::EntityNotFound {
                schema_key: key.schema_key.clone(),
                entity_id: key.entity_id.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn stage_one(&mut self, session: &mut Session, version_id: VersionId, input: ChangeInput) -> Result<Change, EngineError> {
        let mut changes = self.stage_all(session, vec![(version_id, input)])?;
        changes
            .pop()
            .ok_or_else(|| EngineError::ChangeNotFound("staged change".into()))
    }
}
