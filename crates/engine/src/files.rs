//! File writes. The engine keeps a descriptor per file and asks the matching
//! diff plugin which entities the new bytes change; it never parses the bytes.

use serde_json::{json, Value};
use tracing::debug;

use versa_core::{
    ids::VersionId,
    model::{Change, ChangeInput, EntityKey},
    schema::{FieldKind, SchemaDefinition},
    CoreError,
};

use crate::error::EngineError;
use crate::plugin::{DetectedChange, DiffPlugin};
use crate::session::Session;
use crate::{Engine, DIRECT_PLUGIN_KEY};

pub const FILE_SCHEMA_KEY: &str = "versa_file";
const FILE_SCHEMA_VERSION: &str = "1";

pub(crate) fn file_schema() -> SchemaDefinition {
    SchemaDefinition::new(FILE_SCHEMA_KEY, FILE_SCHEMA_VERSION)
        .field("id", FieldKind::String, true)
        .field("path", FieldKind::String, true)
        .field("data", FieldKind::Array, true)
        .primary_key(&["id"])
}

fn descriptor_key(file_id: &str) -> EntityKey {
    EntityKey::new(file_id, FILE_SCHEMA_KEY, file_id)
}

/// A stored file: its path and raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_id: String,
    pub path: String,
    pub data: Vec<u8>,
}

impl FileDescriptor {
    fn from_content(file_id: &str, content: &Value) -> Result<Self, CoreError> {
        let path = content
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidData(format!("file {file_id} has no path")))?;
        let data: Vec<u8> = serde_json::from_value(content.get("data").cloned().unwrap_or(Value::Null))
            .map_err(|e| CoreError::Serialization(format!("file {file_id}: {e}")))?;
        Ok(Self {
            file_id: file_id.to_string(),
            path: path.to_string(),
            data,
        })
    }
}

impl Engine {
    /// Stores `bytes` as the new content of `file_id` and stages the entity
    /// changes the matching plugin derives from it.
    pub fn write_file(
        &mut self,
        session: &mut Session,
        file_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<Vec<Change>, EngineError> {
        let before = self.read_file(session, file_id)?;
        let plugin = self.plugin_for(path)?;
        let detected = plugin
            .detect_changes(file_id, before.as_ref().map(|f| f.data.as_slice()), Some(bytes))
            .map_err(|e| plugin_failure(plugin, "detect_changes", e.0))?;
        let plugin_key = plugin.key().to_string();

        let descriptor = json!({ "id": file_id, "path": path, "data": bytes });
        let mut inputs = vec![self.descriptor_input(session, file_id, Some(descriptor))];
        for change in detected {
            inputs.push(self.detected_input(session, file_id, &plugin_key, change)?);
        }
        debug!(file = file_id, path, plugin = %plugin_key, changes = inputs.len(), "file write detected");
        self.stage_all(session, inputs)
    }

    /// Deletes a file and every entity its plugin reports as removed.
    pub fn delete_file(&mut self, session: &mut Session, file_id: &str) -> Result<Vec<Change>, EngineError> {
        let before = self
            .read_file(session, file_id)?
            .ok_or_else(|| EngineError::EntityNotFound {
                schema_key: FILE_SCHEMA_KEY.to_string(),
                entity_id: file_id.to_string(),
            })?;
        let plugin = self.plugin_for(&before.path)?;
        let detected = plugin
            .detect_changes(file_id, Some(before.data.as_slice()), None)
            .map_err(|e| plugin_failure(plugin, "detect_changes", e.0))?;
        let plugin_key = plugin.key().to_string();

        let mut inputs = vec![self.descriptor_input(session, file_id, None)];
        for change in detected {
            inputs.push(self.detected_input(session, file_id, &plugin_key, change)?);
        }
        debug!(file = file_id, plugin = %plugin_key, changes = inputs.len(), "file delete detected");
        self.stage_all(session, inputs)
    }

    /// The file as visible from the session, staged writes included.
    pub fn read_file(&self, session: &Session, file_id: &str) -> Result<Option<FileDescriptor>, EngineError> {
        let version_id = self.target_version(session, FILE_SCHEMA_KEY);
        let resolved = self.resolve_in(session, version_id, &descriptor_key(file_id))?;
        let Some(change) = resolved.change() else {
            return Ok(None);
        };
        match self.content_of(session.overlay(), change.id, change.snapshot_id)? {
            Some(content) => Ok(Some(FileDescriptor::from_content(file_id, &content)?)),
            None => Ok(None),
        }
    }

    fn plugin_for(&self, path: &str) -> Result<&dyn DiffPlugin, EngineError> {
        self.diff_plugins
            .iter()
            .find(|p| p.matches(path))
            .map(|p| &**p)
            .ok_or_else(|| EngineError::NoPlugin(path.to_string()))
    }

    fn descriptor_input(&self, session: &Session, file_id: &str, content: Option<Value>) -> (VersionId, ChangeInput) {
        (
            self.target_version(session, FILE_SCHEMA_KEY),
            ChangeInput {
                entity_id: file_id.to_string(),
                schema_key: FILE_SCHEMA_KEY.to_string(),
                schema_version: FILE_SCHEMA_VERSION.to_string(),
                file_id: file_id.to_string(),
                plugin_key: DIRECT_PLUGIN_KEY.to_string(),
                content,
            },
        )
    }

    fn detected_input(
        &self,
        session: &Session,
        file_id: &str,
        plugin_key: &str,
        change: DetectedChange,
    ) -> Result<(VersionId, ChangeInput), EngineError> {
        let schema = self.schema(&change.schema_key)?;
        if let Some(content) = &change.snapshot {
            schema.validate(content)?;
        }
        Ok((
            self.target_version(session, &change.schema_key),
            ChangeInput {
                entity_id: change.entity_id,
                schema_key: change.schema_key,
                schema_version: change.schema_version,
                file_id: file_id.to_string(),
                plugin_key: plugin_key.to_string(),
                content: change.snapshot,
            },
        ))
    }
}

fn plugin_failure(plugin: &dyn DiffPlugin, operation: &str, message: String) -> EngineError {
    EngineError::Plugin {
        plugin_key: plugin.key().to_string(),
        operation: operation.to_string(),
        message,
    }
}
