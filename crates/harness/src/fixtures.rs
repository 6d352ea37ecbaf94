//! Schemas and plugins shared by the integration tests.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use versa_core::schema::{FieldKind, SchemaDefinition, VersionScope};
use versa_engine::{
    ConflictDetector, DetectedChange, DetectedConflict, DiffPlugin, MergeCandidate, PluginError,
};

pub const TODO: &str = "todo";
pub const SETTING: &str = "setting";
pub const PARAGRAPH: &str = "paragraph";

pub fn todo_schema() -> SchemaDefinition {
    SchemaDefinition::new(TODO, "1")
        .field("id", FieldKind::String, true)
        .field("title", FieldKind::String, true)
        .field("done", FieldKind::Boolean, false)
        .primary_key(&["id"])
}

/// Written to `global` and inherited everywhere.
pub fn setting_schema() -> SchemaDefinition {
    SchemaDefinition::new(SETTING, "1")
        .field("key", FieldKind::String, true)
        .field("value", FieldKind::Any, true)
        .primary_key(&["key"])
        .scope(VersionScope::Global)
}

pub fn paragraph_schema() -> SchemaDefinition {
    SchemaDefinition::new(PARAGRAPH, "1")
        .field("id", FieldKind::String, true)
        .field("text", FieldKind::String, true)
        .primary_key(&["id"])
}

pub fn todo(id: &str, title: &str) -> Value {
    json!({ "id": id, "title": title })
}

/// Diffs `.txt` files made of `id: text` lines into paragraph entities.
pub struct LinePlugin;

impl LinePlugin {
    fn parse(bytes: Option<&[u8]>) -> Result<BTreeMap<String, String>, PluginError> {
        let mut out = BTreeMap::new();
        let Some(bytes) = bytes else {
            return Ok(out);
        };
        let text = std::str::from_utf8(bytes).map_err(|e| PluginError::new(e.to_string()))?;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (id, body) = line
                .split_once(':')
                .ok_or_else(|| PluginError::new(format!("malformed line {line:?}")))?;
            out.insert(id.trim().to_string(), body.trim().to_string());
        }
        Ok(out)
    }
}

impl DiffPlugin for LinePlugin {
    fn key(&self) -> &str {
        "lines"
    }

    fn matches(&self, path: &str) -> bool {
        path.ends_with(".txt")
    }

    fn detect_changes(
        &self,
        _file_id: &str,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<Vec<DetectedChange>, PluginError> {
        let before = Self::parse(before)?;
        let after = Self::parse(after)?;
        let mut changes = Vec::new();
        for (id, text) in &after {
            if before.get(id) != Some(text) {
                changes.push(DetectedChange {
                    entity_id: id.clone(),
                    schema_key: PARAGRAPH.into(),
                    schema_version: "1".into(),
                    snapshot: Some(json!({ "id": id, "text": text })),
                });
            }
        }
        for id in before.keys().filter(|id| !after.contains_key(*id)) {
            changes.push(DetectedChange {
                entity_id: id.clone(),
                schema_key: PARAGRAPH.into(),
                schema_version: "1".into(),
                snapshot: None,
            });
        }
        Ok(changes)
    }
}

/// Flags every contested entity of one schema, fast-forwards included.
pub struct ProtectedSchema(pub &'static str);

impl ConflictDetector for ProtectedSchema {
    fn key(&self) -> &str {
        "protected"
    }

    fn detect(&self, candidates: &[MergeCandidate]) -> Result<Vec<DetectedConflict>, PluginError> {
        Ok(candidates
            .iter()
            .filter(|c| c.key.schema_key == self.0)
            .filter_map(|c| {
                let target = c.target.as_ref()?;
                Some(DetectedConflict {
                    entity: c.key.clone(),
                    reason: "schema".into(),
                    change_ids: vec![target.id, c.source.id],
                })
            })
            .collect())
    }
}

/// A detector that always fails.
pub struct BrokenDetector;

impl ConflictDetector for BrokenDetector {
    fn key(&self) -> &str {
        "broken"
    }

    fn detect(&self, _candidates: &[MergeCandidate]) -> Result<Vec<DetectedConflict>, PluginError> {
        Err(PluginError::new("detector exploded"))
    }
}
