//! Extension points registered when the engine is built.

use serde_json::Value;
use thiserror::Error;

use versa_core::{
    ids::ChangeId,
    model::{Change, EntityKey},
};

/// Failure reported by a plugin. The engine wraps it with the plugin key and
/// the operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One entity change derived from a file by a diff plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    /// `None` deletes the entity.
    pub snapshot: Option<Value>,
}

/// Turns raw file bytes into entity changes. The engine never looks inside
/// the bytes itself.
pub trait DiffPlugin {
    fn key(&self) -> &str;

    fn matches(&self, path: &str) -> bool;

    /// `before` is `None` for a new file, `after` is `None` for a deletion.
    fn detect_changes(
        &self,
        file_id: &str,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<Vec<DetectedChange>, PluginError>;
}

/// An entity the source version changed since the merge base.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub key: EntityKey,
    pub source: Change,
    pub source_content: Option<Value>,
    pub target: Option<Change>,
    pub target_content: Option<Value>,
    pub base: Option<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedConflict {
    pub entity: EntityKey,
    /// Stable reason, becomes part of the conflict key.
    pub reason: String,
    pub change_ids: Vec<ChangeId>,
}

pub trait ConflictDetector {
    fn key(&self) -> &str;

    /// Only candidates where the target also has a pointer are passed in.
    fn detect(&self, candidates: &[MergeCandidate]) -> Result<Vec<DetectedConflict>, PluginError>;
}
