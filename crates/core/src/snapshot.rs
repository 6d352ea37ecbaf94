use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::ids::SnapshotId;

/// Immutable content referenced by changes. `content == None` is a deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub content: Option<Value>,
}

impl Snapshot {
    pub fn new(content: Option<Value>) -> Result<Self, CoreError> {
        let id = match &content {
            Some(value) => content_hash(value)?,
            None => SnapshotId::NO_CONTENT,
        };
        Ok(Self { id, content })
    }

    pub fn tombstone() -> Self {
        Self {
            id: SnapshotId::NO_CONTENT,
            content: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.id.is_no_content()
    }

    /// Canonical bytes stored in the content store. `None` for tombstones.
    pub fn canonical_bytes(&self) -> Result<Option<Vec<u8>>, CoreError> {
        self.content.as_ref().map(canonical_bytes).transpose()
    }
}

/// serde_json keeps object keys sorted, so equal values encode identically.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn content_hash(value: &Value) -> Result<SnapshotId, CoreError> {
    let bytes = canonical_bytes(value)?;
    let hash = blake3::hash(&bytes);
    let id = SnapshotId::from_bytes(*hash.as_bytes());
    if id.is_no_content() {
        return Err(CoreError::InvalidData("content hashed to the reserved sentinel".into()));
    }
    Ok(id)
}

pub fn parse_content(bytes: &[u8]) -> Result<Value, CoreError> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":"x"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":"x","b":1}"#).unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn different_content_different_hash() {
        let a = Snapshot::new(Some(json!({"v": 1}))).unwrap();
        let b = Snapshot::new(Some(json!({"v": 2}))).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn tombstone_uses_sentinel() {
        let t = Snapshot::new(None).unwrap();
        assert!(t.is_tombstone());
        assert_eq!(t, Snapshot::tombstone());
        assert_eq!(t.canonical_bytes().unwrap(), None);
    }
}
