//! Data-described entity schemas.
//!
//! A schema says which JSON shape its rows have, which fields form the primary
//! key, and whether rows are scoped to one version or shared through `global`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub const ENTITY_ID_SEPARATOR: &str = "~";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionScope {
    /// Rows live in the version they are written to.
    Version,
    /// Rows are always written to the global version and inherited elsewhere.
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub key: String,
    pub version: String,
    pub primary_key: Vec<String>,
    pub fields: Vec<FieldSpec>,
    pub additional_properties: bool,
    pub scope: VersionScope,
}

impl SchemaDefinition {
    pub fn new(key: &str, version: &str) -> Self {
        Self {
            key: key.to_string(),
            version: version.to_string(),
            primary_key: Vec::new(),
            fields: Vec::new(),
            additional_properties: false,
            scope: VersionScope::Version,
        }
    }

    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn field(mut self, name: &str, kind: FieldKind, required: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required,
        });
        self
    }

    pub fn additional_properties(mut self, allowed: bool) -> Self {
        self.additional_properties = allowed;
        self
    }

    pub fn scope(mut self, scope: VersionScope) -> Self {
        self.scope = scope;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidSchema {
            schema_key: self.key.clone(),
            reason: reason.into(),
        }
    }

    fn violation(&self, reason: impl Into<String>) -> CoreError {
        CoreError::SchemaViolation {
            schema_key: self.key.clone(),
            reason: reason.into(),
        }
    }

    /// Checks the definition itself. Schema keys end up in cache table names,
    /// so only `[a-z0-9_]` is allowed.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.key.is_empty()
            || !self
                .key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(self.invalid("key must be non-empty [a-z0-9_]"));
        }
        if self.primary_key.is_empty() {
            return Err(self.invalid("primary key is empty"));
        }
        for pk in &self.primary_key {
            let spec = self
                .fields
                .iter()
                .find(|f| &f.name == pk)
                .ok_or_else(|| self.invalid(format!("primary key field {pk} is not declared")))?;
            if !spec.required {
                return Err(self.invalid(format!("primary key field {pk} must be required")));
            }
            if !matches!(spec.kind, FieldKind::String | FieldKind::Integer) {
                return Err(self.invalid(format!("primary key field {pk} must be a string or integer")));
            }
        }
        Ok(())
    }

    /// Checks a row against the declared shape.
    pub fn validate(&self, content: &Value) -> Result<(), CoreError> {
        let object = content
            .as_object()
            .ok_or_else(|| self.violation("row is not a JSON object"))?;

        for spec in &self.fields {
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(self.violation(format!("missing required field {}", spec.name)));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(self.violation(format!(
                        "field {} expected {:?}, got {}",
                        spec.name, spec.kind, value
                    )));
                }
                Some(_) => {}
            }
        }

        if !self.additional_properties {
            if let Some(extra) = object
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(self.violation(format!("unknown field {extra}")));
            }
        }
        Ok(())
    }

    /// Entity id derived from the primary key values, joined with `~`.
    pub fn entity_id_for(&self, content: &Value) -> Result<String, CoreError> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for pk in &self.primary_key {
            let part = match content.get(pk) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(self.violation(format!("primary key field {pk} missing"))),
            };
            parts.push(part);
        }
        Ok(parts.join(ENTITY_ID_SEPARATOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo() -> SchemaDefinition {
        SchemaDefinition::new("todo", "1")
            .field("id", FieldKind::String, true)
            .field("title", FieldKind::String, true)
            .field("done", FieldKind::Boolean, false)
            .primary_key(&["id"])
    }

    #[test]
    fn valid_definition_and_row() {
        let schema = todo();
        schema.check().unwrap();
        schema.validate(&json!({"id": "t1", "title": "write"})).unwrap();
        assert_eq!(schema.entity_id_for(&json!({"id": "t1", "title": "x"})).unwrap(), "t1");
    }

    #[test]
    fn rejects_bad_rows() {
        let schema = todo();
        assert!(schema.validate(&json!({"id": "t1"})).is_err());
        assert!(schema.validate(&json!({"id": "t1", "title": 3})).is_err());
        assert!(schema.validate(&json!({"id": "t1", "title": "x", "extra": 1})).is_err());
        assert!(schema.validate(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn composite_key_joins_with_separator() {
        let schema = SchemaDefinition::new("cell", "1")
            .field("sheet", FieldKind::String, true)
            .field("row", FieldKind::Integer, true)
            .primary_key(&["sheet", "row"]);
        schema.check().unwrap();
        let id = schema.entity_id_for(&json!({"sheet": "s", "row": 4})).unwrap();
        assert_eq!(id, "s~4");
    }

    #[test]
    fn rejects_bad_definitions() {
        assert!(SchemaDefinition::new("Bad-Key", "1").check().is_err());
        assert!(SchemaDefinition::new("nopk", "1").check().is_err());
        let optional_pk = SchemaDefinition::new("x", "1")
            .field("id", FieldKind::String, false)
            .primary_key(&["id"]);
        assert!(optional_pk.check().is_err());
    }
}
