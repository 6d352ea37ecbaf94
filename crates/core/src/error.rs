use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("cyclic ancestry: {0}")]
    CyclicAncestry(String),

    #[error("schema violation in {schema_key}: {reason}")]
    SchemaViolation { schema_key: String, reason: String },

    #[error("invalid schema definition {schema_key}: {reason}")]
    InvalidSchema { schema_key: String, reason: String },
}
