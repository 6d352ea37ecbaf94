use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("duplicate pointer for {entity} in change set {change_set_id}")]
    DuplicatePointer { change_set_id: String, entity: String },

    #[error("missing reference: {0}")]
    MissingReference(String),

    #[error("change set {0} is immutable")]
    ImmutableChangeSet(String),

    #[error("change set {0} is already committed")]
    AlreadyCommitted(String),

    #[error("invalid store image: {0}")]
    BadImage(String),

    #[error("core error: {0}")]
    Core(#[from] versa_core::CoreError),
}
