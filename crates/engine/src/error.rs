use versa_core::CoreError;
use versa_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("schema already registered: {0}")]
    SchemaExists(String),

    #[error("entity not found: {schema_key}:{entity_id}")]
    EntityNotFound { schema_key: String, entity_id: String },

    #[error("entity already exists: {schema_key}:{entity_id}")]
    EntityExists { schema_key: String, entity_id: String },

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("version already exists: {0}")]
    VersionExists(String),

    #[error("change not found: {0}")]
    ChangeNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("change {change_id} is not a side of conflict {conflict_id}")]
    NotAConflictSide { conflict_id: String, change_id: String },

    #[error("a transaction is already active on this session")]
    TransactionActive,

    #[error("no active transaction on this session")]
    NoActiveTransaction,

    #[error("no diff plugin matches {0}")]
    NoPlugin(String),

    #[error("plugin {plugin_key} failed during {operation}: {message}")]
    Plugin {
        plugin_key: String,
        operation: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
