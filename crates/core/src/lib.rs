pub mod clock;
pub mod error;
pub mod graph;
pub mod id_service;
pub mod ids;
pub mod model;
pub mod schema;
pub mod snapshot;

pub use clock::Hlc;
pub use error::CoreError;
pub use id_service::IdService;
pub use ids::*;
pub use model::*;
pub use schema::{FieldKind, SchemaDefinition, VersionScope};
pub use snapshot::Snapshot;
