use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tempfile::TempDir;
use versa_core::{ids::VersionId, model::Change};
use versa_engine::{
    CheckpointPolicy, CommitEvent, Engine, EngineBuilder, EngineConfig, EngineError, Session,
};
use versa_storage::SqliteStorage;

use crate::fixtures::{self, LinePlugin, TODO};

/// Engine configuration for tests: deterministic ids, cache mode taken from
/// `VERSA_CACHE_MODE`.
pub fn test_config() -> Result<EngineConfig, EngineError> {
    Ok(EngineConfig::from_env()?
        .deterministic(true)
        .checkpoint_policy(CheckpointPolicy::NearestLabel))
}

/// Builder with the test schemas and the line plugin registered.
pub fn test_builder(config: EngineConfig) -> EngineBuilder {
    Engine::builder(config)
        .schema(fixtures::todo_schema())
        .schema(fixtures::setting_schema())
        .schema(fixtures::paragraph_schema())
        .diff_plugin(LinePlugin)
}

/// Commit events captured by an observer.
pub type EventLog = Rc<RefCell<Vec<CommitEvent>>>;

pub struct TestStore {
    pub engine: Engine,
    pub session: Session,
    pub events: EventLog,
    _dir: Option<TempDir>,
}

impl TestStore {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_builder(test_builder(test_config()?))
    }

    pub fn with_builder(builder: EngineBuilder) -> Result<Self, EngineError> {
        Self::from_parts(builder, SqliteStorage::open_in_memory()?, None)
    }

    pub fn with_storage(builder: EngineBuilder, storage: SqliteStorage) -> Result<Self, EngineError> {
        Self::from_parts(builder, storage, None)
    }

    /// A store backed by a file in a fresh temporary directory.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        let storage = SqliteStorage::open(path.to_str().ok_or("non-utf8 temp path")?)?;
        Ok(Self::from_parts(test_builder(test_config()?), storage, Some(dir))?)
    }

    fn from_parts(builder: EngineBuilder, storage: SqliteStorage, dir: Option<TempDir>) -> Result<Self, EngineError> {
        let events: EventLog = Rc::default();
        let sink = Rc::clone(&events);
        let engine = builder
            .observer(move |event: &CommitEvent| sink.borrow_mut().push(event.clone()))
            .open(storage)?;
        let session = engine.session();
        Ok(Self {
            engine,
            session,
            events,
            _dir: dir,
        })
    }

    pub fn main(&self) -> VersionId {
        self.engine.main_version()
    }

    pub fn switch(&mut self, name: &str) -> Result<VersionId, EngineError> {
        self.engine.switch_version(&mut self.session, name)
    }

    pub fn insert_todo(&mut self, id: &str, title: &str) -> Result<Change, EngineError> {
        self.engine
            .insert(&mut self.session, TODO, fixtures::todo(id, title))
    }

    pub fn set_title(&mut self, id: &str, title: &str) -> Result<Change, EngineError> {
        self.engine
            .update(&mut self.session, TODO, fixtures::todo(id, title))
    }

    pub fn delete_todo(&mut self, id: &str) -> Result<Change, EngineError> {
        self.engine.delete(&mut self.session, TODO, id)
    }

    /// Title of a todo as seen from the session.
    pub fn title(&self, id: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .engine
            .get(&self.session, TODO, id)?
            .and_then(|e| e.content.get("title").and_then(Value::as_str).map(str::to_string)))
    }

    /// `(id, title)` of every visible todo, in id order.
    pub fn titles(&self) -> Result<Vec<(String, String)>, EngineError> {
        Ok(self
            .engine
            .select(&self.session, TODO)?
            .into_iter()
            .map(|e| {
                let title = e.content.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
                (e.entity_id, title)
            })
            .collect())
    }
}
