pub mod cache;
pub mod config;
pub mod error;
pub mod files;
pub mod merge;
pub mod observer;
pub mod overlay;
pub mod plugin;
pub mod session;
pub mod state;
pub mod version;
pub mod view;

pub use config::{CacheMode, CheckpointPolicy, EngineConfig};
pub use error::EngineError;
pub use merge::{MergeOutcome, MergePlan, PlannedConflict};
pub use observer::{CommitEvent, CommitObserver};
pub use plugin::{ConflictDetector, DetectedChange, DetectedConflict, DiffPlugin, MergeCandidate, PluginError};
pub use session::Session;
pub use state::Resolved;
pub use version::{WorkingChange, WorkingChangeKind};
pub use files::{FileDescriptor, FILE_SCHEMA_KEY};
pub use view::Entity;

use std::collections::BTreeMap;

use tracing::{debug, info};

use versa_core::{
    graph::GraphSource,
    id_service::IdService,
    ids::*,
    model::{Change, ChangeInput, ChangeSet, ChangeSetElement, Commit, EntityKey, Version, CHECKPOINT_LABEL},
    schema::{SchemaDefinition, VersionScope},
    snapshot::Snapshot,
    CoreError,
};
use versa_storage::{decode_image, encode_image, SqliteStorage, Storage, StorageError};

use crate::overlay::{StagedChange, TxOverlay};
use crate::state::ChainView;

pub const GLOBAL_VERSION: &str = "global";
pub const MAIN_VERSION: &str = "main";
/// Label of the empty commit every store starts from.
pub const ROOT_LABEL: &str = "root";
/// File id used by entity-view writes that do not come from a file.
pub const DEFAULT_FILE_ID: &str = "versa";
/// Plugin key recorded on changes written directly through the engine.
pub const DIRECT_PLUGIN_KEY: &str = "versa_direct";

pub struct EngineBuilder {
    config: EngineConfig,
    schemas: Vec<SchemaDefinition>,
    diff_plugins: Vec<Box<dyn DiffPlugin>>,
    detectors: Vec<Box<dyn ConflictDetector>>,
    observers: Vec<Box<dyn CommitObserver>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            schemas: Vec::new(),
            diff_plugins: Vec::new(),
            detectors: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: SchemaDefinition) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn diff_plugin(mut self, plugin: impl DiffPlugin + 'static) -> Self {
        self.diff_plugins.push(Box::new(plugin));
        self
    }

    pub fn conflict_detector(mut self, detector: impl ConflictDetector + 'static) -> Self {
        self.detectors.push(Box::new(detector));
        self
    }

    pub fn observer(mut self, observer: impl CommitObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Opens the engine over `storage`, creating the built-in versions on an
    /// empty store.
    pub fn open(self, mut storage: SqliteStorage) -> Result<Engine, EngineError> {
        let mut ids = IdService::for_mode(self.config.deterministic);
        let (highest, latest) = storage.id_watermark()?;
        ids.skip_past(highest, latest);

        if storage.get_version_by_name(GLOBAL_VERSION)?.is_none() {
            bootstrap(&mut storage, &mut ids, &self.config.default_author)?;
        }
        let anchors = Anchors::load(&storage)?;

        let mut engine = Engine {
            storage,
            ids,
            config: self.config,
            schemas: BTreeMap::new(),
            diff_plugins: self.diff_plugins,
            detectors: self.detectors,
            observers: self.observers,
            anchors,
        };
        engine.register_schema(files::file_schema())?;
        for schema in self.schemas {
            engine.register_schema(schema)?;
        }
        info!(
            deterministic = engine.config.deterministic,
            cache_mode = ?engine.config.cache_mode,
            "engine opened"
        );
        Ok(engine)
    }
}

/// Ids of the built-in versions and the root change set.
#[derive(Debug, Clone, Copy)]
struct Anchors {
    global: VersionId,
    main: VersionId,
    root: ChangeSetId,
}

impl Anchors {
    fn load(storage: &SqliteStorage) -> Result<Self, EngineError> {
        let global = storage
            .get_version_by_name(GLOBAL_VERSION)?
            .ok_or_else(|| EngineError::VersionNotFound(GLOBAL_VERSION.into()))?;
        let main = storage
            .get_version_by_name(MAIN_VERSION)?
            .ok_or_else(|| EngineError::VersionNotFound(MAIN_VERSION.into()))?;
        let root = storage
            .commits_with_label(ROOT_LABEL)?
            .first()
            .map(|c| c.change_set_id)
            .ok_or_else(|| CoreError::InvalidData("store has no root commit".into()))?;
        Ok(Self {
            global: global.id,
            main: main.id,
            root,
        })
    }
}

fn bootstrap(storage: &mut SqliteStorage, ids: &mut IdService, author: &str) -> Result<(), EngineError> {
    storage.conn().execute_batch("BEGIN IMMEDIATE").map_err(StorageError::from)?;
    let result = (|| -> Result<(), EngineError> {
        let root = ChangeSet {
            id: ids.change_set_id(),
            immutable: false,
        };
        storage.create_change_set(&root, &[])?;
        let commit = Commit {
            id: ids.commit_id(),
            change_set_id: root.id,
            author: author.to_string(),
            created_at: ids.now()?,
            description: "root".into(),
        };
        storage.insert_commit(&commit, &[])?;
        storage.add_label(commit.id, ROOT_LABEL)?;
        storage.add_label(commit.id, CHECKPOINT_LABEL)?;

        let mut parent = None;
        for name in [GLOBAL_VERSION, MAIN_VERSION] {
            let working = ChangeSet {
                id: ids.change_set_id(),
                immutable: false,
            };
            storage.create_change_set(&working, &[])?;
            let version = Version {
                id: ids.version_id(),
                name: name.to_string(),
                change_set_id: root.id,
                working_change_set_id: working.id,
                inherits_from: parent,
            };
            storage.insert_version(&version)?;
            parent = Some(version.id);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            storage.conn().execute_batch("COMMIT").map_err(StorageError::from)?;
            info!("bootstrapped empty store");
            Ok(())
        }
        Err(e) => {
            let _ = storage.conn().execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub struct Engine {
    storage: SqliteStorage,
    ids: IdService,
    config: EngineConfig,
    schemas: BTreeMap<String, SchemaDefinition>,
    diff_plugins: Vec<Box<dyn DiffPlugin>>,
    detectors: Vec<Box<dyn ConflictDetector>>,
    observers: Vec<Box<dyn CommitObserver>>,
    anchors: Anchors,
}

impl Engine {
    pub fn open(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).open(storage)
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn global_version(&self) -> VersionId {
        self.anchors.global
    }

    pub fn main_version(&self) -> VersionId {
        self.anchors.main
    }

    pub fn root_change_set(&self) -> ChangeSetId {
        self.anchors.root
    }

    /// The change-set graph, for ancestry queries through `versa_core::graph`.
    pub fn graph(&self) -> &impl GraphSource<Error = StorageError> {
        &self.storage
    }

    pub fn add_observer(&mut self, observer: impl CommitObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// A session on `main` writing as the configured default author.
    pub fn session(&self) -> Session {
        Session::new(self.anchors.main, self.config.default_author.clone())
    }

    /// Execute a batch SQL statement on the underlying connection, mapping errors.
    fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.storage
            .conn()
            .execute_batch(sql)
            .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`; any error rolls everything back.
    pub(crate) fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.exec_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => match self.exec_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = self.exec_batch("ROLLBACK");
                    Err(e)
                }
            },
            Err(e) => {
                let _ = self.exec_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // Change log.

    /// Appends one change straight to the log, outside any version.
    pub fn append(&mut self, input: ChangeInput) -> Result<Change, EngineError> {
        let snapshot = Snapshot::new(input.content.clone())?;
        let change = self.new_change(&input, &snapshot)?;
        self.atomically(|engine| {
            engine.storage.put_snapshot(&snapshot)?;
            engine.storage.insert_change(&change)?;
            Ok(())
        })?;
        debug!(change = %change.id, entity = %change.key(), "appended change");
        Ok(change)
    }

    pub fn read_change(&self, id: ChangeId) -> Result<Change, EngineError> {
        state::load_change(&self.storage, id)
    }

    pub fn snapshot(&self, id: SnapshotId) -> Result<Snapshot, EngineError> {
        Ok(self.storage.get_snapshot(id)?)
    }

    fn new_change(&mut self, input: &ChangeInput, snapshot: &Snapshot) -> Result<Change, EngineError> {
        Ok(Change {
            id: self.ids.change_id(),
            entity_id: input.entity_id.clone(),
            schema_key: input.schema_key.clone(),
            schema_version: input.schema_version.clone(),
            file_id: input.file_id.clone(),
            plugin_key: input.plugin_key.clone(),
            snapshot_id: snapshot.id,
            created_at: self.ids.now()?,
        })
    }

    // Change sets and commits.

    pub fn create_change_set(&mut self, elements: &[(EntityKey, ChangeId)]) -> Result<ChangeSet, EngineError> {
        let change_set = ChangeSet {
            id: self.ids.change_set_id(),
            immutable: false,
        };
        let elements: Vec<ChangeSetElement> = elements
            .iter()
            .map(|(key, change_id)| ChangeSetElement::new(change_set.id, key, *change_id))
            .collect();
        self.atomically(|engine| Ok(engine.storage.create_change_set(&change_set, &elements)?))?;
        Ok(change_set)
    }

    pub fn commit_change_set(
        &mut self,
        change_set_id: ChangeSetId,
        parents: &[ChangeSetId],
        author: &str,
        description: &str,
    ) -> Result<Commit, EngineError> {
        let commit = Commit {
            id: self.ids.commit_id(),
            change_set_id,
            author: author.to_string(),
            created_at: self.ids.now()?,
            description: description.to_string(),
        };
        self.atomically(|engine| Ok(engine.storage.insert_commit(&commit, parents)?))?;
        Ok(commit)
    }

    // Transactions.

    pub fn begin(&mut self, session: &mut Session) -> Result<TxId, EngineError> {
        if session.tx.is_some() {
            return Err(EngineError::TransactionActive);
        }
        let id = self.ids.tx_id();
        session.tx = Some(TxOverlay::new(id));
        debug!(tx = %id, "transaction opened");
        Ok(id)
    }

    /// Writes everything staged in the session's transaction. The transaction
    /// is closed even when the commit fails.
    pub fn commit(&mut self, session: &mut Session) -> Result<Vec<CommitEvent>, EngineError> {
        let tx = session.tx.take().ok_or(EngineError::NoActiveTransaction)?;
        debug!(tx = %tx.id(), staged = tx.len(), "committing transaction");
        let author = session.author.clone();
        self.commit_staged(&author, tx.into_ordered())
    }

    pub fn rollback(&mut self, session: &mut Session) -> Result<(), EngineError> {
        let tx = session.tx.take().ok_or(EngineError::NoActiveTransaction)?;
        debug!(tx = %tx.id(), dropped = tx.len(), "transaction rolled back");
        Ok(())
    }

    /// Version a write to `schema_key` lands in for this session.
    pub(crate) fn target_version(&self, session: &Session, schema_key: &str) -> VersionId {
        match self.schemas.get(schema_key).map(|s| s.scope) {
            Some(VersionScope::Global) => self.anchors.global,
            _ => session.active_version,
        }
    }

    /// Stages one raw change through the session.
    pub fn write(&mut self, session: &mut Session, input: ChangeInput) -> Result<Change, EngineError> {
        let version = self.target_version(session, &input.schema_key);
        self.stage_one(session, version, input)
    }

    /// Stages changes in the session's transaction, or commits them at once
    /// as one implicit transaction when none is open.
    pub(crate) fn stage_all(
        &mut self,
        session: &mut Session,
        inputs: Vec<(VersionId, ChangeInput)>,
    ) -> Result<Vec<Change>, EngineError> {
        let mut staged = Vec::with_capacity(inputs.len());
        for (version_id, input) in inputs {
            let snapshot = Snapshot::new(input.content.clone())?;
            let change = self.new_change(&input, &snapshot)?;
            staged.push(StagedChange {
                version_id,
                change,
                snapshot,
            });
        }
        let changes: Vec<Change> = staged.iter().map(|s| s.change.clone()).collect();

        match session.tx.as_mut() {
            Some(tx) => {
                for s in staged {
                    debug!(tx = %tx.id(), entity = %s.change.key(), "staged change");
                    tx.stage(s);
                }
            }
            None => {
                let author = session.author.clone();
                self.commit_staged(&author, staged)?;
            }
        }
        Ok(changes)
    }

    /// One SQLite transaction: new changes, one commit per version, pointer
    /// advance, working-set reconciliation and cache refresh. Observers run
    /// after it is durable.
    fn commit_staged(&mut self, author: &str, staged: Vec<StagedChange>) -> Result<Vec<CommitEvent>, EngineError> {
        let mut by_version: Vec<(VersionId, Vec<StagedChange>)> = Vec::new();
        for s in staged {
            match by_version.iter_mut().find(|(v, _)| *v == s.version_id) {
                Some((_, list)) => list.push(s),
                None => by_version.push((s.version_id, vec![s])),
            }
        }

        let events = self.atomically(|engine| {
            let mut events = Vec::new();
            for (version_id, list) in by_version {
                let view = ChainView::load(&engine.storage, version_id)?;
                let mut changes = Vec::new();
                for s in list {
                    let visible = view.resolve(&engine.storage, &s.change.key(), None)?;
                    // An inherited value is only borrowed: writing it makes it the version's own.
                    let unchanged = match &visible {
                        Resolved::Own(current) => current.snapshot_id == s.change.snapshot_id,
                        Resolved::Inherited { .. } => false,
                        Resolved::Absent => s.change.is_tombstone(),
                    };
                    if unchanged {
                        debug!(entity = %s.change.key(), "dropping write equal to visible state");
                        continue;
                    }
                    engine.storage.put_snapshot(&s.snapshot)?;
                    engine.storage.insert_change(&s.change)?;
                    changes.push(s.change);
                }
                if changes.is_empty() {
                    continue;
                }
                events.push(engine.commit_to_version(version_id, author, "", &changes)?);
            }
            engine.refresh_populated()?;
            Ok(events)
        })?;

        self.notify(&events);
        Ok(events)
    }

    pub(crate) fn notify(&self, events: &[CommitEvent]) {
        for event in events {
            info!(
                version = %event.version_id,
                commit = %event.commit_id,
                changes = event.changes.len(),
                "commit applied"
            );
            for observer in &self.observers {
                observer.on_commit(event);
            }
        }
    }

    // Export and import.

    pub fn export(&self, include_cache: bool) -> Result<Vec<u8>, EngineError> {
        Ok(encode_image(&self.storage.export_image(include_cache)?)?)
    }

    /// Replaces the store's content with an exported image.
    pub fn import(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let image = decode_image(bytes)?;
        self.atomically(|engine| Ok(engine.storage.import_image(&image)?))?;
        self.anchors = Anchors::load(&self.storage)?;
        let (highest, latest) = self.storage.id_watermark()?;
        self.ids.skip_past(highest, latest);
        Ok(())
    }
}
