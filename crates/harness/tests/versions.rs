use serde_json::json;
use versa_engine::{
    CheckpointPolicy, EngineError, Resolved, WorkingChangeKind, GLOBAL_VERSION, MAIN_VERSION,
};
use versa_harness::{fixtures, test_builder, test_config, TestStore};

#[test]
fn fresh_store_has_global_and_main() -> Result<(), Box<dyn std::error::Error>> {
    let store = TestStore::new()?;
    let names: Vec<String> = store.engine.versions()?.into_iter().map(|v| v.name).collect();
    assert!(names.contains(&GLOBAL_VERSION.to_string()));
    assert!(names.contains(&MAIN_VERSION.to_string()));

    let main = store.engine.version_by_name(MAIN_VERSION)?;
    assert_eq!(main.inherits_from, Some(store.engine.global_version()));
    assert_eq!(store.session.active_version(), main.id);
    Ok(())
}

#[test]
fn version_names_are_unique() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store.engine.create_version("feature", Some(store.main()), None)?;
    let err = store.engine.create_version("feature", None, None).unwrap_err();
    assert!(matches!(err, EngineError::VersionExists(name) if name == "feature"));
    Ok(())
}

#[test]
fn branch_sees_history_of_its_origin() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store.insert_todo("a", "from main")?;
    store.engine.create_version("feature", Some(store.main()), None)?;
    store.engine.create_version("empty", None, None)?;

    store.switch("feature")?;
    assert_eq!(store.title("a")?, Some("from main".into()));
    store.set_title("a", "on feature")?;

    store.switch("empty")?;
    assert_eq!(store.title("a")?, None);

    store.switch(MAIN_VERSION)?;
    assert_eq!(store.title("a")?, Some("from main".into()));
    Ok(())
}

#[test]
fn children_inherit_until_they_override() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let global = store.engine.global_version();
    let mut on_global = store.engine.session_on(GLOBAL_VERSION)?;
    store
        .engine
        .insert(&mut on_global, fixtures::TODO, fixtures::todo("shared", "global value"))?;

    let seen = store.engine.get(&store.session, fixtures::TODO, "shared")?.ok_or("missing")?;
    assert_eq!(seen.inherited_from, Some(global));
    assert_eq!(seen.content["title"], "global value");

    store.set_title("shared", "main value")?;
    let seen = store.engine.get(&store.session, fixtures::TODO, "shared")?.ok_or("missing")?;
    assert_eq!(seen.inherited_from, None);
    assert_eq!(seen.content["title"], "main value");
    let on_global_view = store.engine.get(&on_global, fixtures::TODO, "shared")?.ok_or("missing")?;
    assert_eq!(on_global_view.content["title"], "global value");

    // A tombstone in the child hides the inherited row.
    store.delete_todo("shared")?;
    assert_eq!(store.title("shared")?, None);
    assert!(store.engine.get(&on_global, fixtures::TODO, "shared")?.is_some());
    Ok(())
}

#[test]
fn global_schemas_always_write_to_global() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let global = store.engine.global_version();
    store.engine.create_version("feature", Some(store.main()), None)?;
    store.switch("feature")?;
    store.engine.insert(
        &mut store.session,
        fixtures::SETTING,
        json!({ "key": "theme", "value": "dark" }),
    )?;

    for name in [MAIN_VERSION, "feature"] {
        let session = store.engine.session_on(name)?;
        let setting = store.engine.get(&session, fixtures::SETTING, "theme")?.ok_or("missing")?;
        assert_eq!(setting.inherited_from, Some(global));
        assert_eq!(setting.content["value"], "dark");
    }
    Ok(())
}

#[test]
fn resolve_reports_where_a_value_comes_from() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let own = store.insert_todo("a", "mine")?;
    assert_eq!(store.engine.resolve(&store.session, &own.key())?, Resolved::Own(own.clone()));
    store.delete_todo("a")?;
    assert!(store.engine.resolve(&store.session, &own.key())?.is_absent());
    Ok(())
}

#[test]
fn advance_moves_only_to_committed_change_sets() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store.insert_todo("a", "one")?;
    let feature = store.engine.create_version("feature", None, None)?;
    let main_tip = store.engine.version(store.main())?.change_set_id;

    store.engine.advance(feature.id, main_tip)?;
    store.switch("feature")?;
    assert_eq!(store.title("a")?, Some("one".into()));

    let pending = store.engine.create_change_set(&[])?;
    assert!(store.engine.advance(feature.id, pending.id).is_err());
    assert_eq!(store.engine.version(feature.id)?.change_set_id, main_tip);
    Ok(())
}

#[test]
fn insert_then_delete_leaves_no_working_change() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("k1", "temp")?;
    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].kind, WorkingChangeKind::Added);

    store.delete_todo("k1")?;
    assert!(store.engine.working_changes(main)?.is_empty());
    Ok(())
}

#[test]
fn working_set_is_relative_to_the_checkpoint() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("k2", "original")?;
    store.engine.create_checkpoint(main)?;
    assert!(store.engine.working_changes(main)?.is_empty());

    store.set_title("k2", "edited")?;
    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].kind, WorkingChangeKind::Modified);

    // Back to the checkpoint value: net zero.
    store.set_title("k2", "original")?;
    assert!(store.engine.working_changes(main)?.is_empty());

    store.delete_todo("k2")?;
    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].kind, WorkingChangeKind::Deleted);
    Ok(())
}

#[test]
fn nearest_commit_policy_keeps_delete_markers() -> Result<(), Box<dyn std::error::Error>> {
    let config = test_config()?.checkpoint_policy(CheckpointPolicy::NearestCommit);
    let mut store = TestStore::with_builder(test_builder(config))?;
    let main = store.main();
    store.insert_todo("k1", "temp")?;
    store.delete_todo("k1")?;

    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].kind, WorkingChangeKind::Deleted);
    Ok(())
}

#[test]
fn open_working_change_set_starts_empty() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("a", "one")?;
    let before = store.engine.version(main)?.working_change_set_id;
    let fresh = store.engine.open_working_change_set(main)?;
    assert_ne!(before, fresh);
    assert!(store.engine.working_changes(main)?.is_empty());
    assert_eq!(store.title("a")?, Some("one".into()));
    Ok(())
}

#[test]
fn advance_reconciles_the_working_set() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    let first = store.insert_todo("a", "one")?;
    let main_tip = store.engine.version(main)?.change_set_id;
    store.engine.create_version("feature", Some(main), None)?;
    store.switch("feature")?;
    let second = store.set_title("a", "two")?;
    let feature_tip = store.engine.version_by_name("feature")?.change_set_id;
    store.switch(MAIN_VERSION)?;

    store.engine.advance(main, feature_tip)?;
    assert_eq!(store.title("a")?, Some("two".into()));
    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].kind, WorkingChangeKind::Added);
    assert_eq!(working[0].change.id, second.id);

    store.engine.advance(main, main_tip)?;
    let working = store.engine.working_changes(main)?;
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].change.id, first.id);
    Ok(())
}

#[test]
fn writing_an_inherited_value_takes_ownership() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.engine.create_version("child", None, Some(main))?;
    store.insert_todo("a", "x")?;

    store.switch("child")?;
    let seen = store.engine.get(&store.session, fixtures::TODO, "a")?.ok_or("missing")?;
    assert_eq!(seen.inherited_from, Some(main));
    store.set_title("a", "x")?;
    let seen = store.engine.get(&store.session, fixtures::TODO, "a")?.ok_or("missing")?;
    assert_eq!(seen.inherited_from, None);

    store.switch(MAIN_VERSION)?;
    store.set_title("a", "y")?;
    store.switch("child")?;
    assert_eq!(store.title("a")?, Some("x".into()));
    Ok(())
}
