use versa_core::model::ConflictStatus;
use versa_engine::{EngineError, MAIN_VERSION};
use versa_harness::{
    fixtures::{BrokenDetector, ProtectedSchema, TODO},
    test_builder, test_config, TestStore,
};
use versa_storage::Storage;

#[test]
fn diverging_edits_become_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("doc1", "base")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;

    let main_edit = store.set_title("doc1", "main edit")?;
    store.switch("feature")?;
    let feature_edit = store.set_title("doc1", "feature edit")?;
    store.switch(MAIN_VERSION)?;

    let plan = store.engine.plan_merge(feature, main)?;
    assert!(plan.apply.is_empty());
    assert_eq!(plan.conflicts.len(), 1);

    let merger = store.engine.session();
    let outcome = store.engine.merge(&merger, feature, main)?;
    assert!(outcome.applied.is_empty());
    assert!(outcome.commit.is_none());
    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.key, "diverging:todo:versa:doc1");
    assert_eq!(conflict.conflicting_change_ids, vec![main_edit.id, feature_edit.id]);
    assert_eq!(conflict.status, ConflictStatus::Open);
    assert_eq!(store.title("doc1")?, Some("main edit".into()));

    // Merging again reports the same conflict instead of a new one.
    let again = store.engine.merge(&merger, feature, main)?;
    assert_eq!(again.conflicts.len(), 1);
    assert_eq!(again.conflicts[0].id, conflict.id);
    assert_eq!(store.engine.conflicts(main)?.len(), 1);

    let resolved = store
        .engine
        .resolve_conflict(&merger, main, conflict.id, feature_edit.id)?;
    assert!(resolved.is_some());
    assert_eq!(store.title("doc1")?, Some("feature edit".into()));
    let stored = store.engine.conflicts(main)?;
    assert_eq!(stored[0].status, ConflictStatus::Resolved);
    assert_eq!(stored[0].resolved_change_id, Some(feature_edit.id));

    let after = store.engine.merge(&merger, feature, main)?;
    assert!(after.conflicts.is_empty());
    assert!(after.applied.is_empty());

    assert!(matches!(
        store.engine.resolve_conflict(&merger, main, conflict.id, feature_edit.id),
        Err(EngineError::ConflictAlreadyResolved(_))
    ));
    Ok(())
}

#[test]
fn resolving_needs_a_side_of_the_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    let base = store.insert_todo("doc1", "base")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.set_title("doc1", "main edit")?;
    store.switch("feature")?;
    store.set_title("doc1", "feature edit")?;

    let merger = store.engine.session();
    let outcome = store.engine.merge(&merger, feature, main)?;
    let conflict_id = outcome.conflicts[0].id;
    assert!(matches!(
        store.engine.resolve_conflict(&merger, main, conflict_id, base.id),
        Err(EngineError::NotAConflictSide { .. })
    ));
    assert!(matches!(
        store.engine.resolve_conflict(&merger, feature, conflict_id, base.id),
        Err(EngineError::ConflictNotFound(_))
    ));
    Ok(())
}

#[test]
fn keeping_the_target_side_needs_no_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("doc1", "base")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    let main_edit = store.set_title("doc1", "main edit")?;
    store.switch("feature")?;
    store.set_title("doc1", "feature edit")?;
    store.switch(MAIN_VERSION)?;

    let merger = store.engine.session();
    let conflict_id = store.engine.merge(&merger, feature, main)?.conflicts[0].id;
    let commit = store
        .engine
        .resolve_conflict(&merger, main, conflict_id, main_edit.id)?;
    assert!(commit.is_none());
    assert_eq!(store.title("doc1")?, Some("main edit".into()));
    assert!(store.engine.merge(&merger, feature, main)?.conflicts.is_empty());
    Ok(())
}

#[test]
fn source_only_changes_fast_forward() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("a", "one")?;
    store.insert_todo("keep", "untouched")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;

    store.set_title("keep", "main only")?;
    store.switch("feature")?;
    store.set_title("a", "two")?;
    store.insert_todo("b", "new")?;
    store.switch(MAIN_VERSION)?;

    let merger = store.engine.session();
    let outcome = store.engine.merge(&merger, feature, main)?;
    assert!(outcome.conflicts.is_empty());
    let applied: Vec<_> = outcome.applied.iter().map(|k| k.entity_id.as_str()).collect();
    assert_eq!(applied, vec!["a", "b"]);
    let commit = outcome.commit.ok_or("merge should commit")?;
    assert_eq!(commit.version_id, main);
    assert_eq!(
        store.titles()?,
        vec![
            ("a".to_string(), "two".to_string()),
            ("b".to_string(), "new".to_string()),
            ("keep".to_string(), "main only".to_string()),
        ]
    );
    assert_eq!(store.events.borrow().last(), Some(&commit));
    Ok(())
}

#[test]
fn target_only_edits_survive() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("a", "one")?;
    store.insert_todo("b", "one")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.set_title("b", "main edit")?;
    store.switch("feature")?;
    store.set_title("a", "feature edit")?;
    store.switch(MAIN_VERSION)?;

    let merger = store.engine.session();
    let outcome = store.engine.merge(&merger, feature, main)?;
    assert!(outcome.conflicts.is_empty());
    assert_eq!(
        store.titles()?,
        vec![
            ("a".to_string(), "feature edit".to_string()),
            ("b".to_string(), "main edit".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn merge_plans_are_deterministic() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    for id in ["a", "b", "c"] {
        store.insert_todo(id, "base")?;
    }
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.set_title("a", "main")?;
    store.switch("feature")?;
    store.set_title("a", "feature")?;
    store.set_title("c", "feature")?;

    let first = store.engine.plan_merge(feature, main)?;
    let second = store.engine.plan_merge(feature, main)?;
    assert_eq!(first, second);
    assert_eq!(first.apply.len(), 1);
    assert_eq!(first.conflicts.len(), 1);
    Ok(())
}

#[test]
fn detectors_can_flag_fast_forwards() -> Result<(), Box<dyn std::error::Error>> {
    let builder = test_builder(test_config()?).conflict_detector(ProtectedSchema(TODO));
    let mut store = TestStore::with_builder(builder)?;
    let main = store.main();
    store.insert_todo("a", "one")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.switch("feature")?;
    store.set_title("a", "two")?;
    store.insert_todo("b", "new")?;
    store.switch(MAIN_VERSION)?;

    let merger = store.engine.session();
    let outcome = store.engine.merge(&merger, feature, main)?;
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].key, "protected:schema:todo:versa:a");
    // The new entity has no target pointer, so it is not contested.
    let applied: Vec<_> = outcome.applied.iter().map(|k| k.entity_id.as_str()).collect();
    assert_eq!(applied, vec!["b"]);
    assert_eq!(store.title("a")?, Some("one".into()));
    Ok(())
}

#[test]
fn failing_detector_aborts_the_merge() -> Result<(), Box<dyn std::error::Error>> {
    let builder = test_builder(test_config()?).conflict_detector(BrokenDetector);
    let mut store = TestStore::with_builder(builder)?;
    let main = store.main();
    store.insert_todo("a", "one")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.switch("feature")?;
    store.set_title("a", "two")?;
    store.switch(MAIN_VERSION)?;

    let merger = store.engine.session();
    let err = store.engine.merge(&merger, feature, main).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Plugin { ref plugin_key, ref operation, .. }
            if plugin_key == "broken" && operation == "detect"
    ));
    assert_eq!(store.title("a")?, Some("one".into()));
    assert!(store.engine.storage().get_merge_intent(feature, main)?.is_none());
    assert!(store.engine.conflicts(main)?.is_empty());
    Ok(())
}

#[test]
fn edits_built_on_a_synced_change_fast_forward() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let main = store.main();
    store.insert_todo("doc1", "A")?;
    let feature = store.engine.create_version("feature", Some(main), None)?.id;
    store.set_title("doc1", "C")?;

    let merger = store.engine.session();
    let sync = store.engine.merge(&merger, main, feature)?;
    assert_eq!(sync.applied.len(), 1);
    assert!(sync.conflicts.is_empty());

    store.switch("feature")?;
    let edit = store.set_title("doc1", "D")?;
    store.switch(MAIN_VERSION)?;

    let outcome = store.engine.merge(&merger, feature, main)?;
    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.applied, vec![edit.key()]);
    assert_eq!(store.title("doc1")?, Some("D".into()));

    // Back the other way there is nothing left to bring over.
    let back = store.engine.plan_merge(main, feature)?;
    assert!(back.apply.is_empty());
    assert!(back.conflicts.is_empty());
    Ok(())
}
