use serde_json::Value;
use versa_engine::{EngineError, FILE_SCHEMA_KEY};
use versa_harness::{fixtures::PARAGRAPH, TestStore};
use versa_storage::Storage;

fn paragraphs(store: &TestStore) -> Result<Vec<(String, String)>, EngineError> {
    Ok(store
        .engine
        .select(&store.session, PARAGRAPH)?
        .into_iter()
        .map(|e| {
            let text = e.content.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            (e.entity_id, text)
        })
        .collect())
}

#[test]
fn writing_a_file_records_descriptor_and_entities() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let changes = store
        .engine
        .write_file(&mut store.session, "notes", "notes.txt", b"a: one\nb: two\n")?;
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].schema_key, FILE_SCHEMA_KEY);
    assert!(changes[1..].iter().all(|c| c.plugin_key == "lines" && c.file_id == "notes"));

    let file = store.engine.read_file(&store.session, "notes")?.ok_or("file missing")?;
    assert_eq!(file.path, "notes.txt");
    assert_eq!(file.data, b"a: one\nb: two\n".to_vec());
    assert_eq!(
        paragraphs(&store)?,
        vec![("a".to_string(), "one".to_string()), ("b".to_string(), "two".to_string())]
    );
    Ok(())
}

#[test]
fn rewriting_a_file_applies_the_plugin_diff() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store
        .engine
        .write_file(&mut store.session, "notes", "notes.txt", b"a: one\nb: two\n")?;
    let changes = store
        .engine
        .write_file(&mut store.session, "notes", "notes.txt", b"a: uno\n")?;
    assert_eq!(changes.len(), 3);
    assert_eq!(paragraphs(&store)?, vec![("a".to_string(), "uno".to_string())]);

    store.engine.delete_file(&mut store.session, "notes")?;
    assert!(store.engine.read_file(&store.session, "notes")?.is_none());
    assert!(paragraphs(&store)?.is_empty());
    Ok(())
}

#[test]
fn plugin_failure_leaves_no_trace() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let changes_before = store.engine.storage().change_count()?;

    let err = store
        .engine
        .write_file(&mut store.session, "bad", "bad.txt", b"no separator")
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Plugin { ref plugin_key, ref operation, .. }
            if plugin_key == "lines" && operation == "detect_changes"
    ));
    assert!(store.engine.read_file(&store.session, "bad")?.is_none());
    assert_eq!(store.engine.storage().change_count()?, changes_before);
    assert!(store.events.borrow().is_empty());
    Ok(())
}

#[test]
fn files_without_a_plugin_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let err = store
        .engine
        .write_file(&mut store.session, "img", "photo.png", &[0x89, 0x50])
        .unwrap_err();
    assert!(matches!(err, EngineError::NoPlugin(path) if path == "photo.png"));
    assert!(matches!(
        store.engine.delete_file(&mut store.session, "img"),
        Err(EngineError::EntityNotFound { .. })
    ));
    Ok(())
}

#[test]
fn file_writes_join_the_open_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let outside = store.engine.session();

    store.engine.begin(&mut store.session)?;
    store
        .engine
        .write_file(&mut store.session, "notes", "notes.txt", b"a: draft\n")?;
    store
        .engine
        .write_file(&mut store.session, "notes", "notes.txt", b"a: final\n")?;
    assert_eq!(paragraphs(&store)?, vec![("a".to_string(), "final".to_string())]);
    assert!(store.engine.read_file(&outside, "notes")?.is_none());

    let events = store.engine.commit(&mut store.session)?;
    assert_eq!(events.len(), 1);
    let file = store.engine.read_file(&outside, "notes")?.ok_or("file missing")?;
    assert_eq!(file.data, b"a: final\n".to_vec());
    Ok(())
}
