use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use versa_core::model::StateRow;
use versa_engine::{CacheMode, Engine, Session, GLOBAL_VERSION, MAIN_VERSION};
use versa_harness::{fixtures, test_builder, test_config, TestStore};

fn encode(rows: &[StateRow]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(&rows)
}

/// Warm cache, live recomputation and a repopulated cache must agree byte
/// for byte.
fn assert_transparent(engine: &Engine, schema_key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let warm = engine.materialize(schema_key)?;
    let live = engine.materialize_live(schema_key)?;
    engine.evict_cache(Some(schema_key))?;
    let cold = engine.materialize(schema_key)?;
    assert_eq!(encode(&warm)?, encode(&live)?, "warm cache differs from live state");
    assert_eq!(encode(&cold)?, encode(&live)?, "repopulated cache differs from live state");
    Ok(())
}

fn random_write(
    engine: &mut Engine,
    session: &mut Session,
    rng: &mut StdRng,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = format!("t{}", rng.gen_range(0..8));
    let exists = engine.get(session, fixtures::TODO, &id)?.is_some();
    match (exists, rng.gen_range(0..3)) {
        (false, _) => {
            let title = format!("new {}", rng.gen_range(0..4));
            engine.insert(session, fixtures::TODO, fixtures::todo(&id, &title))?;
        }
        (true, 0) => {
            engine.delete(session, fixtures::TODO, &id)?;
        }
        (true, _) => {
            let title = format!("edit {}", rng.gen_range(0..4));
            engine.update(session, fixtures::TODO, fixtures::todo(&id, &title))?;
        }
    }
    Ok(())
}

/// Seeded mix of writes, transactions, merges and checkpoints over
/// `global`, `main`, a branch and a nested child of the branch.
fn run_workload(store: &mut TestStore, seed: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let main = store.main();

    let mut sessions = vec![
        store.engine.session_on(GLOBAL_VERSION)?,
        store.engine.session_on(MAIN_VERSION)?,
    ];
    for step in 0..240 {
        if step == 40 {
            store.engine.create_version("feature", Some(main), None)?;
            sessions.push(store.engine.session_on("feature")?);
        }
        if step == 120 {
            let feature = store.engine.version_by_name("feature")?.id;
            store.engine.create_version("nested", Some(feature), Some(feature))?;
            sessions.push(store.engine.session_on("nested")?);
        }

        let pick = rng.gen_range(0..sessions.len());
        let session = &mut sessions[pick];
        if rng.gen_bool(0.2) {
            store.engine.begin(session)?;
            for _ in 0..rng.gen_range(1..4) {
                random_write(&mut store.engine, session, &mut rng)?;
            }
            if rng.gen_bool(0.8) {
                store.engine.commit(session)?;
            } else {
                store.engine.rollback(session)?;
            }
        } else {
            random_write(&mut store.engine, session, &mut rng)?;
        }

        if step % 60 == 59 {
            let feature = store.engine.version_by_name("feature")?.id;
            let merger = store.engine.session();
            store.engine.merge(&merger, feature, main)?;
            store.engine.create_checkpoint(main)?;
        }
        if step % 25 == 0 {
            // Keep the cache populated so later commits refresh it incrementally.
            store.engine.materialize(fixtures::TODO)?;
        }
    }
    Ok(())
}

#[test]
fn cache_matches_live_state_under_random_workload() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    run_workload(&mut store, 0x7e57)?;
    assert_transparent(&store.engine, fixtures::TODO)?;
    assert!(!store.engine.materialize(fixtures::TODO)?.is_empty());
    Ok(())
}

#[test]
fn cached_and_bypassed_reads_agree() -> Result<(), Box<dyn std::error::Error>> {
    let mut cached = TestStore::with_builder(test_builder(test_config()?.cache_mode(CacheMode::Use)))?;
    let mut bypassed = TestStore::with_builder(test_builder(test_config()?.cache_mode(CacheMode::Bypass)))?;
    run_workload(&mut cached, 0xca5e)?;
    run_workload(&mut bypassed, 0xca5e)?;

    assert_eq!(
        encode(&cached.engine.materialize(fixtures::TODO)?)?,
        encode(&bypassed.engine.materialize(fixtures::TODO)?)?
    );
    for name in [GLOBAL_VERSION, MAIN_VERSION, "feature", "nested"] {
        let a = cached.engine.session_on(name)?;
        let b = bypassed.engine.session_on(name)?;
        let rows_a = cached.engine.select(&a, fixtures::TODO)?;
        assert_eq!(rows_a, bypassed.engine.select(&b, fixtures::TODO)?, "select differs on {name}");
        for i in 0..8 {
            let id = format!("t{i}");
            assert_eq!(
                cached.engine.get(&a, fixtures::TODO, &id)?,
                bypassed.engine.get(&b, fixtures::TODO, &id)?,
                "get {id} differs on {name}"
            );
        }
    }
    Ok(())
}

#[test]
fn inherited_rows_follow_parent_commits() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    let global = store.engine.global_version();
    let mut on_global = store.engine.session_on(GLOBAL_VERSION)?;
    store
        .engine
        .insert(&mut on_global, fixtures::SETTING, json!({ "key": "a", "value": 1 }))?;
    store.engine.materialize(fixtures::SETTING)?;

    store
        .engine
        .update(&mut on_global, fixtures::SETTING, json!({ "key": "a", "value": 2 }))?;
    let rows = store.engine.materialize(fixtures::SETTING)?;
    let main_row = rows
        .iter()
        .find(|r| r.version_id == store.main())
        .ok_or("main row missing")?;
    assert_eq!(main_row.inherited_from, Some(global));
    let content = store.engine.snapshot(main_row.snapshot_id)?.content;
    assert_eq!(content, Some(json!({ "key": "a", "value": 2 })));

    assert_transparent(&store.engine, fixtures::SETTING)?;
    Ok(())
}

#[test]
fn rows_are_sorted_and_skip_tombstones() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store.insert_todo("b", "two")?;
    store.insert_todo("a", "one")?;
    store.insert_todo("c", "three")?;
    store.delete_todo("c")?;

    let rows = store.engine.materialize(fixtures::TODO)?;
    let ids: Vec<_> = rows.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(rows.iter().all(|r| !r.is_tombstone()));
    Ok(())
}

#[test]
fn evicted_cache_repopulates_on_read() -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TestStore::new()?;
    store.insert_todo("a", "one")?;
    assert_eq!(store.title("a")?, Some("one".into()));
    store.engine.evict_cache(None)?;
    assert_eq!(store.title("a")?, Some("one".into()));
    store.set_title("a", "two")?;
    store.engine.evict_cache(None)?;
    assert_eq!(store.titles()?, vec![("a".to_string(), "two".to_string())]);
    Ok(())
}
