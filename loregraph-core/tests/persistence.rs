//! Tests against a file-backed store.

use loregraph_core::testing::{batch_of, reference, with_refs, TestHarness};
use loregraph_core::{Engine, EngineConfig, NewWorld, RefStatus};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("lore.db");
    let config = EngineConfig::new().with_database_path(&path);

    let world_id = {
        let engine = Engine::open(config.clone()).unwrap();
        let world = engine
            .create_world("acme", NewWorld::new("Aerth").with_genre("fantasy").with_power_level(7))
            .unwrap();
        let harness = TestHarness {
            scope: engine.scope("acme", world.id).unwrap(),
            engine: engine.into(),
        };
        harness.ingest(with_refs(
            batch_of(
                "characters",
                "character",
                vec![json!({ "id": "c1", "name": "Kira", "aliases": ["Kit"], "power_level": 4 })],
            ),
            vec![reference("character", "c1", "location", "Eldoria Village")],
        ));
        world.id
    };
    assert!(path.exists());

    let engine = Engine::open(config).unwrap();
    let worlds = engine.worlds("acme").unwrap();
    assert_eq!(worlds.len(), 1);
    assert_eq!(worlds[0].genre.as_deref(), Some("fantasy"));
    assert_eq!(worlds[0].power_level, Some(7));

    let harness = TestHarness {
        scope: engine.scope("acme", world_id).unwrap(),
        engine: engine.into(),
    };
    let kira = harness.find("character", "Kit").expect("alias survives reopen");
    assert_eq!(kira.attribute("power_level"), Some(&json!(4)));

    // The pending reference resolves in the new process.
    let report = harness.ingest(batch_of(
        "geography",
        "location",
        vec![json!({ "name": "Eldoria Village" })],
    ));
    assert_eq!(report.resolved_refs.len(), 1);
    let refs = harness
        .engine
        .cross_references(&harness.scope, Some(RefStatus::Pending))
        .unwrap();
    assert!(refs.is_empty());
}

#[test]
fn test_duplicate_world_name_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let engine = Engine::open(EngineConfig::new().with_database_path(temp_dir.path().join("lore.db"))).unwrap();
    engine.create_world("acme", NewWorld::new("Aerth")).unwrap();
    assert!(engine.create_world("acme", NewWorld::new("Aerth")).is_err());
    // Names are per tenant.
    assert!(engine.create_world("globex", NewWorld::new("Aerth")).is_ok());
}
