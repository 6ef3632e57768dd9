//! Tests for the concurrent ingestion runner.

use loregraph_core::testing::{batch_of, reference, with_refs, TestHarness};
use loregraph_core::{Engine, EngineConfig, ExtractionBatch, IngestRun, RefStatus};
use serde_json::{json, Value};

fn batch(document: Value) -> ExtractionBatch {
    ExtractionBatch::from_value(document).unwrap()
}

/// Character, faction and location batches that reference each other.
fn domain_batches() -> Vec<ExtractionBatch> {
    vec![
        batch(with_refs(
            batch_of(
                "characters",
                "character",
                vec![json!({ "id": "c1", "name": "Kira" }), json!({ "id": "c2", "name": "Mara" })],
            ),
            vec![
                reference("character", "c1", "location", "Eldoria Village"),
                reference("character", "c2", "faction", "Eldorian Council"),
            ],
        )),
        batch(with_refs(
            batch_of("factions", "faction", vec![json!({ "id": "f1", "name": "Eldorian Council" })]),
            vec![
                reference("faction", "f1", "location", "Eldoria Village"),
                reference("faction", "f1", "character", "mara"),
            ],
        )),
        batch(batch_of(
            "geography",
            "location",
            vec![json!({ "id": "l1", "name": "Eldoria Village" })],
        )),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_batches_resolve_everything() {
    let harness = TestHarness::new();
    let handle = IngestRun::new(harness.engine.clone(), harness.scope.clone()).spawn(domain_batches());
    let report = handle.join().await.unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.batches.len(), 3);
    assert!(report.skipped.is_empty());
    assert!(report.aborted.is_empty());
    assert_eq!(report.created(), 4);
    assert_eq!(report.failed().count(), 0);
    assert!(report.final_pass.is_some());

    let refs = harness.engine.cross_references(&harness.scope, None).unwrap();
    assert_eq!(refs.len(), 4);
    assert!(refs.iter().all(|r| r.status == RefStatus::Resolved));
    assert_eq!(harness.relationship_count(), 4);

    // Batch reports keep submission order.
    assert_eq!(report.batches[0].created[0].entity_type, "character");
    assert_eq!(report.batches[2].created[0].entity_type, "location");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_runs_are_idempotent() {
    let harness = TestHarness::new();
    for _ in 0..2 {
        let run = IngestRun::new(harness.engine.clone(), harness.scope.clone());
        run.spawn(domain_batches()).join().await.unwrap();
    }
    assert_eq!(harness.entity_count("character"), 2);
    assert_eq!(harness.relationship_count(), 4);
}

#[tokio::test]
async fn test_cancel_skips_unstarted_batches() {
    let engine = Engine::open(EngineConfig::new().with_workers(1)).unwrap();
    let harness = TestHarness::with_engine(engine);

    // Committed work from an earlier run survives a later cancellation.
    IngestRun::new(harness.engine.clone(), harness.scope.clone())
        .spawn(vec![batch(batch_of("characters", "character", vec![json!({ "name": "Kira" })]))])
        .join()
        .await
        .unwrap();

    // Nothing runs on this single-threaded runtime until we await, so every
    // batch sees the cancel flag before it starts.
    let handle = IngestRun::new(harness.engine.clone(), harness.scope.clone()).spawn(domain_batches());
    handle.cancel();
    let report = handle.join().await.unwrap();

    assert!(report.cancelled);
    assert!(report.batches.is_empty());
    assert_eq!(report.skipped, vec![0, 1, 2]);
    assert!(report.aborted.is_empty());
    assert!(report.final_pass.is_none());
    assert_eq!(harness.entity_count("character"), 1);
    assert_eq!(harness.entity_count("location"), 0);
}
