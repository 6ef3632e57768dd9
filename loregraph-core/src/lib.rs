//! Canonical entity graph for extracted narrative worlds.
//!
//! Extraction skills each emit a JSON batch of entities (characters,
//! locations, factions...) and loose cross-references between them. This
//! crate turns those batches into one deduplicated, tenant-scoped graph:
//!
//! - a schema catalog with per-type validation and merge policies
//! - a registry giving every (type, normalized name) exactly one canonical id
//! - field-level merging, with unmergeable conflicts queued for review
//! - cross-reference resolution into typed relationships
//! - SQLite persistence with optimistic versioning
//!
//! # Quick Start
//!
//! ```
//! use loregraph_core::{Engine, ExtractionBatch, NewWorld};
//! use serde_json::json;
//!
//! let engine = Engine::in_memory()?;
//! let world = engine.create_world("acme", NewWorld::new("Aerth"))?;
//! let scope = engine.scope("acme", world.id)?;
//!
//! let report = engine.ingest(&scope, &ExtractionBatch::from_value(json!({
//!     "location": [{ "name": "Eldoria Village" }],
//!     "character": [{ "id": "c1", "name": "Kira" }],
//!     "cross_references": [{
//!         "source_type": "character", "source_id": "c1",
//!         "target_type": "location", "target_hint": "eldoria village"
//!     }]
//! }))?);
//! assert_eq!(report.resolved_refs.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Lets `#[derive(EntitySchema)]` paths resolve inside this crate.
extern crate self as loregraph_core;

pub mod batch;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod merge;
pub mod model;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod review;
pub mod store;
pub mod testing;
pub mod validate;
pub mod workers;

// Re-export for convenience
pub use catalog::EntitySchema;
pub use loregraph_macros::EntitySchema;

// Primary public API
pub use batch::ExtractionBatch;
pub use catalog::{Catalog, CatalogBuilder, MergePolicy, TypeSchema};
pub use config::{DatabaseConfig, EngineConfig};
pub use engine::Engine;
pub use error::{EngineError, IntegrityError, Result, StoreError};
pub use id::{EntityId, Scope, TenantId, WorldId};
pub use model::{Entity, EntityFilter, NewWorld, Relationship, World};
pub use report::MergeReport;
pub use resolver::{CrossReference, RefStatus};
pub use review::{ReviewDecision, ReviewItem};
pub use testing::TestHarness;
pub use workers::{IngestRun, RunHandle, RunReport};
