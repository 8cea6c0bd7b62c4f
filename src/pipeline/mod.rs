//! Intake pipeline.
//!
//! Every provider produces `NormalizedMessage`s; from there the path is
//! shared:
//! 1. `EnrichmentEngine::enrich()`: priority, sentiment, score, filter flag, entities
//! 2. `dedup_messages()`: batch-file sources only
//! 3. `sort_messages()`: priority rank, then score, then most recent first
//!
//! `Intake` ties the steps together behind a single `fetch` call.

pub mod aggregator;
pub mod entities;
pub mod rules;
pub mod types;

pub use aggregator::Intake;
pub use rules::EnrichmentEngine;
