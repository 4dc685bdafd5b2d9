//! Harvest module - concurrent clone, extract and label pipeline.
//!
//! This module provides the pieces of one harvest run:
//! - **Catalog**: merging search results via [`CatalogBuilder`]
//! - **Workers**: per-repository clone and extraction via [`RepositoryWorker`]
//! - **Synchronization**: worker completion via [`CompletionBarrier`]
//! - **Aggregation**: single-owner manifest state via [`spawn_aggregator`]
//! - **Output**: the persisted [`Manifest`] and its [`ManifestWriter`]
//! - **Pipeline**: end-to-end orchestration via [`pipeline::HarvestPipeline`]

pub mod aggregator;
pub mod barrier;
pub mod catalog;
pub mod manifest;
pub mod pipeline;
pub mod traits;
pub mod worker;

// Re-export commonly used types
pub use traits::{ExtractionError, HarvestStage, ManifestError};

pub use aggregator::{record_queue, spawn_aggregator, AggregateResult, AggregatorHandle};
pub use barrier::{
    BarrierGuard, CompletionBarrier, CompletionReport, WorkerFailure, WorkerOutcome, WorkerStage,
};
pub use catalog::{Catalog, CatalogBuilder, CatalogStats};
pub use manifest::{Manifest, ManifestState, ManifestWriter, RejectedRecord};
pub use pipeline::{HarvestPipeline, HarvestReport, HarvestStats, PipelineError};
pub use worker::RepositoryWorker;
