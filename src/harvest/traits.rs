//! Core traits and error types for the harvest system.
//!
//! This module defines:
//! - Pipeline stage abstraction via [`HarvestStage`]
//! - Standardized error handling for extraction and manifest handling

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Pipeline Trait
// ============================================================================

/// Generic pipeline stage that transforms Input → Output.
///
/// Synchronous stages of the harvest (catalog building, manifest writing)
/// implement this trait so the pipeline can run and log them uniformly.
/// Implementations should be idempotent: re-running a stage on the same
/// input produces the same output.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` so a stage can be shared with
/// blocking tasks.
///
/// # Examples
///
/// ```ignore
/// struct CountStage;
///
/// impl HarvestStage for CountStage {
///     type Input = Vec<LabelRecord>;
///     type Output = usize;
///     type Error = std::convert::Infallible;
///
///     fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
///         Ok(input.len())
///     }
///
///     fn stage_name(&self) -> &'static str {
///         "count"
///     }
/// }
/// ```
pub trait HarvestStage: Send + Sync {
    /// Input type consumed by this stage
    type Input;

    /// Output type produced by this stage
    type Output;

    /// Error type for stage failures
    type Error: std::error::Error + Send + Sync + 'static;

    /// Executes the stage.
    ///
    /// # Errors
    ///
    /// Returns `Err` if processing fails. The error should provide enough
    /// context to tell which input caused it.
    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;

    /// Returns a human-readable name for this stage, used in logs.
    fn stage_name(&self) -> &'static str;
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that abort extraction for one repository.
///
/// Failures scoped to a single file (a copy that could not be written) are
/// counted on the worker outcome instead and never surface here.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Walking the working tree failed; traversal stops for this repository
    #[error("Failed to walk {path}: {message}")]
    Walk { path: PathBuf, message: String },

    /// The record queue closed before the repository was fully labeled
    #[error("Record queue closed")]
    QueueClosed,

    /// The blocking extraction task did not complete
    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// Errors raised while validating, loading or persisting the manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Manifest output location could not be created or written
    #[error("Failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest file could not be read
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed
    #[error("Manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A label record failed validation and was not applied
    #[error("Invalid label record: {0}")]
    InvalidRecord(String),
}
