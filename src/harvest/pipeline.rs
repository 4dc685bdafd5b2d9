//! Harvest pipeline coordinator.
//!
//! [`HarvestPipeline`] runs one harvest end to end:
//! 1. **Discovery**: query the repository source (failure is fatal)
//! 2. **Catalog**: merge candidate lists into unique repositories
//! 3. **Workers**: clone and extract every repository concurrently
//! 4. **Aggregation**: apply label records as they arrive
//! 5. **Write**: persist the manifest
//!
//! Step 5 only starts after two separate conditions hold: every worker has
//! signaled the completion barrier, and the aggregator has drained the
//! record queue after its last sender was dropped.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::executor::HarvesterExecutor;
use crate::harvest::aggregator::{record_queue, spawn_aggregator, RECORD_QUEUE_CAPACITY};
use crate::harvest::barrier::{WorkerFailure, WorkerOutcome};
use crate::harvest::catalog::{CatalogBuilder, CatalogStats};
use crate::harvest::manifest::{ManifestWriter, RejectedRecord};
use crate::harvest::traits::{HarvestStage, ManifestError};
use crate::harvest::worker::RepositoryWorker;
use crate::traits::{discover_all, Cloner, DiscoveryError, RepositorySource, SearchQuery};

// ============================================================================
// Pipeline Types
// ============================================================================

/// Statistics about one harvest run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    /// Total time spent on the run (milliseconds)
    pub total_duration_ms: u64,

    /// Repositories handed to workers
    pub repositories: usize,

    /// Repositories cloned during this run
    pub cloned: usize,

    /// Repositories whose existing working tree was reused
    pub reused: usize,

    /// Repositories whose worker failed
    pub failed: usize,

    pub files_matched: usize,
    pub files_copied: usize,
    pub files_skipped_existing: usize,
    pub copy_failures: usize,
}

/// Everything a caller needs to report on a finished run.
#[derive(Debug)]
pub struct HarvestReport {
    pub catalog: CatalogStats,
    pub stats: HarvestStats,
    pub outcomes: Vec<WorkerOutcome>,
    pub failures: Vec<WorkerFailure>,
    pub rejected: Vec<RejectedRecord>,
    /// Why the labeled-data directory could not be created, if it could not.
    /// Every matched file then counts as a copy failure.
    pub output_dir_error: Option<String>,
    pub total_files: usize,
    pub total_authors: usize,
    pub total_projects: usize,
    pub manifest_path: PathBuf,
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Errors that abort a whole run.
///
/// Failures of a single repository are never reported here; they end up in
/// [`HarvestReport::failures`].
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Repository discovery failed
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Manifest could not be created or written
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The aggregator task did not complete
    #[error("Aggregator failed: {0}")]
    Aggregator(String),
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// End-to-end harvest of one target language.
///
/// # Example
///
/// ```ignore
/// use repo_harvester::harvest::pipeline::HarvestPipeline;
/// use std::sync::Arc;
///
/// let pipeline = HarvestPipeline::new(Arc::new(GitCli::new()), "repos", "labeled", "manifest.json", ".abap")
///     .with_language_filter("abap")
///     .with_concurrency_limit(16);
/// let report = pipeline.run(&search, &queries).await?;
/// println!("Labeled {} files", report.total_files);
/// ```
pub struct HarvestPipeline {
    cloner: Arc<dyn Cloner>,
    catalog: CatalogBuilder,
    writer: ManifestWriter,
    repo_root: PathBuf,
    output_dir: PathBuf,
    suffix: String,
    queue_capacity: usize,
    concurrency_limit: Option<usize>,
    clone_timeout: Option<Duration>,
}

impl HarvestPipeline {
    /// Creates a pipeline with no language filter, no concurrency cap and
    /// no clone timeout.
    pub fn new(
        cloner: Arc<dyn Cloner>,
        repo_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            cloner,
            catalog: CatalogBuilder::new(),
            writer: ManifestWriter::new(manifest_path),
            repo_root: repo_root.into(),
            output_dir: output_dir.into(),
            suffix: suffix.into(),
            queue_capacity: RECORD_QUEUE_CAPACITY,
            concurrency_limit: None,
            clone_timeout: None,
        }
    }

    pub fn from_config(config: &Config, cloner: Arc<dyn Cloner>) -> Self {
        let mut pipeline = Self::new(
            cloner,
            &config.repo_dir,
            &config.labeled_data_dir,
            &config.manifest_file,
            &config.file_suffix,
        )
        .with_language_filter(&config.language)
        .with_queue_capacity(config.queue_capacity);

        if let Some(limit) = config.max_concurrent_workers {
            pipeline = pipeline.with_concurrency_limit(limit);
        }
        if let Some(timeout) = config.worker_timeout {
            pipeline = pipeline.with_clone_timeout(timeout);
        }
        pipeline
    }

    /// Drops catalog entries whose reported language differs (ignoring case).
    pub fn with_language_filter(mut self, language: impl Into<String>) -> Self {
        self.catalog = CatalogBuilder::new().with_language_filter(language);
        self
    }

    pub fn without_language_filter(mut self) -> Self {
        self.catalog = CatalogBuilder::new();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = Some(timeout);
        self
    }

    pub fn manifest_path(&self) -> &Path {
        self.writer.path()
    }

    /// Discovers repositories through `source` and harvests them.
    ///
    /// # Errors
    ///
    /// Fails without writing anything if any discovery query fails.
    pub async fn run<S>(
        &self,
        source: &S,
        queries: &[SearchQuery],
    ) -> Result<HarvestReport, PipelineError>
    where
        S: RepositorySource + ?Sized,
    {
        let lists = discover_all(source, queries).await?;
        self.execute(lists).await
    }

    /// Harvests the repositories found in already-fetched candidate lists.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] only if the manifest cannot be written or the
    /// aggregator dies. Repository failures are reported in
    /// [`HarvestReport::failures`], an unusable labeled-data directory in
    /// [`HarvestReport::output_dir_error`].
    #[instrument(skip_all, fields(manifest = %self.writer.path().display()))]
    pub async fn execute(
        &self,
        candidate_lists: Vec<Vec<Value>>,
    ) -> Result<HarvestReport, PipelineError> {
        let start = Instant::now();

        // Fail before any cloning if the manifest cannot be written.
        self.writer.prepare()?;
        let (output_dir, output_dir_error) = match self.prepare_output_dir() {
            Ok(dir) => (dir, None),
            Err(e) => {
                warn!(
                    path = %self.output_dir.display(),
                    error = %e,
                    "Labeled-data directory unavailable, files will not be copied"
                );
                let dir = std::env::current_dir()
                    .map(|cwd| cwd.join(&self.output_dir))
                    .unwrap_or_else(|_| self.output_dir.clone());
                (dir, Some(e.to_string()))
            }
        };

        // ====================================================================
        // Catalog
        // ====================================================================

        let catalog = self
            .catalog
            .execute(candidate_lists)
            .unwrap_or_else(|never| match never {});

        // ====================================================================
        // Workers and aggregation
        // ====================================================================

        let mut worker = RepositoryWorker::new(
            Arc::clone(&self.cloner),
            &self.repo_root,
            output_dir,
            &self.suffix,
        );
        if let Some(timeout) = self.clone_timeout {
            worker = worker.with_clone_timeout(timeout);
        }
        let executor = match self.concurrency_limit {
            Some(limit) => HarvesterExecutor::new(limit),
            None => HarvesterExecutor::unbounded(),
        };

        let (tx, rx) = record_queue(self.queue_capacity);
        let aggregator = spawn_aggregator(rx);

        let workers = executor.spawn_all(Arc::new(worker), catalog.repositories, &tx);
        let completion = workers.wait().await;

        // Every worker has finished; closing the last sender lets the
        // aggregator drain what is still buffered and stop.
        drop(tx);
        let aggregate = aggregator.finish().await?;

        // ====================================================================
        // Write
        // ====================================================================

        let manifest = aggregate.state.into_manifest();
        let (total_files, total_authors, total_projects) = (
            manifest.total_files,
            manifest.total_authors,
            manifest.total_projects,
        );
        info!(stage = self.writer.stage_name(), files = total_files, "Writing manifest");
        let manifest_path = self.writer.execute(manifest)?;

        let mut stats = HarvestStats {
            repositories: completion.outcomes.len() + completion.failures.len(),
            failed: completion.failures.len(),
            ..Default::default()
        };
        for outcome in &completion.outcomes {
            if outcome.cloned {
                stats.cloned += 1;
            } else {
                stats.reused += 1;
            }
            stats.files_matched += outcome.files_matched;
            stats.files_copied += outcome.files_copied;
            stats.files_skipped_existing += outcome.files_skipped_existing;
            stats.copy_failures += outcome.copy_failures;
        }
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        for failure in &completion.failures {
            warn!(
                repository = %failure.repository,
                stage = ?failure.stage,
                error = %failure.message,
                "Repository failed"
            );
        }
        info!(
            duration_ms = stats.total_duration_ms,
            repositories = stats.repositories,
            failed = stats.failed,
            files = total_files,
            authors = total_authors,
            projects = total_projects,
            "Harvest completed"
        );

        Ok(HarvestReport {
            catalog: catalog.stats,
            stats,
            outcomes: completion.outcomes,
            failures: completion.failures,
            rejected: aggregate.rejected,
            output_dir_error,
            total_files,
            total_authors,
            total_projects,
            manifest_path,
        })
    }

    /// Creates the labeled-data directory and returns its absolute path.
    fn prepare_output_dir(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.output_dir.canonicalize()
    }
}

// ============================================================================
// Tests
// ============================================================================
