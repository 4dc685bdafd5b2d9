//! Completion barrier for repository workers.
//!
//! Each worker holds a [`BarrierGuard`] for its whole lifetime. Dropping the
//! guard signals completion exactly once, whether the worker succeeded,
//! failed or panicked, and records what the worker reported.
//!
//! The barrier only says that every worker has finished producing. It says
//! nothing about the record queue: the pipeline still has to let the
//! aggregator drain the queue to empty after the barrier releases.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Step of a worker that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    Clone,
    Extract,
    /// The worker task ended without reporting (panic or cancellation)
    Task,
}

/// Accounting for one repository that finished its extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub repository_id: u64,
    pub repository: String,
    /// `false` when an existing working tree was reused
    pub cloned: bool,
    pub files_matched: usize,
    pub files_copied: usize,
    /// Matched files whose base name already existed in the output directory
    pub files_skipped_existing: usize,
    /// Matched files that could not be copied; no record is emitted for them
    pub copy_failures: usize,
    pub records_emitted: usize,
}

/// A repository whose worker stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub repository_id: u64,
    pub repository: String,
    pub stage: WorkerStage,
    pub message: String,
    /// Records already queued before the failure; these stay in the manifest
    pub records_emitted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub outcomes: Vec<WorkerOutcome>,
    pub failures: Vec<WorkerFailure>,
}

#[derive(Debug)]
struct BarrierState {
    remaining: usize,
    report: CompletionReport,
}

/// Releases once `expected` guards have been dropped.
#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    state: Arc<watch::Sender<BarrierState>>,
}

impl CompletionBarrier {
    pub fn new(expected: usize) -> Self {
        let (tx, _rx) = watch::channel(BarrierState {
            remaining: expected,
            report: CompletionReport::default(),
        });
        Self {
            state: Arc::new(tx),
        }
    }

    /// Workers that have not signaled yet.
    pub fn remaining(&self) -> usize {
        self.state.borrow().remaining
    }

    /// Creates the guard one worker signals through.
    pub fn arrival(&self, repository_id: u64, repository: impl Into<String>) -> BarrierGuard {
        BarrierGuard {
            barrier: self.clone(),
            repository_id,
            repository: repository.into(),
            result: None,
        }
    }

    /// Waits until every expected worker has signaled and returns what they reported.
    pub async fn wait(&self) -> CompletionReport {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        if let Ok(state) = rx.wait_for(|state| state.remaining == 0).await {
            return state.report.clone();
        }
        self.state.borrow().report.clone()
    }

    fn signal(&self, result: Result<WorkerOutcome, WorkerFailure>) {
        self.state.send_modify(|state| {
            if state.remaining == 0 {
                warn!("Completion signaled more times than expected");
            }
            state.remaining = state.remaining.saturating_sub(1);
            match result {
                Ok(outcome) => state.report.outcomes.push(outcome),
                Err(failure) => state.report.failures.push(failure),
            }
            debug!(remaining = state.remaining, "Worker signaled completion");
        });
    }
}

/// One worker's handle on the barrier; signals when dropped.
#[derive(Debug)]
pub struct BarrierGuard {
    barrier: CompletionBarrier,
    repository_id: u64,
    repository: String,
    result: Option<Result<WorkerOutcome, WorkerFailure>>,
}

impl BarrierGuard {
    pub fn succeed(&mut self, outcome: WorkerOutcome) {
        self.result = Some(Ok(outcome));
    }

    pub fn fail(&mut self, stage: WorkerStage, message: impl Into<String>, records_emitted: usize) {
        self.result = Some(Err(WorkerFailure {
            repository_id: self.repository_id,
            repository: self.repository.clone(),
            stage,
            message: message.into(),
            records_emitted,
        }));
    }
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            Err(WorkerFailure {
                repository_id: self.repository_id,
                repository: std::mem::take(&mut self.repository),
                stage: WorkerStage::Task,
                message: "worker exited without reporting".to_string(),
                records_emitted: 0,
            })
        });
        self.barrier.signal(result);
    }
}
