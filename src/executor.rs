use crate::harvest::barrier::{CompletionBarrier, CompletionReport, WorkerStage};
use crate::harvest::worker::RepositoryWorker;
use crate::model::{LabelRecord, RepositoryDescriptor};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

/// Spawns one task per repository, optionally capping how many run at once.
pub struct HarvesterExecutor {
    semaphore: Option<Arc<Semaphore>>,
}

impl HarvesterExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Some(Arc::new(Semaphore::new(concurrency_limit.max(1)))),
        }
    }

    /// Every repository starts work immediately.
    pub fn unbounded() -> Self {
        Self { semaphore: None }
    }

    #[instrument(skip_all, fields(repositories = repositories.len()))]
    pub fn spawn_all(
        &self,
        worker: Arc<RepositoryWorker>,
        repositories: Vec<RepositoryDescriptor>,
        tx: &mpsc::Sender<LabelRecord>,
    ) -> WorkerSet {
        let barrier = CompletionBarrier::new(repositories.len());
        let mut tasks = JoinSet::new();

        info!("Starting workers");

        for repository in repositories {
            // Taken before spawning so the barrier counts workers that never get to run.
            let mut guard = barrier.arrival(repository.id, repository.checkout_dir_name());
            let worker = Arc::clone(&worker);
            let tx = tx.clone();
            let semaphore = self.semaphore.clone();

            tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => match semaphore.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(e) => {
                            guard.fail(WorkerStage::Task, format!("Semaphore error: {}", e), 0);
                            return;
                        }
                    },
                    None => None,
                };
                worker.run(repository, tx, guard).await;
            });
        }

        WorkerSet { barrier, tasks }
    }
}

/// Workers spawned by one [`HarvesterExecutor::spawn_all`] call.
pub struct WorkerSet {
    barrier: CompletionBarrier,
    tasks: JoinSet<()>,
}

impl WorkerSet {
    /// Waits for the barrier, then reaps every task so their queue senders are gone.
    pub async fn wait(mut self) -> CompletionReport {
        let report = self.barrier.wait().await;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                debug!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(
            succeeded = report.outcomes.len(),
            failed = report.failures.len(),
            "All workers finished"
        );
        report
    }
}
