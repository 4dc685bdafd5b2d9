//! Manifest aggregator: the single consumer of label records.
//!
//! Workers never touch [`ManifestState`]; they send [`LabelRecord`]s through a
//! bounded queue and the aggregator task applies them one at a time.
//!
//! ```text
//! worker ─┐
//! worker ─┼─► record queue (bounded) ─► aggregator task ─► ManifestState
//! worker ─┘
//! ```
//!
//! The task keeps receiving until the queue is closed, which happens only
//! once every sender has been dropped, and then drains whatever is still
//! buffered. Records queued just before the last worker finished are
//! therefore always applied.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::harvest::manifest::{ManifestState, RejectedRecord};
use crate::harvest::pipeline::PipelineError;
use crate::model::LabelRecord;

/// Default capacity of the record queue.
pub const RECORD_QUEUE_CAPACITY: usize = 255;

/// Creates the bounded queue between workers and the aggregator.
pub fn record_queue(
    capacity: usize,
) -> (mpsc::Sender<LabelRecord>, mpsc::Receiver<LabelRecord>) {
    mpsc::channel(capacity.max(1))
}

/// Final state handed back by the aggregator task.
#[derive(Debug, Default)]
pub struct AggregateResult {
    pub state: ManifestState,
    pub rejected: Vec<RejectedRecord>,
}

/// Handle on a running aggregator task.
#[derive(Debug)]
pub struct AggregatorHandle {
    handle: JoinHandle<AggregateResult>,
}

impl AggregatorHandle {
    /// Waits for the task to drain the queue and returns the final state.
    ///
    /// Only returns once every sender of the queue has been dropped.
    pub async fn finish(self) -> Result<AggregateResult, PipelineError> {
        self.handle.await.map_err(|e| {
            let reason = if e.is_panic() {
                let payload = e.into_panic();
                if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                }
            } else {
                format!("task failed: {}", e)
            };
            PipelineError::Aggregator(reason)
        })
    }
}

/// Spawns the aggregator task consuming `rx`.
pub fn spawn_aggregator(mut rx: mpsc::Receiver<LabelRecord>) -> AggregatorHandle {
    let handle = tokio::spawn(async move {
        let mut result = AggregateResult::default();
        debug!("Aggregator started");

        while let Some(record) = rx.recv().await {
            if let Err(rejected) = result.state.apply(record) {
                warn!(
                    project = %rejected.record.project_name,
                    file = %rejected.record.file_ref.display(),
                    reason = %rejected.reason,
                    "Rejected label record"
                );
                result.rejected.push(rejected);
            }
        }

        debug!(
            files = result.state.total_files(),
            rejected = result.rejected.len(),
            "Record queue closed and drained"
        );
        result
    });

    AggregatorHandle { handle }
}
