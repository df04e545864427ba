//! Bounded pool running batches concurrently and writing outcomes back.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::engine::{Batch, EngineAdapter, EngineError};
use crate::stats::StatsCollector;
use crate::task::{StatusPatch, TaskResult, TaskStatus, TaskStore};

/// Runs up to `max_concurrent_batches` batches in parallel. Each batch is a
/// spawned task holding one owned semaphore permit for its whole lifetime.
pub struct Dispatcher {
    engine: Arc<dyn EngineAdapter>,
    store: Arc<TaskStore>,
    stats: Arc<StatsCollector>,
    semaphore: Arc<Semaphore>,
    max_concurrent_batches: usize,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn EngineAdapter>,
        store: Arc<TaskStore>,
        stats: Arc<StatsCollector>,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            engine,
            store,
            stats,
            semaphore: Arc::new(Semaphore::new(max_concurrent_batches)),
            max_concurrent_batches,
        }
    }

    /// Blocks while `max_concurrent_batches` batches are already in flight.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        Ok(self.semaphore.clone().acquire_owned().await?)
    }

    /// Number of batches currently being dispatched.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_batches - self.semaphore.available_permits()
    }

    pub fn spawn_batch(&self, batch: Batch, permit: OwnedSemaphorePermit) {
        let engine = self.engine.clone();
        let store = self.store.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let _permit = permit;
            run_batch(engine.as_ref(), &store, &stats, batch).await;
        });
    }
}

async fn run_batch(
    engine: &dyn EngineAdapter,
    store: &TaskStore,
    stats: &StatsCollector,
    batch: Batch,
) {
    let size = batch.size();
    debug!(batch_id = %batch.batch_id, size, "executing batch");

    let execution = engine.execute(&batch).await;

    // One timestamp pair settles every task in the batch.
    let completed_at = Utc::now();
    let monotonic_end = Instant::now();

    let mut completed = 0u64;
    let mut failed = 0u64;

    match execution {
        Ok(outcomes) if outcomes.len() == size => {
            for (task, outcome) in batch.tasks.iter().zip(outcomes) {
                let patch = match outcome {
                    Ok(outcome) => {
                        completed += 1;
                        stats.record_source(outcome.source);
                        StatusPatch::Completed {
                            completed_at,
                            monotonic_end,
                            result: TaskResult {
                                response: outcome.response,
                                tokens_generated: outcome.tokens_generated,
                                batch_id: batch.batch_id.clone(),
                                batch_size: size,
                                source: outcome.source,
                            },
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        StatusPatch::Failed {
                            completed_at,
                            monotonic_end,
                            error: e.to_string(),
                        }
                    }
                };
                settle(store, &task.task_id, patch);
            }
        }
        Ok(outcomes) => {
            // Outcome-count mismatch is an adapter contract violation and
            // fails the whole batch.
            let reason = EngineError::Malformed(format!(
                "adapter returned {} outcomes for {} tasks",
                outcomes.len(),
                size
            ))
            .to_string();
            failed += size as u64;
            fail_batch(store, &batch, completed_at, monotonic_end, &reason);
        }
        Err(e) => {
            failed += size as u64;
            fail_batch(store, &batch, completed_at, monotonic_end, &e.to_string());
        }
    }

    stats.record_batch(size);
    stats.record_completed(completed);
    stats.record_failed(failed);

    debug!(batch_id = %batch.batch_id, completed, failed, "batch settled");
}

fn fail_batch(
    store: &TaskStore,
    batch: &Batch,
    completed_at: chrono::DateTime<Utc>,
    monotonic_end: Instant,
    reason: &str,
) {
    error!(batch_id = %batch.batch_id, reason, "adapter-level failure, failing whole batch");
    for task in &batch.tasks {
        settle(
            store,
            &task.task_id,
            StatusPatch::Failed {
                completed_at,
                monotonic_end,
                error: reason.to_string(),
            },
        );
    }
}

fn settle(store: &TaskStore, task_id: &str, patch: StatusPatch) {
    if let Err(e) = store.transition(task_id, TaskStatus::Processing, patch) {
        // Should be unreachable: the dispatcher is the only terminal writer.
        error!(task_id, error = %e, "failed to settle task");
    }
}
