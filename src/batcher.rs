//! Single cooperative batch-formation loop.
//!
//! Exactly one batcher runs process-wide; a second loop would violate
//! batch-formation ordering and the single-claim invariant.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::engine::Batch;
use crate::queue::PriorityQueue;
use crate::settings::BatchingConfig;
use crate::task::{StatusPatch, TaskStatus, TaskStore};

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Batcher {
    queue: Arc<PriorityQueue>,
    store: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
    config: BatchingConfig,
    shutdown: watch::Receiver<bool>,
}

impl Batcher {
    pub fn new(
        queue: Arc<PriorityQueue>,
        store: Arc<TaskStore>,
        dispatcher: Arc<Dispatcher>,
        config: BatchingConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Run until shutdown is signaled. The loop never exits on handled
    /// errors; unexpected ones are logged and followed by a short backoff.
    pub async fn run(mut self) {
        info!(
            max_batch_size = self.config.max_batch_size,
            batch_wait_ms = self.config.batch_wait_timeout().as_millis() as u64,
            max_concurrent_batches = self.config.max_concurrent_batches,
            "batcher started"
        );

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.queue.wait_nonempty() => {}
            }

            if let Err(e) = self.form_and_dispatch().await {
                error!(error = %e, "batcher iteration failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }

        info!("batcher stopped");
    }

    /// Form one batch under the size and time bounds and hand it to the
    /// dispatcher. The wait window is measured from the instant the first
    /// task entered the forming batch, so a steady stream of arrivals cannot
    /// defer dispatch indefinitely.
    async fn form_and_dispatch(&self) -> Result<()> {
        let window_start = Instant::now();
        let max = self.config.max_batch_size;
        let wait_timeout = self.config.batch_wait_timeout();

        let mut task_ids = self.queue.drain_up_to(max);
        if task_ids.is_empty() {
            return Ok(());
        }

        while task_ids.len() < max {
            let remaining = wait_timeout.saturating_sub(window_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            if !self.queue.await_nonempty(remaining).await {
                break;
            }
            task_ids.extend(self.queue.drain_up_to(max - task_ids.len()));
        }

        // Claim: exactly one batcher iteration moves each task out of
        // `queued`, so duplicate dispatch is impossible.
        let started_at = Utc::now();
        let monotonic = Instant::now();
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            match self.store.transition(
                &task_id,
                TaskStatus::Queued,
                StatusPatch::Processing {
                    started_at,
                    monotonic,
                },
            ) {
                Ok(claimed) => tasks.push(claimed),
                Err(e) => warn!(task_id = %task_id, error = %e, "skipping task that failed the claim"),
            }
        }

        if tasks.is_empty() {
            return Ok(());
        }

        let batch = Batch::new(tasks);
        debug!(
            batch_id = %batch.batch_id,
            size = batch.size(),
            waited_ms = window_start.elapsed().as_millis() as u64,
            "formed batch"
        );

        // Blocks while the dispatcher pool is saturated.
        let permit = self.dispatcher.acquire_slot().await?;
        self.dispatcher.spawn_batch(batch, permit);
        Ok(())
    }
}
