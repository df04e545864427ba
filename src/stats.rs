//! Running counters for requests, batches, and completions.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::ResponseSource;

/// Monotonic counters updated by the HTTP surface and the dispatcher.
/// `average_batch_size` is derived at snapshot time.
#[derive(Default)]
pub struct StatsCollector {
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    batch_size_sum: AtomicU64,
    largest_batch: AtomicU64,
    mock_responses: AtomicU64,
    real_responses: AtomicU64,
    batch_size_distribution: Mutex<BTreeMap<usize, u64>>,
}

/// Read-only view exposed at `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_batches: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub average_batch_size: f64,
    pub largest_batch: u64,
    pub mock_responses: u64,
    pub real_responses: u64,
    pub batch_size_distribution: BTreeMap<usize, u64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_requests(&self, count: u64) {
        self.total_requests.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch(&self, size: usize) {
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.batch_size_sum.fetch_add(size as u64, Ordering::Relaxed);
        self.largest_batch.fetch_max(size as u64, Ordering::Relaxed);
        *self.batch_size_distribution.lock().entry(size).or_insert(0) += 1;
    }

    pub fn record_completed(&self, count: u64) {
        self.total_completed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.total_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_source(&self, source: ResponseSource) {
        match source {
            ResponseSource::Real => self.real_responses.fetch_add(1, Ordering::Relaxed),
            ResponseSource::Mock | ResponseSource::MockFallback => {
                self.mock_responses.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_batches = self.total_batches.load(Ordering::Relaxed);
        let batch_size_sum = self.batch_size_sum.load(Ordering::Relaxed);
        let average_batch_size = if total_batches == 0 {
            0.0
        } else {
            batch_size_sum as f64 / total_batches as f64
        };

        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_batches,
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            average_batch_size,
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
            mock_responses: self.mock_responses.load(Ordering::Relaxed),
            real_responses: self.real_responses.load(Ordering::Relaxed),
            batch_size_distribution: self.batch_size_distribution.lock().clone(),
        }
    }
}
