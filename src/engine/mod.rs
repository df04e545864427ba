//! Engine Adapter: translates batches into upstream calls (real mode) or
//! deterministic simulated responses (mock mode).
//!
//! The mode is a one-time construction decision; a real-mode adapter never
//! degrades to pure mock mode, only per-task fallbacks occur.

pub mod mock;
pub mod real;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::EngineConfig;
use crate::task::Task;

/// An ordered group of claimed tasks submitted to the adapter in one
/// invocation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: String,
    pub tasks: Vec<Task>,
    pub formed_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            tasks,
            formed_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// First eight characters of the batch id, embedded in mock responses.
    pub fn short_id(&self) -> &str {
        &self.batch_id[..8]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Mock,
    Real,
}

/// Where a task's response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseSource {
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "mock")]
    Mock,
    #[serde(rename = "mock-fallback")]
    MockFallback,
}

/// Per-task adapter output. `batch_id` and `batch_size` are attached by the
/// dispatcher, not here.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub response: String,
    pub tokens_generated: u32,
    pub source: ResponseSource,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("timeout")]
    Timeout,

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// One outcome slot per task, in batch order. A per-task `Err` fails only
/// that task; an adapter-level `Err` from [`EngineAdapter::execute`] fails
/// the whole batch.
pub type BatchOutcomes = Vec<Result<TaskOutcome, EngineError>>;

#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn mode(&self) -> EngineMode;

    async fn execute(&self, batch: &Batch) -> Result<BatchOutcomes, EngineError>;

    /// Startup probe; a failure is logged and does not prevent serving.
    async fn health_probe(&self) -> Result<(), EngineError>;

    /// Model ids backing `GET /v1/models`.
    async fn models(&self) -> Result<Vec<String>, EngineError>;
}

/// Deterministic simulated completion shared by the mock adapter and the
/// real adapter's per-task fallback.
pub fn mock_outcome(task: &Task, short_id: &str, source: ResponseSource) -> TaskOutcome {
    let prompt_tokens = whitespace_tokens(&task.prompt);
    TaskOutcome {
        response: format!(
            "[Batched mock response {short_id}] Mock response to: {}",
            task.prompt
        ),
        tokens_generated: (prompt_tokens * 2).min(task.params.max_tokens),
        source,
    }
}

/// Whitespace token count used for simulated usage accounting.
pub fn whitespace_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Construct the adapter chosen by configuration.
pub fn build_engine(config: &EngineConfig) -> Result<std::sync::Arc<dyn EngineAdapter>> {
    if config.use_real_vllm {
        Ok(std::sync::Arc::new(real::RealEngine::new(config)?))
    } else {
        Ok(std::sync::Arc::new(mock::MockEngine::new(config)))
    }
}
