//! Deterministic mock engine with simulated batch latency.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    mock_outcome, Batch, BatchOutcomes, EngineAdapter, EngineError, EngineMode, ResponseSource,
};
use crate::settings::EngineConfig;

pub struct MockEngine {
    base_latency: Duration,
    per_item_latency: Duration,
    default_model: String,
}

impl MockEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            base_latency: Duration::from_millis(config.mock_base_latency_ms),
            per_item_latency: Duration::from_millis(config.mock_per_item_latency_ms),
            default_model: config.real_vllm_model.clone(),
        }
    }
}

#[async_trait]
impl EngineAdapter for MockEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Mock
    }

    async fn execute(&self, batch: &Batch) -> Result<BatchOutcomes, EngineError> {
        // Simulated GPU time grows with batch size; the sleep is cooperative
        // so other in-flight batches keep making progress.
        let latency = self.base_latency + self.per_item_latency * batch.size() as u32;
        tokio::time::sleep(latency).await;

        Ok(batch
            .tasks
            .iter()
            .map(|task| Ok(mock_outcome(task, batch.short_id(), ResponseSource::Mock)))
            .collect())
    }

    async fn health_probe(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec![self.default_model.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{GenerationParams, Priority, Task};

    fn engine(base_ms: u64, per_item_ms: u64) -> MockEngine {
        MockEngine::new(&EngineConfig {
            mock_base_latency_ms: base_ms,
            mock_per_item_latency_ms: per_item_ms,
            ..EngineConfig::default()
        })
    }

    fn batch_of(prompts: &[&str]) -> Batch {
        Batch::new(
            prompts
                .iter()
                .map(|p| {
                    Task::new(
                        "alice".to_string(),
                        Priority::Normal,
                        p.to_string(),
                        GenerationParams::default(),
                    )
                })
                .collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn latency_scales_with_batch_size() {
        let engine = engine(500, 50);
        let batch = batch_of(&["a", "b", "c", "d"]);

        let before = tokio::time::Instant::now();
        let outcomes = engine.execute(&batch).await.unwrap();
        let elapsed = before.elapsed();

        assert_eq!(outcomes.len(), 4);
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn every_task_gets_a_deterministic_mock_response() {
        let engine = engine(0, 0);
        let batch = batch_of(&["first prompt", "second prompt"]);

        let outcomes = engine.execute(&batch).await.unwrap();
        for (task, outcome) in batch.tasks.iter().zip(&outcomes) {
            let outcome = outcome.as_ref().unwrap();
            assert!(outcome
                .response
                .starts_with(&format!("[Batched mock response {}]", batch.short_id())));
            assert!(outcome.response.ends_with(&task.prompt));
            assert_eq!(outcome.source, ResponseSource::Mock);
        }
    }
}
