//! Real-mode adapter: parallel per-task calls against an upstream
//! OpenAI-compatible chat-completions endpoint, with per-task mock fallback.

use async_trait::async_trait;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    mock_outcome, Batch, BatchOutcomes, EngineAdapter, EngineError, EngineMode, ResponseSource,
    TaskOutcome,
};
use crate::settings::EngineConfig;
use crate::task::Task;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct RealEngine {
    http: reqwest::Client,
    base_url: String,
    default_model: String,
    request_timeout: Duration,
    mock_fallback: bool,
}

impl RealEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base_url = config
            .real_vllm_url
            .clone()
            .ok_or_else(|| anyhow!("real engine requires REAL_VLLM_URL"))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| anyhow!("failed to build upstream HTTP client: {e}"))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: config.real_vllm_model.clone(),
            request_timeout: config.request_timeout(),
            mock_fallback: config.mock_fallback,
        })
    }

    async fn chat_completion(&self, task: &Task) -> Result<(String, u32), EngineError> {
        let model = if task.params.model.is_empty() {
            self.default_model.as_str()
        } else {
            task.params.model.as_str()
        };
        let body = ChatCompletionRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: &task.prompt,
            }],
            max_tokens: task.params.max_tokens,
            temperature: task.params.temperature,
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Upstream(format!(
                "upstream returned {status}: {body}"
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| EngineError::Malformed("response carried no choices".to_string()))?;

        let tokens = parsed
            .usage
            .and_then(|usage| usage.completion_tokens)
            .unwrap_or_else(|| super::whitespace_tokens(&content));

        Ok((content, tokens))
    }

    fn settle(
        &self,
        task: &Task,
        short_id: &str,
        result: Result<(String, u32), EngineError>,
    ) -> Result<TaskOutcome, EngineError> {
        match result {
            Ok((response, tokens_generated)) => Ok(TaskOutcome {
                response,
                tokens_generated,
                source: ResponseSource::Real,
            }),
            Err(e) if self.mock_fallback => {
                warn!(task_id = %task.task_id, error = %e, "upstream call failed, serving mock fallback");
                Ok(mock_outcome(task, short_id, ResponseSource::MockFallback))
            }
            Err(e) => Err(e),
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout
    } else {
        EngineError::Upstream(e.to_string())
    }
}

#[async_trait]
impl EngineAdapter for RealEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Real
    }

    async fn execute(&self, batch: &Batch) -> Result<BatchOutcomes, EngineError> {
        debug!(batch_id = %batch.batch_id, size = batch.size(), "dispatching batch upstream");

        // Per-task calls proceed in parallel within the batch; each settles
        // independently so one failure never drags down the rest.
        let calls = batch.tasks.iter().map(|task| self.chat_completion(task));
        let results = futures::future::join_all(calls).await;

        Ok(batch
            .tasks
            .iter()
            .zip(results)
            .map(|(task, result)| self.settle(task, batch.short_id(), result))
            .collect())
    }

    async fn health_probe(&self) -> Result<(), EngineError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Upstream(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }

    async fn models(&self) -> Result<Vec<String>, EngineError> {
        let result: Result<ModelList, EngineError> = async {
            let response = self
                .http
                .get(format!("{}/v1/models", self.base_url))
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            if !response.status().is_success() {
                return Err(EngineError::Upstream(format!(
                    "model list returned {}",
                    response.status()
                )));
            }
            response
                .json()
                .await
                .map_err(|e| EngineError::Malformed(e.to_string()))
        }
        .await;

        match result {
            Ok(list) => Ok(list.data.into_iter().map(|entry| entry.id).collect()),
            Err(e) if self.mock_fallback => {
                warn!(error = %e, "model list unavailable upstream, serving local default");
                Ok(vec![self.default_model.clone()])
            }
            Err(e) => Err(e),
        }
    }
}
