//! Integration tests for the scheduling core: batch coalescing, the
//! parallelism bound, real-mode fallback against a stub upstream, and the
//! shutdown drain.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use batchgate::{
    auth,
    batcher::Batcher,
    dispatcher::Dispatcher,
    engine::{Batch, BatchOutcomes, EngineAdapter, EngineError, EngineMode, ResponseSource},
    queue::PriorityQueue,
    server::Gateway,
    settings::{Settings, UserCredential},
    stats::StatsCollector,
    task::{GenerationParams, Priority, Task, TaskStore},
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::watch;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.jwt_secret = Some("integration-test-secret-0123456789abcdef".to_string());
    settings.auth.users = vec![UserCredential {
        username: "alice".to_string(),
        password_hash: auth::hash_password("wonderland").unwrap(),
    }];
    settings
}

fn submit_task(store: &TaskStore, queue: &PriorityQueue, priority: Priority, prompt: &str) -> String {
    let task = Task::new(
        "alice".to_string(),
        priority,
        prompt.to_string(),
        GenerationParams::default(),
    );
    let id = task.task_id.clone();
    store.create(task);
    queue.enqueue(id.clone(), priority).unwrap();
    id
}

/// Engine that records the peak number of concurrently executing batches.
struct ProbeEngine {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ProbeEngine {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EngineAdapter for ProbeEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Mock
    }

    async fn execute(&self, batch: &Batch) -> Result<BatchOutcomes, EngineError> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        Ok(batch
            .tasks
            .iter()
            .map(|task| {
                Ok(batchgate::engine::mock_outcome(
                    task,
                    batch.short_id(),
                    ResponseSource::Mock,
                ))
            })
            .collect())
    }

    async fn health_probe(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn concurrent_batches_never_exceed_the_bound() {
    let max_concurrent = 2;
    let queue = Arc::new(PriorityQueue::new(1_000));
    let store = Arc::new(TaskStore::new(Default::default()));
    let stats = Arc::new(StatsCollector::new());
    let engine = Arc::new(ProbeEngine::new());
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        store.clone(),
        stats.clone(),
        max_concurrent,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = batchgate::settings::BatchingConfig {
        max_batch_size: 1,
        batch_wait_timeout_seconds: 0.0,
        max_concurrent_batches: max_concurrent,
    };
    let ids: Vec<String> = (0..10)
        .map(|i| submit_task(&store, &queue, Priority::Normal, &format!("prompt {i}")))
        .collect();

    let batcher = Batcher::new(
        queue.clone(),
        store.clone(),
        dispatcher.clone(),
        config,
        shutdown_rx,
    );
    tokio::spawn(batcher.run());

    for id in &ids {
        store
            .wait_terminal(id, Duration::from_secs(10))
            .await
            .expect("task should settle");
    }
    shutdown_tx.send(true).unwrap();

    assert!(engine.peak.load(Ordering::SeqCst) <= max_concurrent);
    assert_eq!(stats.snapshot().total_completed, 10);
}

#[tokio::test]
async fn a_burst_within_the_window_coalesces_into_one_batch() {
    let queue = Arc::new(PriorityQueue::new(1_000));
    let store = Arc::new(TaskStore::new(Default::default()));
    let stats = Arc::new(StatsCollector::new());
    let engine = Arc::new(ProbeEngine::new());
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        store.clone(),
        stats.clone(),
        4,
    ));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let ids: Vec<String> = (0..8)
        .map(|i| submit_task(&store, &queue, Priority::Normal, &format!("prompt {i}")))
        .collect();

    let batcher = Batcher::new(
        queue.clone(),
        store.clone(),
        dispatcher,
        batchgate::settings::BatchingConfig::default(),
        shutdown_rx,
    );
    tokio::spawn(batcher.run());

    let mut batch_ids = std::collections::HashSet::new();
    for id in &ids {
        let task = store
            .wait_terminal(id, Duration::from_secs(10))
            .await
            .expect("task should settle");
        let result = task.result.unwrap();
        assert_eq!(result.batch_size, 8);
        batch_ids.insert(result.batch_id);
    }
    assert_eq!(batch_ids.len(), 1);
    assert_eq!(stats.snapshot().average_batch_size, 8.0);
}

/// Stub upstream that alternates between a valid chat completion and a 500.
fn stub_upstream(counter: Arc<AtomicUsize>) -> Router {
    async fn chat(
        State(counter): State<Arc<AtomicUsize>>,
        Json(_body): Json<Value>,
    ) -> axum::response::Response {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 0 {
            Json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "upstream says hi" } }],
                "usage": { "completion_tokens": 7 },
            }))
            .into_response()
        } else {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }

    Router::new()
        .route("/v1/chat/completions", post(chat))
        .with_state(counter)
}

async fn spawn_stub_upstream() -> String {
    let counter = Arc::new(AtomicUsize::new(0));
    let app = stub_upstream(counter);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn real_mode_falls_back_per_task_when_the_upstream_fails() {
    let upstream_url = spawn_stub_upstream().await;

    let mut settings = test_settings();
    settings.engine.use_real_vllm = true;
    settings.engine.real_vllm_url = Some(upstream_url);
    settings.engine.real_vllm_model = "stub-model".to_string();
    settings.engine.mock_fallback = true;

    let (_router, gateway) = Gateway::new(&settings).unwrap();
    gateway.start();

    let store = gateway.state.store.clone();
    let queue = gateway.state.queue.clone();
    let ids: Vec<String> = (0..6)
        .map(|i| submit_task(&store, &queue, Priority::Normal, &format!("prompt {i}")))
        .collect();

    let mut real = 0;
    let mut fallback = 0;
    for id in &ids {
        let task = store
            .wait_terminal(id, Duration::from_secs(10))
            .await
            .expect("task should settle");
        let result = task.result.expect("every task completes despite upstream errors");
        match result.source {
            ResponseSource::Real => {
                real += 1;
                assert_eq!(result.response, "upstream says hi");
                assert_eq!(result.tokens_generated, 7);
            }
            ResponseSource::MockFallback => {
                fallback += 1;
                assert!(result.response.starts_with("[Batched mock response "));
            }
            ResponseSource::Mock => panic!("real mode never reports plain mock"),
        }
    }

    // The stub alternates per request, so exactly half of the batch sees
    // real responses and half falls back.
    assert_eq!(real, 3);
    assert_eq!(fallback, 3);

    let snapshot = gateway.state.stats.snapshot();
    assert_eq!(snapshot.total_completed, 6);
    assert_eq!(snapshot.real_responses, 3);
    assert_eq!(snapshot.mock_responses, 3);
}

#[tokio::test]
async fn shutdown_fails_tasks_still_queued() {
    let mut settings = test_settings();
    settings.batching.max_batch_size = 1;
    settings.batching.max_concurrent_batches = 1;
    settings.engine.mock_base_latency_ms = 500;
    settings.engine.mock_per_item_latency_ms = 0;
    settings.server.shutdown_grace_seconds = 0;

    let (_router, gateway) = Gateway::new(&settings).unwrap();
    gateway.start();

    let store = gateway.state.store.clone();
    let queue = gateway.state.queue.clone();
    let ids: Vec<String> = (0..4)
        .map(|i| submit_task(&store, &queue, Priority::Normal, &format!("prompt {i}")))
        .collect();

    // Let the batcher claim the head of the queue, then pull the plug.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway.shutdown().await;

    let mut shutdown_failures = 0;
    for id in &ids {
        let task = store.get(id).unwrap();
        assert_ne!(
            task.status,
            batchgate::task::TaskStatus::Queued,
            "no task may remain queued after shutdown"
        );
        if task.error.as_deref() == Some("shutdown") {
            shutdown_failures += 1;
        }
    }
    assert!(shutdown_failures >= 1, "queued tasks must fail with reason 'shutdown'");
}
