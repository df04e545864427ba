//! HTTP server: request validation, authentication, task submission,
//! status/list, batching observability, and OpenAI-compatible passthroughs.

use anyhow::{anyhow, Result};
use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    middleware,
    response::Json,
    routing::{get, post},
    Extension, Form, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{auth_middleware, CredentialVerifier, Principal},
    batcher::Batcher,
    dispatcher::Dispatcher,
    engine::{build_engine, whitespace_tokens, EngineAdapter},
    error::ApiError,
    middleware::{
        create_body_limit_layer, create_cors_layer, create_rate_limiter, rate_limit_middleware,
        security_headers_middleware, AppRateLimiter,
    },
    queue::PriorityQueue,
    settings::Settings,
    stats::StatsCollector,
    task::{GenerationParams, Priority, StatusPatch, Task, TaskStatus, TaskStore},
};

/// Application state shared across HTTP handlers. Every collaborator is
/// owned here and constructed once; background loops are launched from the
/// [`Gateway`] and tied to its shutdown signal.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<CredentialVerifier>,
    pub store: Arc<TaskStore>,
    pub queue: Arc<PriorityQueue>,
    pub stats: Arc<StatsCollector>,
    pub engine: Arc<dyn EngineAdapter>,
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limiter: Arc<AppRateLimiter>,
    pub settings: Settings,
    pub start_time: Instant,
}

/// JSON extractor that maps every body rejection (malformed JSON, unknown
/// fields, wrong types) to the 400 contract instead of axum's default 422.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Body accepted by the native submission endpoints. The parameter set is
/// closed: unknown keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferenceRequest {
    pub prompt: String,
    pub priority: Option<Priority>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    role: String,
    content: String,
}

/// OpenAI-compatible chat body. Deliberately lenient: stock clients send
/// fields like `stream` and `top_p` that are accepted and ignored.
#[derive(Debug, Deserialize)]
struct ChatCompletionsBody {
    model: Option<String>,
    messages: Vec<ChatMessageBody>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionsBody {
    model: Option<String>,
    prompt: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

/// Create the HTTP router with all endpoints and middleware layers.
pub fn create_router(state: AppState) -> Router {
    let cors_layer = create_cors_layer(&state.settings.server);
    let body_limit_layer = create_body_limit_layer(state.settings.server.max_request_size_mb);

    let public_routes = Router::new()
        .route("/token", post(issue_token))
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/v1/chat/completions", post(v1_chat_completions))
        .route("/v1/completions", post(v1_completions))
        .route("/v1/models", get(v1_models));

    let protected_routes = Router::new()
        .route("/inference/async", post(submit_async))
        .route("/inference/batch", post(submit_batch))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .layer(middleware::from_fn_with_state(
            state.verifier.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors_layer)
        .layer(body_limit_layer)
        .layer(TraceLayer::new_for_http())
}

/// Login endpoint: form-encoded credentials in, bearer token out.
async fn issue_token(
    State(state): State<AppState>,
    Form(request): Form<TokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = state.verifier.issue(&request.username, &request.password)?;
    info!(username = %request.username, "issued bearer token");
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

/// Submit one asynchronous inference task.
async fn submit_async(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidatedJson(request): ValidatedJson<InferenceRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_request(&request, &state)?;

    let task = build_task(principal.0, &request, &state);
    let task_id = task.task_id.clone();
    let priority = task.priority;

    state.store.create(task);
    if let Err(e) = state.queue.enqueue(task_id.clone(), priority) {
        // Roll the record back so a rejected submission leaves no trace.
        state.store.remove(&task_id);
        debug!(error = %e, "rejecting submission, queue full");
        return Err(queue_full(&state));
    }
    state.stats.record_requests(1);

    Ok(Json(json!({ "task_id": task_id, "status": "queued" })))
}

/// Submit an array of inference tasks. All-or-nothing: one invalid item
/// rejects the whole submission, and admission to the queue is atomic.
async fn submit_batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ValidatedJson(requests): ValidatedJson<Vec<InferenceRequest>>,
) -> Result<Json<Value>, ApiError> {
    let cap = state.settings.limits.max_batch_request_items;
    if requests.is_empty() || requests.len() > cap {
        return Err(ApiError::Validation(format!(
            "batch must contain between 1 and {cap} requests, got {}",
            requests.len()
        )));
    }
    for (index, request) in requests.iter().enumerate() {
        validate_request(request, &state)
            .map_err(|e| ApiError::Validation(format!("request {index}: {e}")))?;
    }

    let tasks: Vec<Task> = requests
        .iter()
        .map(|request| build_task(principal.0.clone(), request, &state))
        .collect();
    let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
    let items: Vec<(String, Priority)> = tasks
        .iter()
        .map(|t| (t.task_id.clone(), t.priority))
        .collect();

    for task in tasks {
        state.store.create(task);
    }
    if state.queue.enqueue_many(items).is_err() {
        for task_id in &task_ids {
            state.store.remove(task_id);
        }
        return Err(queue_full(&state));
    }
    state.stats.record_requests(task_ids.len() as u64);

    Ok(Json(json!({
        "count": task_ids.len(),
        "task_ids": task_ids,
    })))
}

/// Fetch the full task record.
async fn get_task(
    State(state): State<AppState>,
    Extension(_principal): Extension<Principal>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task '{task_id}' not found")))
}

/// Most recent tasks for the authenticated principal.
async fn list_tasks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 100);
    let tasks = state.store.list(&principal.0, limit);
    Ok(Json(json!({
        "count": tasks.len(),
        "tasks": tasks,
    })))
}

/// Liveness plus batching observability; always 200 while the process runs.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "mode": state.engine.mode(),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "batching": {
            "config": {
                "max_batch_size": state.settings.batching.max_batch_size,
                "batch_wait_timeout": state.settings.batching.batch_wait_timeout_seconds,
                "max_concurrent_batches": state.settings.batching.max_concurrent_batches,
            },
            "depth": state.queue.depth(),
            "in_flight_batches": state.dispatcher.in_flight(),
        },
    }))
}

async fn get_stats(State(state): State<AppState>) -> Json<crate::stats::StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// OpenAI-compatible chat completions. The request rides the same queue,
/// batcher, and dispatcher as the native endpoints in both modes.
async fn v1_chat_completions(
    State(state): State<AppState>,
    ValidatedJson(body): ValidatedJson<ChatCompletionsBody>,
) -> Result<Json<Value>, ApiError> {
    let prompt = body
        .messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.clone())
        .ok_or_else(|| ApiError::Validation("messages must include a user message".to_string()))?;

    let request = InferenceRequest {
        prompt,
        priority: None,
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        model: body.model,
    };
    let task = submit_and_wait(&state, request).await?;
    let result = task
        .result
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow!("completed task missing result")))?;
    let prompt_tokens = whitespace_tokens(&task.prompt);

    Ok(Json(json!({
        "id": format!("chatcmpl-{}", task.task_id),
        "object": "chat.completion",
        "created": task.completed_at.unwrap_or_else(Utc::now).timestamp(),
        "model": task.params.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": result.response },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": result.tokens_generated,
            "total_tokens": prompt_tokens + result.tokens_generated,
        },
    })))
}

/// OpenAI-compatible text completions.
async fn v1_completions(
    State(state): State<AppState>,
    ValidatedJson(body): ValidatedJson<CompletionsBody>,
) -> Result<Json<Value>, ApiError> {
    let request = InferenceRequest {
        prompt: body.prompt,
        priority: None,
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        model: body.model,
    };
    let task = submit_and_wait(&state, request).await?;
    let result = task
        .result
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow!("completed task missing result")))?;
    let prompt_tokens = whitespace_tokens(&task.prompt);

    Ok(Json(json!({
        "id": format!("cmpl-{}", task.task_id),
        "object": "text_completion",
        "created": task.completed_at.unwrap_or_else(Utc::now).timestamp(),
        "model": task.params.model,
        "choices": [{
            "index": 0,
            "text": result.response,
            "logprobs": null,
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": result.tokens_generated,
            "total_tokens": prompt_tokens + result.tokens_generated,
        },
    })))
}

async fn v1_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state
        .engine
        .models()
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    let created = Utc::now().timestamp();

    Ok(Json(json!({
        "object": "list",
        "data": models
            .into_iter()
            .map(|id| json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "batchgate",
            }))
            .collect::<Vec<_>>(),
    })))
}

/// Enqueue a request and block until its task settles. Shared by the
/// synchronous `/v1/*` passthroughs.
async fn submit_and_wait(state: &AppState, request: InferenceRequest) -> Result<Task, ApiError> {
    validate_request(&request, state)?;

    let task = build_task("openai-proxy".to_string(), &request, state);
    let task_id = task.task_id.clone();
    let priority = task.priority;

    state.store.create(task);
    if state.queue.enqueue(task_id.clone(), priority).is_err() {
        state.store.remove(&task_id);
        return Err(queue_full(state));
    }
    state.stats.record_requests(1);

    // Upstream timeout plus slack for queueing and batch formation.
    let wait = state.settings.engine.request_timeout() + Duration::from_secs(30);
    let task = state
        .store
        .wait_terminal(&task_id, wait)
        .await
        .ok_or_else(|| ApiError::Upstream("timed out waiting for completion".to_string()))?;

    match task.status {
        TaskStatus::Completed => Ok(task),
        TaskStatus::Failed => Err(ApiError::Upstream(
            task.error.unwrap_or_else(|| "inference failed".to_string()),
        )),
        other => Err(ApiError::Internal(anyhow!(
            "wait_terminal returned non-terminal status {other:?}"
        ))),
    }
}

fn validate_request(request: &InferenceRequest, state: &AppState) -> Result<(), ApiError> {
    let limits = &state.settings.limits;
    if request.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".to_string()));
    }
    if request.prompt.chars().count() > limits.max_prompt_chars {
        return Err(ApiError::Validation(format!(
            "prompt exceeds the maximum length of {} characters",
            limits.max_prompt_chars
        )));
    }
    if let Some(max_tokens) = request.max_tokens {
        if !(1..=4096).contains(&max_tokens) {
            return Err(ApiError::Validation(
                "max_tokens must be between 1 and 4096".to_string(),
            ));
        }
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ApiError::Validation(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
    }
    Ok(())
}

fn build_task(principal: String, request: &InferenceRequest, state: &AppState) -> Task {
    let params = GenerationParams {
        max_tokens: request.max_tokens.unwrap_or(100),
        temperature: request.temperature.unwrap_or(0.7),
        model: request
            .model
            .clone()
            .unwrap_or_else(|| state.settings.engine.real_vllm_model.clone()),
    };
    Task::new(
        principal,
        request.priority.unwrap_or_default(),
        request.prompt.clone(),
        params,
    )
}

fn queue_full(state: &AppState) -> ApiError {
    ApiError::QueueFull {
        retry_after_seconds: state.settings.queue.retry_after_seconds,
    }
}

/// The service root: owns every collaborator and the shutdown signal.
pub struct Gateway {
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    /// Construct all collaborators and the router. Background workers are
    /// not running until [`Gateway::start`].
    pub fn new(settings: &Settings) -> Result<(Router, Gateway)> {
        let verifier = Arc::new(CredentialVerifier::new(&settings.auth)?);
        let store = Arc::new(TaskStore::new(settings.retention.clone()));
        let queue = Arc::new(PriorityQueue::new(settings.queue.max_depth));
        let stats = Arc::new(StatsCollector::new());
        let engine = build_engine(&settings.engine)?;
        let dispatcher = Arc::new(Dispatcher::new(
            engine.clone(),
            store.clone(),
            stats.clone(),
            settings.batching.max_concurrent_batches,
        ));
        let rate_limiter = create_rate_limiter(&settings.server);
        let (shutdown_tx, _) = watch::channel(false);

        let state = AppState {
            verifier,
            store,
            queue,
            stats,
            engine,
            dispatcher,
            rate_limiter,
            settings: settings.clone(),
            start_time: Instant::now(),
        };
        let router = create_router(state.clone());

        Ok((router, Gateway { state, shutdown_tx }))
    }

    /// Launch the batcher, the eviction loop, and the startup health probe.
    pub fn start(&self) {
        let batcher = Batcher::new(
            self.state.queue.clone(),
            self.state.store.clone(),
            self.state.dispatcher.clone(),
            self.state.settings.batching.clone(),
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(batcher.run());

        let store = self.state.store.clone();
        let interval = Duration::from_secs(self.state.settings.retention.evict_interval_seconds);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let evicted = store.evict();
                        if evicted > 0 {
                            debug!(evicted, "evicted retained tasks");
                        }
                    }
                }
            }
        });

        let engine = self.state.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.health_probe().await {
                // The gateway still serves; real mode degrades to per-task
                // fallbacks until the upstream recovers.
                warn!(error = %e, "engine health probe failed at startup");
            }
        });
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop accepting drains, give in-flight batches the grace period, then
    /// fail everything still queued with reason "shutdown".
    pub async fn shutdown(&self) {
        self.trigger_shutdown();

        let grace = Duration::from_secs(self.state.settings.server.shutdown_grace_seconds);
        let deadline = Instant::now() + grace;
        while self.state.dispatcher.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let completed_at = Utc::now();
        let monotonic_end = Instant::now();
        let abandoned = self.state.queue.drain_all();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "failing tasks still queued at shutdown");
        }
        for task_id in abandoned {
            let patch = StatusPatch::Failed {
                completed_at,
                monotonic_end,
                error: "shutdown".to_string(),
            };
            match self
                .state
                .store
                .transition(&task_id, TaskStatus::Queued, patch)
            {
                Ok(_) => self.state.stats.record_failed(1),
                Err(e) => error!(task_id = %task_id, error = %e, "failed to mark abandoned task"),
            }
        }

        info!("gateway shutdown complete");
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Start the HTTP server and run until a shutdown signal arrives.
pub async fn serve(settings: &Settings) -> Result<(), ServeError> {
    let (router, gateway) = Gateway::new(settings)?;
    gateway.start();

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(mode = ?gateway.state.engine.mode(), "gateway listening on {addr}");

    let signal_tx = gateway.shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = signal_tx.send(true);
    });

    let mut shutdown_rx = gateway.shutdown_signal();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .map_err(|e| ServeError::Other(anyhow!("HTTP server error: {e}")))?;

    gateway.shutdown().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down gracefully");
    }
}
