//! Task model and the in-memory task store.
//!
//! A task advances strictly along `queued → processing → {completed, failed}`.
//! The batcher is the only writer of the `processing` transition and the
//! dispatcher the only writer of terminal states; HTTP readers never mutate.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::engine::ResponseSource;
use crate::settings::RetentionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Bounded generation parameters; unknown keys are rejected at the HTTP
/// boundary, range checks happen during request validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub model: String,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            model: "mock-model".to_string(),
        }
    }
}

/// Successful outcome attached to a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub response: String,
    pub tokens_generated: u32,
    pub batch_id: String,
    pub batch_size: usize,
    pub source: ResponseSource,
}

/// The unit of work tracked from submission to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub principal: String,
    pub priority: Priority,
    pub prompt: String,
    #[serde(flatten)]
    pub params: GenerationParams,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between the processing and terminal transitions, measured on
    /// the monotonic clock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    started_monotonic: Option<Instant>,
}

impl Task {
    pub fn new(
        principal: String,
        priority: Priority,
        prompt: String,
        params: GenerationParams,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            principal,
            priority,
            prompt,
            params,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time: None,
            result: None,
            error: None,
            started_monotonic: None,
        }
    }
}

/// State-and-data for a conditional transition; the target state is implied
/// by the variant.
#[derive(Debug)]
pub enum StatusPatch {
    Processing {
        started_at: DateTime<Utc>,
        monotonic: Instant,
    },
    Completed {
        completed_at: DateTime<Utc>,
        monotonic_end: Instant,
        result: TaskResult,
    },
    Failed {
        completed_at: DateTime<Utc>,
        monotonic_end: Instant,
        error: String,
    },
}

impl StatusPatch {
    fn target(&self) -> TaskStatus {
        match self {
            Self::Processing { .. } => TaskStatus::Processing,
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task '{0}' not found")]
    NotFound(String),

    /// Current status did not match the expected source state. A programmer
    /// error: the single-claim discipline should make this unreachable.
    #[error("stale transition on task '{task_id}': expected {expected:?}, found {actual:?}")]
    StaleTransition {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },
}

/// In-memory mapping from task id to task record with bounded retention.
pub struct TaskStore {
    tasks: DashMap<String, Task>,
    terminal_notify: Notify,
    retention: RetentionConfig,
}

impl TaskStore {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            terminal_notify: Notify::new(),
            retention,
        }
    }

    pub fn create(&self, task: Task) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|entry| entry.clone())
    }

    /// Remove a record outright. Only used to roll back a submission whose
    /// enqueue failed; never called for claimed tasks.
    pub fn remove(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Most recent tasks for a principal, `created_at` descending, bounded.
    pub fn list(&self, principal: &str, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.principal == principal)
            .map(|entry| entry.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    /// Conditionally advance a task. The transition applies only when the
    /// current status equals `from`; a mismatch is a [`StoreError`], never a
    /// user-visible failure. Returns the updated record.
    pub fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        patch: StatusPatch,
    ) -> Result<Task, StoreError> {
        let updated = {
            let mut entry = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

            if entry.status != from {
                return Err(StoreError::StaleTransition {
                    task_id: task_id.to_string(),
                    expected: from,
                    actual: entry.status,
                });
            }

            entry.status = patch.target();
            match patch {
                StatusPatch::Processing {
                    started_at,
                    monotonic,
                } => {
                    entry.started_at = Some(started_at);
                    entry.started_monotonic = Some(monotonic);
                }
                StatusPatch::Completed {
                    completed_at,
                    monotonic_end,
                    result,
                } => {
                    entry.completed_at = Some(completed_at);
                    entry.processing_time = Some(elapsed_seconds(
                        entry.started_monotonic,
                        monotonic_end,
                    ));
                    entry.result = Some(result);
                }
                StatusPatch::Failed {
                    completed_at,
                    monotonic_end,
                    error,
                } => {
                    entry.completed_at = Some(completed_at);
                    entry.processing_time = entry
                        .started_monotonic
                        .map(|started| elapsed_seconds(Some(started), monotonic_end));
                    entry.error = Some(error);
                }
            }
            entry.clone()
        };

        if updated.status.is_terminal() {
            self.terminal_notify.notify_waiters();
        }
        Ok(updated)
    }

    /// Wait until the task reaches a terminal state. Returns `None` on
    /// timeout or when the task is unknown.
    pub async fn wait_terminal(&self, task_id: &str, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.terminal_notify.notified();
            match self.get(task_id) {
                Some(task) if task.status.is_terminal() => return Some(task),
                Some(_) => {}
                None => return None,
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self
                    .get(task_id)
                    .filter(|task| task.status.is_terminal());
            }
        }
    }

    /// Drop terminal tasks past the retention TTL, then enforce the retained
    /// cap by evicting the oldest terminal tasks first. Queued and processing
    /// tasks are never evicted. Returns the number of evicted records.
    pub fn evict(&self) -> usize {
        let ttl = chrono::Duration::seconds(self.retention.task_retention_seconds as i64);
        let cutoff = Utc::now() - ttl;
        let mut evicted = 0;

        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.created_at < cutoff)
            .map(|entry| entry.task_id.clone())
            .collect();
        for id in expired {
            self.tasks.remove(&id);
            evicted += 1;
        }

        let excess = self.tasks.len().saturating_sub(self.retention.task_max_retained);
        if excess > 0 {
            let mut terminal: Vec<(DateTime<Utc>, String)> = self
                .tasks
                .iter()
                .filter(|entry| entry.status.is_terminal())
                .map(|entry| (entry.created_at, entry.task_id.clone()))
                .collect();
            terminal.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, id) in terminal.into_iter().take(excess) {
                self.tasks.remove(&id);
                evicted += 1;
            }
        }

        evicted
    }
}

fn elapsed_seconds(started: Option<Instant>, end: Instant) -> f64 {
    started
        .map(|s| end.saturating_duration_since(s).as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(RetentionConfig::default())
    }

    fn queued_task(principal: &str) -> Task {
        Task::new(
            principal.to_string(),
            Priority::Normal,
            "hello".to_string(),
            GenerationParams::default(),
        )
    }

    fn completed_result(batch_id: &str) -> TaskResult {
        TaskResult {
            response: "ok".to_string(),
            tokens_generated: 2,
            batch_id: batch_id.to_string(),
            batch_size: 1,
            source: ResponseSource::Mock,
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let store = store();
        let task = queued_task("alice");
        let id = task.task_id.clone();
        store.create(task);

        let started = Instant::now();
        let claimed = store
            .transition(
                &id,
                TaskStatus::Queued,
                StatusPatch::Processing {
                    started_at: Utc::now(),
                    monotonic: started,
                },
            )
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(claimed.started_at.is_some());

        let settled = store
            .transition(
                &id,
                TaskStatus::Processing,
                StatusPatch::Completed {
                    completed_at: Utc::now(),
                    monotonic_end: Instant::now(),
                    result: completed_result("b1"),
                },
            )
            .unwrap();
        assert_eq!(settled.status, TaskStatus::Completed);
        assert!(settled.processing_time.unwrap() >= 0.0);
        assert_eq!(settled.result.unwrap().batch_id, "b1");
    }

    #[test]
    fn stale_transition_is_rejected() {
        let store = store();
        let task = queued_task("alice");
        let id = task.task_id.clone();
        store.create(task);

        let err = store
            .transition(
                &id,
                TaskStatus::Processing,
                StatusPatch::Failed {
                    completed_at: Utc::now(),
                    monotonic_end: Instant::now(),
                    error: "boom".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));

        // Double claim: second mover loses.
        store
            .transition(
                &id,
                TaskStatus::Queued,
                StatusPatch::Processing {
                    started_at: Utc::now(),
                    monotonic: Instant::now(),
                },
            )
            .unwrap();
        assert!(store
            .transition(
                &id,
                TaskStatus::Queued,
                StatusPatch::Processing {
                    started_at: Utc::now(),
                    monotonic: Instant::now(),
                },
            )
            .is_err());
    }

    #[test]
    fn list_is_principal_scoped_ordered_and_bounded() {
        let store = store();
        for i in 0..5 {
            let mut task = queued_task("alice");
            task.created_at = Utc::now() + chrono::Duration::milliseconds(i);
            store.create(task);
        }
        store.create(queued_task("bob"));

        let listed = store.list("alice", 3);
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert!(listed.iter().all(|t| t.principal == "alice"));
    }

    #[test]
    fn evict_honors_ttl_and_cap() {
        let retention = RetentionConfig {
            task_retention_seconds: 60,
            task_max_retained: 2,
            evict_interval_seconds: 30,
        };
        let store = TaskStore::new(retention);

        // One stale terminal task, two fresh terminal tasks, one queued.
        for age_seconds in [120_i64, 1, 0] {
            let mut task = queued_task("alice");
            task.created_at = Utc::now() - chrono::Duration::seconds(age_seconds);
            let id = task.task_id.clone();
            store.create(task);
            store
                .transition(
                    &id,
                    TaskStatus::Queued,
                    StatusPatch::Processing {
                        started_at: Utc::now(),
                        monotonic: Instant::now(),
                    },
                )
                .unwrap();
            store
                .transition(
                    &id,
                    TaskStatus::Processing,
                    StatusPatch::Completed {
                        completed_at: Utc::now(),
                        monotonic_end: Instant::now(),
                        result: completed_result("b"),
                    },
                )
                .unwrap();
        }
        let queued = queued_task("alice");
        let queued_id = queued.task_id.clone();
        store.create(queued);

        let evicted = store.evict();
        // TTL drops the 120s-old record; cap (2) then evicts the oldest
        // remaining terminal record. The queued task survives.
        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 2);
        assert!(store.get(&queued_id).is_some());
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_settlement() {
        let store = std::sync::Arc::new(store());
        let task = queued_task("alice");
        let id = task.task_id.clone();
        store.create(task);
        store
            .transition(
                &id,
                TaskStatus::Queued,
                StatusPatch::Processing {
                    started_at: Utc::now(),
                    monotonic: Instant::now(),
                },
            )
            .unwrap();

        let waiter = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.wait_terminal(&id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .transition(
                &id,
                TaskStatus::Processing,
                StatusPatch::Completed {
                    completed_at: Utc::now(),
                    monotonic_end: Instant::now(),
                    result: completed_result("b1"),
                },
            )
            .unwrap();

        let task = waiter.await.unwrap().expect("task should settle");
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn wait_terminal_times_out_on_stuck_task() {
        let store = store();
        let task = queued_task("alice");
        let id = task.task_id.clone();
        store.create(task);

        let waited = store.wait_terminal(&id, Duration::from_millis(30)).await;
        assert!(waited.is_none());
    }
}
