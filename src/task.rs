//! Asynchronous task engine
//!
//! Every long-running unit of work, in particular each remote service
//! invocation, runs inside a tracked [`Task`] with a
//! `Created → Running → {Success, Error, Cancelled}` lifecycle, a
//! last-write-wins status line, append-only warnings and a terminal error.
//!
//! Workers are tokio tasks admitted through a bounded semaphore, so a burst
//! of invocations queues instead of spawning unbounded concurrency. Timeouts
//! race a timer against the worker and cancel the task's cooperative token
//! when the timer wins; well-behaved work observes
//! [`TaskContext::is_cancelled`] between steps. There is no preemptive
//! interruption.
//!
//! Diagnostics flow through the [`TaskContext`] handed to the work closure,
//! never through a hidden thread-local association.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FederationError, Result};
use crate::model::Binding;

/// Lifecycle state of a task. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Running,
    Success,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error | TaskState::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Created, TaskState::Running)
                | (TaskState::Running, TaskState::Success)
                | (TaskState::Running, TaskState::Error)
                | (TaskState::Running, TaskState::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What happens to failures reported after a task already has a terminal
/// cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// The first failure is the terminal cause; later failures are demoted
    /// to warnings.
    #[default]
    FirstWins,
    /// Every failure is kept; the first is still reported as the terminal
    /// cause.
    Accumulate,
}

/// Configuration for the task manager.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Maximum number of workers running at once; excess submissions queue.
    pub max_concurrent: usize,
    /// How often the sweeper looks for expired finished tasks.
    pub sweep_interval: Duration,
    /// How long a finished task stays pollable before it is swept.
    pub task_lifespan: Duration,
    pub error_policy: ErrorPolicy,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        TaskManagerConfig {
            max_concurrent: 32,
            sweep_interval: Duration::from_secs(15 * 60),
            task_lifespan: Duration::from_secs(8 * 60 * 60),
            error_policy: ErrorPolicy::default(),
        }
    }
}

/// Cooperative cancellation flag shared between a task and its observers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug)]
pub struct Task {
    id: String,
    description: String,
    state: Mutex<TaskState>,
    status: RwLock<String>,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    token: CancellationToken,
    error_policy: ErrorPolicy,
    completed_at: Mutex<Option<Instant>>,
}

impl Task {
    fn new(description: String, error_policy: ErrorPolicy) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            description,
            state: Mutex::new(TaskState::Created),
            status: RwLock::new(String::new()),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            error_policy,
            completed_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Latest status line.
    pub fn status(&self) -> String {
        self.status.read().clone()
    }

    /// The terminal cause, if any: the first recorded failure.
    pub fn error(&self) -> Option<String> {
        self.errors.lock().first().cloned()
    }

    /// Every recorded failure (more than one only under
    /// [`ErrorPolicy::Accumulate`]).
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn completed_at(&self) -> Option<Instant> {
        *self.completed_at.lock()
    }

    /// Move to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            warn!(
                id = self.id.as_str(),
                from = %*state,
                to = %next,
                "refusing illegal task transition"
            );
            return false;
        }
        *state = next;
        if next.is_terminal() {
            *self.completed_at.lock() = Some(Instant::now());
        }
        true
    }

    pub(crate) fn record_failure(&self, message: &str) {
        let mut errors = self.errors.lock();
        if errors.is_empty() {
            errors.push(message.to_string());
            return;
        }
        match self.error_policy {
            ErrorPolicy::FirstWins => self.warnings.lock().push(message.to_string()),
            ErrorPolicy::Accumulate => errors.push(message.to_string()),
        }
    }
}

/// Explicit handle through which running work reports diagnostics.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Arc<Task>,
}

impl TaskContext {
    /// Replace the task's status line (last write wins).
    pub fn set_status(&self, status: impl Into<String>) {
        *self.task.status.write() = status.into();
    }

    /// Append a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.task.warnings.lock().push(message.into());
    }

    /// Report a failure. The first one becomes the terminal cause; what
    /// happens to later ones depends on the manager's [`ErrorPolicy`].
    pub fn error(&self, message: impl Into<String>) {
        self.task.record_failure(&message.into());
    }

    /// Whether cancellation was requested; work should check this between
    /// steps and wind down.
    pub fn is_cancelled(&self) -> bool {
        self.task.token.is_cancelled()
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

/// Handle to a spawned task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task: Arc<Task>,
    join: tokio::task::JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn task(&self) -> Arc<Task> {
        self.task.clone()
    }

    pub fn id(&self) -> &str {
        self.task.id()
    }

    /// Request cooperative cancellation of the worker.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Wait for the worker and return its result.
    pub async fn join(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(FederationError::Task(format!("worker lost: {e}"))),
        }
    }
}

/// Spawns, tracks and cleans up tasks.
#[derive(Debug)]
pub struct TaskManager {
    config: TaskManagerConfig,
    semaphore: Arc<Semaphore>,
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig) -> Self {
        TaskManager {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            tasks: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        TaskManager::new(TaskManagerConfig::default())
    }

    /// Run `work` on the caller's execution context, returning only on
    /// completion. Admission still counts against the worker bound.
    pub async fn submit<F, Fut, T>(&self, description: impl Into<String>, work: F) -> Result<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let task = self.register(description.into());
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| FederationError::Task("task pool is shut down".into()))?;

        task.transition(TaskState::Running);
        let result = work(TaskContext { task: task.clone() }).await;
        finish_task(&task, &result);
        result
    }

    /// Start `work` on a pooled worker and return immediately.
    pub fn spawn<F, Fut, T>(&self, description: impl Into<String>, work: F) -> TaskHandle<T>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.register(description.into());
        let semaphore = self.semaphore.clone();
        let worker_task = task.clone();

        let join = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| FederationError::Task("task pool is shut down".into()))?;

            if worker_task.token.is_cancelled() {
                worker_task.transition(TaskState::Running);
                worker_task.transition(TaskState::Cancelled);
                return Err(FederationError::Task("task cancelled before start".into()));
            }

            worker_task.transition(TaskState::Running);
            let result = work(TaskContext {
                task: worker_task.clone(),
            })
            .await;
            finish_task(&worker_task, &result);
            result
        });

        TaskHandle { task, join }
    }

    /// Start `work` and invoke `on_complete` exactly once with its success
    /// value or failure message.
    pub fn spawn_notify<F, Fut, T, C>(
        &self,
        description: impl Into<String>,
        work: F,
        on_complete: C,
    ) -> Arc<Task>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, String>) + Send + 'static,
    {
        let handle = self.spawn(description, work);
        let task = handle.task();
        tokio::spawn(async move {
            match handle.join().await {
                Ok(value) => on_complete(Ok(value)),
                Err(e) => on_complete(Err(e.to_string())),
            }
        });
        task
    }

    /// Race `work` against a timer.
    ///
    /// If the timer fires first the task's cancellation token is cancelled
    /// and a [`FederationError::Timeout`] returns immediately; the worker
    /// itself winds down only when it next observes the token.
    pub async fn submit_with_timeout<F, Fut, T>(
        &self,
        description: impl Into<String>,
        duration: Duration,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.spawn(description, work);
        let task = handle.task();
        match timeout(duration, handle.join()).await {
            Ok(result) => result,
            Err(_) => {
                task.cancel();
                warn!(id = task.id(), ?duration, "task timed out, cancellation requested");
                Err(FederationError::Timeout(duration))
            }
        }
    }

    /// The task for an id, if it has not been disposed.
    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// Latest status message of a task.
    pub fn poll(&self, id: &str) -> Option<String> {
        self.get(id).map(|task| task.status())
    }

    /// Drop a task from the table.
    pub fn dispose(&self, id: &str) {
        self.tasks.remove(id);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Remove finished tasks older than the configured lifespan. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.config.task_lifespan) else {
            return 0;
        };
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.value().is_finished()
                    && entry
                        .value()
                        .completed_at()
                        .map_or(false, |done| done < cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.tasks.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired tasks");
        }
        expired.len()
    }

    /// Start the background sweeper. It stops when the manager is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep();
            }
        })
    }

    fn register(&self, description: String) -> Arc<Task> {
        let task = Arc::new(Task::new(description, self.config.error_policy));
        debug!(id = task.id(), description = task.description(), "task created");
        self.tasks.insert(task.id().to_string(), task.clone());
        task
    }
}

fn finish_task<T>(task: &Arc<Task>, result: &Result<T>) {
    match result {
        Ok(_) => {
            task.transition(TaskState::Success);
        }
        Err(e) => {
            task.record_failure(&e.to_string());
            if task.token.is_cancelled() {
                task.transition(TaskState::Cancelled);
            } else {
                task.transition(TaskState::Error);
            }
        }
    }
}

/// A task that owns a query and accumulates result bindings while running.
#[derive(Debug)]
pub struct QueryTask {
    task: Arc<Task>,
    query: String,
    results: Mutex<Vec<Binding>>,
}

impl QueryTask {
    pub fn new(task: Arc<Task>, query: impl Into<String>) -> Self {
        QueryTask {
            task,
            query: query.into(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Append bindings; refused unless the task is RUNNING.
    pub fn append(&self, bindings: impl IntoIterator<Item = Binding>) -> bool {
        if self.task.state() != TaskState::Running {
            return false;
        }
        self.results.lock().extend(bindings);
        true
    }

    pub fn results(&self) -> Vec<Binding> {
        self.results.lock().clone()
    }
}
