//! Handles for in-flight prompts.
//!
//! [`RemoteTask::new`] returns a consumer/producer pair: the pipeline holds
//! the [`RemoteTask`] (completion, progress and running-node streams), the
//! websocket processor holds the [`TaskReporter`] and feeds it events.
//! Dropping the `RemoteTask` runs its release hook exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot};

use crate::compute::ProgressUpdate;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of most recent running-node ids kept for late subscribers.
pub const RUNNING_NODE_HISTORY_CAPACITY: usize = 10;

/// Broadcast capacity for per-task event streams.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Finished outcomes remembered for prompts that completed before anyone
/// registered for them.
const FINISHED_OUTCOME_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a task did not complete successfully.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// A node raised an error during execution.
    #[error("Node execution failed: {message}")]
    Execution {
        message: String,
        /// The engine's full error payload.
        diagnostic: serde_json::Value,
    },

    /// Execution was interrupted on the engine.
    #[error("Execution interrupted")]
    Interrupted,

    /// The producer side went away without reporting an outcome.
    #[error("Task abandoned before completion")]
    Abandoned,
}

type Outcome = Result<(), TaskError>;

// ---------------------------------------------------------------------------
// RemoteTask
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SharedState {
    history: Mutex<VecDeque<String>>,
    progress_started: AtomicBool,
}

type ReleaseHook = Box<dyn FnOnce(&str) + Send + Sync>;

/// Consumer handle for one queued prompt.
pub struct RemoteTask {
    id: String,
    completion: Option<oneshot::Receiver<Outcome>>,
    observer: TaskObserver,
    on_release: Option<ReleaseHook>,
}

/// Cloneable read-only view of a task's event streams, for background
/// forwarders that must not own the task itself.
#[derive(Clone)]
pub struct TaskObserver {
    progress_tx: broadcast::Sender<ProgressUpdate>,
    running_node_tx: broadcast::Sender<String>,
    shared: Arc<SharedState>,
}

impl TaskObserver {
    /// Progress events published from now on.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// Running-node changes published from now on.
    pub fn subscribe_running_node(&self) -> broadcast::Receiver<String> {
        self.running_node_tx.subscribe()
    }

    /// Most recent running node, if any was reported.
    pub fn last_running_node(&self) -> Option<String> {
        lock(&self.shared.history).back().cloned()
    }

    /// Recent running nodes, oldest first.
    pub fn running_node_history(&self) -> Vec<String> {
        lock(&self.shared.history).iter().cloned().collect()
    }

    /// Whether any step-level progress has been reported.
    pub fn has_progress_started(&self) -> bool {
        self.shared.progress_started.load(Ordering::Acquire)
    }
}

impl RemoteTask {
    /// Create a task handle and the reporter that drives it.
    pub fn new(id: impl Into<String>) -> (Self, TaskReporter) {
        let id = id.into();
        let (completion_tx, completion_rx) = oneshot::channel();
        let (progress_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (running_node_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(SharedState::default());

        let reporter = TaskReporter {
            id: id.clone(),
            completion_tx: Mutex::new(Some(completion_tx)),
            progress_tx: progress_tx.clone(),
            running_node_tx: running_node_tx.clone(),
            shared: Arc::clone(&shared),
        };
        let task = Self {
            id,
            completion: Some(completion_rx),
            observer: TaskObserver {
                progress_tx,
                running_node_tx,
                shared,
            },
            on_release: None,
        };
        (task, reporter)
    }

    /// Register a hook invoked once when this handle is dropped.
    pub fn with_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&str) + Send + Sync + 'static,
    {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Engine-assigned prompt id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A cloneable view of this task's event streams.
    pub fn observer(&self) -> TaskObserver {
        self.observer.clone()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.observer.subscribe_progress()
    }

    pub fn subscribe_running_node(&self) -> broadcast::Receiver<String> {
        self.observer.subscribe_running_node()
    }

    pub fn last_running_node(&self) -> Option<String> {
        self.observer.last_running_node()
    }

    pub fn running_node_history(&self) -> Vec<String> {
        self.observer.running_node_history()
    }

    pub fn has_progress_started(&self) -> bool {
        self.observer.has_progress_started()
    }

    /// Wait for the prompt to finish.
    ///
    /// Resolves once; later calls return [`TaskError::Abandoned`].
    pub async fn wait(&mut self) -> Result<(), TaskError> {
        match self.completion.take() {
            Some(rx) => rx.await.unwrap_or(Err(TaskError::Abandoned)),
            None => Err(TaskError::Abandoned),
        }
    }
}

impl std::fmt::Debug for RemoteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTask")
            .field("id", &self.id)
            .field("progress_started", &self.has_progress_started())
            .finish_non_exhaustive()
    }
}

impl Drop for RemoteTask {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// TaskReporter
// ---------------------------------------------------------------------------

/// Producer side of a [`RemoteTask`].
pub struct TaskReporter {
    id: String,
    completion_tx: Mutex<Option<oneshot::Sender<Outcome>>>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    running_node_tx: broadcast::Sender<String>,
    shared: Arc<SharedState>,
}

impl TaskReporter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn report_progress(&self, update: ProgressUpdate) {
        self.shared.progress_started.store(true, Ordering::Release);
        // No receivers just means nobody is listening yet.
        let _ = self.progress_tx.send(update);
    }

    pub fn report_running_node(&self, node: impl Into<String>) {
        let node = node.into();
        {
            let mut history = lock(&self.shared.history);
            if history.len() == RUNNING_NODE_HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(node.clone());
        }
        let _ = self.running_node_tx.send(node);
    }

    /// Resolve the task successfully. Only the first outcome counts.
    pub fn complete(&self) -> bool {
        self.finish(Ok(()))
    }

    /// Resolve the task with an error. Only the first outcome counts.
    pub fn fail(&self, error: TaskError) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, outcome: Outcome) -> bool {
        match lock(&self.completion_tx).take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Routes engine events to the reporters of registered prompts.
///
/// Remembers the outcome of a few recently finished prompts that were not
/// (yet) registered: a fully cached prompt can finish before the submit
/// response is processed.
#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    reporters: HashMap<String, Arc<TaskReporter>>,
    finished: VecDeque<(String, Outcome)>,
    current_prompt: Option<String>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a task for `prompt_id`. The returned handle
    /// unregisters itself when dropped.
    pub fn register(self: &Arc<Self>, prompt_id: &str) -> RemoteTask {
        let (task, reporter) = RemoteTask::new(prompt_id);
        let reporter = Arc::new(reporter);

        let early = {
            let mut inner = lock(&self.inner);
            let early = inner
                .finished
                .iter()
                .position(|(id, _)| id == prompt_id)
                .and_then(|i| inner.finished.remove(i))
                .map(|(_, outcome)| outcome);
            if early.is_none() {
                inner
                    .reporters
                    .insert(prompt_id.to_string(), Arc::clone(&reporter));
            }
            early
        };
        if let Some(outcome) = early {
            reporter.finish(outcome);
        }

        let registry = Arc::downgrade(self);
        task.with_release(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    fn remove(&self, prompt_id: &str) {
        let mut inner = lock(&self.inner);
        inner.reporters.remove(prompt_id);
        if inner.current_prompt.as_deref() == Some(prompt_id) {
            inner.current_prompt = None;
        }
    }

    /// Number of registered, unreleased tasks.
    pub fn len(&self) -> usize {
        lock(&self.inner).reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `prompt_id` as the one currently executing.
    pub fn set_current(&self, prompt_id: &str) {
        lock(&self.inner).current_prompt = Some(prompt_id.to_string());
    }

    /// Reporter for `prompt_id`, or for the currently executing prompt when
    /// the engine message carried no id.
    pub fn reporter(&self, prompt_id: Option<&str>) -> Option<Arc<TaskReporter>> {
        let inner = lock(&self.inner);
        let id = prompt_id.or(inner.current_prompt.as_deref())?;
        inner.reporters.get(id).cloned()
    }

    /// Deliver a final outcome, remembering it if nobody is registered yet.
    pub fn finish(&self, prompt_id: &str, outcome: Result<(), TaskError>) {
        let reporter = {
            let mut inner = lock(&self.inner);
            if inner.current_prompt.as_deref() == Some(prompt_id) {
                inner.current_prompt = None;
            }
            match inner.reporters.get(prompt_id).cloned() {
                Some(reporter) => Some(reporter),
                None => {
                    if inner.finished.len() == FINISHED_OUTCOME_CAPACITY {
                        inner.finished.pop_front();
                    }
                    inner.finished.push_back((prompt_id.to_string(), outcome.clone()));
                    None
                }
            }
        };
        if let Some(reporter) = reporter {
            reporter.finish(outcome);
        }
    }

    /// Fail every registered task, e.g. when the connection is lost for good.
    pub fn abandon_all(&self) {
        let reporters: Vec<_> = lock(&self.inner).reporters.values().cloned().collect();
        for reporter in reporters {
            reporter.fail(TaskError::Abandoned);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn completes_successfully() {
        let (mut task, reporter) = RemoteTask::new("p1");
        assert!(reporter.complete());
        assert!(task.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_outcome_wins() {
        let (mut task, reporter) = RemoteTask::new("p1");
        reporter.fail(TaskError::Interrupted);
        assert!(!reporter.complete());
        assert_matches!(task.wait().await, Err(TaskError::Interrupted));
    }

    #[tokio::test]
    async fn dropped_reporter_abandons() {
        let (mut task, reporter) = RemoteTask::new("p1");
        drop(reporter);
        assert_matches!(task.wait().await, Err(TaskError::Abandoned));
    }

    #[tokio::test]
    async fn second_wait_is_abandoned() {
        let (mut task, reporter) = RemoteTask::new("p1");
        reporter.complete();
        task.wait().await.unwrap();
        assert_matches!(task.wait().await, Err(TaskError::Abandoned));
    }

    #[test]
    fn history_is_capped() {
        let (task, reporter) = RemoteTask::new("p1");
        for i in 0..(RUNNING_NODE_HISTORY_CAPACITY + 5) {
            reporter.report_running_node(i.to_string());
        }
        let history = task.running_node_history();
        assert_eq!(history.len(), RUNNING_NODE_HISTORY_CAPACITY);
        assert_eq!(history.first().map(String::as_str), Some("5"));
        assert_eq!(
            task.last_running_node(),
            Some((RUNNING_NODE_HISTORY_CAPACITY + 4).to_string())
        );
    }

    #[test]
    fn progress_marks_started() {
        let (task, reporter) = RemoteTask::new("p1");
        assert!(!task.has_progress_started());
        reporter.report_progress(ProgressUpdate {
            value: 1,
            maximum: 10,
            running_node: None,
        });
        assert!(task.has_progress_started());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let (task, reporter) = RemoteTask::new("p1");
        reporter.report_running_node("early");
        let mut rx = task.subscribe_running_node();
        reporter.report_running_node("late");
        assert_eq!(rx.recv().await.unwrap(), "late");
        assert_eq!(task.last_running_node().as_deref(), Some("late"));
    }

    #[test]
    fn observer_outlives_borrow_of_task() {
        let (task, reporter) = RemoteTask::new("p1");
        let observer = task.observer();
        reporter.report_running_node("KSampler");
        assert_eq!(observer.last_running_node().as_deref(), Some("KSampler"));
        assert!(!observer.has_progress_started());
    }

    #[test]
    fn release_hook_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let (task, _reporter) = RemoteTask::new("p1");
        let task = task.with_release(move |id| {
            assert_eq!(id, "p1");
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(task);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_routes_and_unregisters() {
        let registry = TaskRegistry::new();
        let mut task = registry.register("p1");
        assert_eq!(registry.len(), 1);

        registry.set_current("p1");
        let mut progress = task.subscribe_progress();
        registry.reporter(None).unwrap().report_progress(ProgressUpdate {
            value: 2,
            maximum: 4,
            running_node: None,
        });
        assert_eq!(progress.recv().await.unwrap().value, 2);

        registry.finish("p1", Ok(()));
        assert!(task.wait().await.is_ok());

        drop(task);
        assert!(registry.is_empty());
        assert!(registry.reporter(Some("p1")).is_none());
    }

    #[tokio::test]
    async fn registry_replays_early_outcome() {
        let registry = TaskRegistry::new();
        registry.finish("fast", Ok(()));

        let mut task = registry.register("fast");
        assert!(task.wait().await.is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn abandon_all_fails_pending() {
        let registry = TaskRegistry::new();
        let mut task = registry.register("p1");
        registry.abandon_all();
        assert_matches!(task.wait().await, Err(TaskError::Abandoned));
    }
}
