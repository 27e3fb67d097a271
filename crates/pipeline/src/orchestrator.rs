//! Drives one generation job from submission to persisted artifacts.
//!
//! [`JobOrchestrator::run`] uploads inputs, submits the workflow, routes
//! progress and previews while the engine runs, turns cancellation into a
//! bounded interrupt request and finally hands the outputs to the
//! [`OutputCollector`]. Whatever happens, the job scope is torn down when
//! `run` returns, panics or is dropped.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use imagegen_comfyui::compute::{ComputeClient, ComputeError, PreviewImage, ProgressUpdate};
use imagegen_comfyui::task::{RemoteTask, TaskObserver};

use crate::collector::OutputCollector;
use crate::error::JobError;
use crate::events::{EventBus, GenerationEvent};
use crate::gallery::OutputGallery;
use crate::job::{Job, JobOutcome};
use crate::progress::ProgressState;
use crate::router::EventRouter;
use crate::upload::upload_input_images;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Delay before running-node changes are shown, measured from submission.
pub const DEFAULT_NODE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Upper bound on a cancellation-triggered interrupt request.
pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Output filename template; the default template is used when `None`
    /// or invalid.
    pub file_name_template: Option<String>,
    /// Value of the `{project_name}` template variable.
    pub project_name: Option<String>,
    pub node_change_debounce: Duration,
    pub interrupt_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            file_name_template: None,
            project_name: None,
            node_change_debounce: DEFAULT_NODE_CHANGE_DEBOUNCE,
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// JobOrchestrator
// ---------------------------------------------------------------------------

/// Runs generation jobs against a [`ComputeClient`], one at a time.
///
/// Callers must not start a second `run` while one is in flight.
pub struct JobOrchestrator {
    client: Arc<dyn ComputeClient>,
    gallery: Arc<dyn OutputGallery>,
    router: Arc<EventRouter>,
    events: EventBus,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        client: Arc<dyn ComputeClient>,
        gallery: Arc<dyn OutputGallery>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            gallery,
            router: Arc::new(EventRouter::new()),
            events: EventBus::default(),
            config,
        }
    }

    /// Observe progress of the active job.
    pub fn progress(&self) -> watch::Receiver<ProgressState> {
        self.router.subscribe()
    }

    /// Subscribe to file-added, completion and no-output events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }

    /// Run `job` to completion, or until `cancel` fires.
    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome, JobError> {
        let (parameters, project) = job.validate()?;
        let output_dir = self
            .client
            .output_dir()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                JobError::InvalidRequest("Compute client has no output directory configured".into())
            })?;
        let primary_node = job.primary_output_node().unwrap_or_default();

        let mut scope = JobScope::begin(
            Arc::clone(&self.router),
            Arc::clone(&self.gallery),
            cancel.child_token(),
        );

        if !job.input_images.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(JobError::Canceled),
                result = upload_input_images(self.client.as_ref(), &job.input_images) => {
                    let uploaded = result?;
                    tracing::debug!(uploaded = ?uploaded, "Input images uploaded");
                }
            }
        }

        scope.spawn(forward_previews(
            self.client.subscribe_previews(),
            Arc::clone(&self.router),
            Arc::clone(&self.gallery),
            scope.token(),
        ));

        let mut interrupt = InterruptRegistration::arm(cancel, self.config.interrupt_timeout);

        let submitted_at = Instant::now();
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Job canceled before submission completed");
                return Err(JobError::Canceled);
            }
            result = self.client.submit(&job.workflow) => result.map_err(|e| {
                tracing::warn!(error = %e, "Failed to queue prompt");
                JobError::from(e)
            })?,
        };

        let prompt_id = task.id().to_string();
        tracing::info!(prompt_id = %prompt_id, output_node = %primary_node, "Prompt queued");
        interrupt.activate(Arc::clone(&self.client), prompt_id.clone());

        let observer = task.observer();
        scope.spawn(forward_progress(
            observer.subscribe_progress(),
            Arc::clone(&self.router),
            scope.token(),
        ));
        let debounce = self
            .config
            .node_change_debounce
            .saturating_sub(submitted_at.elapsed());
        scope.spawn(attach_running_node_after(
            debounce,
            observer,
            Arc::clone(&self.router),
            scope.token(),
        ));
        let task = scope.hold(task);

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(prompt_id = %prompt_id, "Cancelling prompt");
                interrupt.settle().await;
                return Err(JobError::Canceled);
            }
            result = task.wait() => result,
        };
        interrupt.disarm();

        if let Err(e) = completion {
            tracing::warn!(prompt_id = %prompt_id, error = %e, "Prompt did not complete");
            return Err(e.into());
        }
        tracing::debug!(prompt_id = %prompt_id, "Prompt task finished");

        let outputs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Canceled),
            result = self.client.fetch_outputs(&prompt_id) => result,
        };
        let images = match outputs {
            Ok(mut outputs) => outputs.remove(primary_node).filter(|images| !images.is_empty()),
            Err(ComputeError::NotFound(what)) => {
                tracing::debug!(prompt_id = %prompt_id, what = %what, "No history for prompt");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let Some(images) = images else {
            tracing::warn!(
                prompt_id = %prompt_id,
                output_node = %primary_node,
                "Did not receive any output images",
            );
            self.events.publish(GenerationEvent::NoOutput);
            return Ok(JobOutcome::NoOutput);
        };

        if job.clear_output_images {
            self.gallery.clear_images();
        }

        let artifacts = OutputCollector::new(self.client.as_ref(), &output_dir, &self.events)
            .with_file_name_template(self.config.file_name_template.as_deref())
            .with_project_name(self.config.project_name.as_deref())
            .collect(&images, parameters, project)
            .await?;

        self.gallery.add_images(&artifacts);
        self.events.publish(GenerationEvent::prompt_completed(
            &prompt_id,
            artifacts.first().map(|a| a.path().to_path_buf()),
        ));
        tracing::info!(
            prompt_id = %prompt_id,
            artifact_count = artifacts.len(),
            "Prompt completed successfully",
        );

        Ok(JobOutcome::Completed(artifacts))
    }
}

// ---------------------------------------------------------------------------
// Job scope
// ---------------------------------------------------------------------------

/// Everything a running job owns. Dropping it is the cleanup step.
struct JobScope {
    token: CancellationToken,
    router: Arc<EventRouter>,
    gallery: Arc<dyn OutputGallery>,
    forwarders: Vec<JoinHandle<()>>,
    task: Option<RemoteTask>,
}

impl JobScope {
    fn begin(router: Arc<EventRouter>, gallery: Arc<dyn OutputGallery>, token: CancellationToken) -> Self {
        router.begin_job();
        Self {
            token,
            router,
            gallery,
            forwarders: Vec::new(),
            task: None,
        }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn spawn<F>(&mut self, forwarder: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.forwarders.push(tokio::spawn(forwarder));
    }

    /// Keep `task` until the scope ends so it is released exactly once.
    fn hold(&mut self, task: RemoteTask) -> &mut RemoteTask {
        self.task.insert(task)
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        self.token.cancel();
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.gallery.clear_preview();
        self.router.reset();
        if let Some(task) = self.task.take() {
            tracing::debug!(prompt_id = %task.id(), "Releasing prompt task");
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation -> interrupt
// ---------------------------------------------------------------------------

/// Turns cancellation into one bounded interrupt request, but only once a
/// prompt was queued and only until [`disarm`](Self::disarm) is called.
struct InterruptRegistration {
    cancel: CancellationToken,
    disarm: CancellationToken,
    timeout: Duration,
    watcher: Option<JoinHandle<()>>,
}

impl InterruptRegistration {
    fn arm(cancel: &CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel: cancel.clone(),
            disarm: CancellationToken::new(),
            timeout,
            watcher: None,
        }
    }

    fn activate(&mut self, client: Arc<dyn ComputeClient>, prompt_id: String) {
        let cancel = self.cancel.clone();
        let disarm = self.disarm.clone();
        let timeout = self.timeout;

        self.watcher = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = disarm.cancelled() => {}
                _ = cancel.cancelled() => {
                    tracing::info!(prompt_id = %prompt_id, "Interrupting prompt");
                    match tokio::time::timeout(timeout, client.interrupt(timeout)).await {
                        Ok(Ok(())) => tracing::debug!(prompt_id = %prompt_id, "Interrupt sent"),
                        Ok(Err(e)) => tracing::warn!(
                            prompt_id = %prompt_id,
                            error = %e,
                            "Error while interrupting prompt",
                        ),
                        Err(_) => tracing::warn!(
                            prompt_id = %prompt_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Interrupt request timed out",
                        ),
                    }
                }
            }
        }));
    }

    fn disarm(&self) {
        self.disarm.cancel();
    }

    /// Wait for a triggered interrupt request to finish (bounded by the
    /// timeout).
    async fn settle(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}

impl Drop for InterruptRegistration {
    fn drop(&mut self) {
        self.disarm.cancel();
    }
}

// ---------------------------------------------------------------------------
// Forwarders
// ---------------------------------------------------------------------------

async fn forward_previews(
    mut previews: broadcast::Receiver<PreviewImage>,
    router: Arc<EventRouter>,
    gallery: Arc<dyn OutputGallery>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = previews.recv() => match msg {
                Ok(preview) => router.on_preview(preview, gallery.as_ref()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::trace!(skipped, "Preview receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn forward_progress(
    mut updates: broadcast::Receiver<ProgressUpdate>,
    router: Arc<EventRouter>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = updates.recv() => match msg {
                Ok(update) => router.on_progress(&update),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Attach running-node updates once `delay` has passed, seeded with the
/// most recent node. Skipped entirely if the job ends first.
async fn attach_running_node_after(
    delay: Duration,
    observer: TaskObserver,
    router: Arc<EventRouter>,
    token: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut nodes = observer.subscribe_running_node();
    if let Some(last) = observer.last_running_node() {
        router.on_running_node(&last, observer.has_progress_started());
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = nodes.recv() => match msg {
                Ok(node) => router.on_running_node(&node, observer.has_progress_started()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.node_change_debounce, Duration::from_millis(250));
        assert_eq!(config.interrupt_timeout, Duration::from_secs(5));
        assert!(config.file_name_template.is_none());
    }

    #[tokio::test]
    async fn disarmed_registration_never_interrupts() {
        let cancel = CancellationToken::new();
        let mut registration = InterruptRegistration::arm(&cancel, Duration::from_secs(5));
        registration.disarm();
        cancel.cancel();
        // Nothing was activated, so settling returns immediately.
        registration.settle().await;
        assert!(registration.watcher.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_is_skipped_after_teardown() {
        let (task, reporter) = RemoteTask::new("p1");
        reporter.report_running_node("KSampler");
        let router = Arc::new(EventRouter::new());
        router.begin_job();
        let token = CancellationToken::new();

        let handle = tokio::spawn(attach_running_node_after(
            Duration::from_millis(250),
            task.observer(),
            Arc::clone(&router),
            token.clone(),
        ));
        token.cancel();
        handle.await.unwrap();

        assert!(router.snapshot().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_seeds_from_last_node() {
        let (task, reporter) = RemoteTask::new("p1");
        reporter.report_running_node("CheckpointLoader");
        reporter.report_running_node("KSampler");
        let router = Arc::new(EventRouter::new());
        router.begin_job();
        let token = CancellationToken::new();

        let handle = tokio::spawn(attach_running_node_after(
            Duration::from_millis(250),
            task.observer(),
            Arc::clone(&router),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(router.snapshot().text.as_deref(), Some("KSampler"));

        token.cancel();
        handle.await.unwrap();
    }
}
