//! A live session with one ComfyUI instance.
//!
//! [`ComfyUISession::connect`] opens the WebSocket, spawns the
//! connect -> process -> reconnect task and exposes the instance through
//! the [`ComputeClient`] trait.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{parse_history_outputs, ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::compute::{ComputeClient, ComputeError, OutputImage, OutputMap, PreviewImage};
use crate::processor::process_messages;
use crate::reconnect::{reestablish, ReconnectConfig};
use crate::task::{RemoteTask, TaskRegistry};

/// Broadcast channel capacity for preview frames.
const PREVIEW_CHANNEL_CAPACITY: usize = 16;

/// How long [`ComfyUISession::shutdown`] waits for the connection task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for a [`ComfyUISession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub api_url: String,
    /// WebSocket base URL; derived from `api_url` when `None`.
    pub ws_url: Option<String>,
    /// Local directory that output artifacts are written to.
    pub output_dir: Option<PathBuf>,
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: None,
            output_dir: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Connected ComfyUI instance implementing [`ComputeClient`].
pub struct ComfyUISession {
    client: Arc<ComfyUIClient>,
    api: ComfyUIApi,
    registry: Arc<TaskRegistry>,
    preview_tx: broadcast::Sender<PreviewImage>,
    output_dir: Option<PathBuf>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ComfyUISession {
    /// Connect to the instance and start processing its events.
    ///
    /// The first connection attempt must succeed; later drops are retried
    /// with exponential backoff until [`shutdown`](Self::shutdown).
    pub async fn connect(config: SessionConfig) -> Result<Arc<Self>, ComfyUIClientError> {
        let client = Arc::new(match &config.ws_url {
            Some(ws_url) => ComfyUIClient::new(ws_url.as_str()),
            None => ComfyUIClient::for_api_url(&config.api_url),
        });
        let conn = client.connect().await?;

        let (preview_tx, _) = broadcast::channel(PREVIEW_CHANNEL_CAPACITY);
        let registry = TaskRegistry::new();
        let cancel = CancellationToken::new();

        let task_handle = {
            let client = Arc::clone(&client);
            let registry = Arc::clone(&registry);
            let preview_tx = preview_tx.clone();
            let cancel = cancel.clone();
            let reconnect = config.reconnect.clone();
            tokio::spawn(async move {
                run_connection_loop(conn, &client, &registry, &preview_tx, &reconnect, &cancel)
                    .await;
                registry.abandon_all();
                tracing::info!("ComfyUI connection task exited");
            })
        };

        Ok(Arc::new(Self {
            api: ComfyUIApi::new(config.api_url),
            client,
            registry,
            preview_tx,
            output_dir: config.output_dir,
            cancel,
            task_handle: Mutex::new(Some(task_handle)),
        }))
    }

    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    /// Stop the connection task, waiting up to 5 seconds for a clean exit.
    /// Tasks still in flight resolve as abandoned.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down ComfyUI session");
        self.cancel.cancel();

        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
    }
}

impl Drop for ComfyUISession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl ComputeClient for ComfyUISession {
    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    async fn upload_image(&self, bytes: Vec<u8>, upload_name: &str) -> Result<(), ComputeError> {
        self.api
            .upload_image(bytes, upload_name)
            .await
            .map_err(into_compute_error)
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<RemoteTask, ComputeError> {
        let response = self
            .api
            .submit_workflow(workflow, self.client.client_id())
            .await
            .map_err(into_compute_error)?;

        if response
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            tracing::warn!(
                prompt_id = %response.prompt_id,
                node_errors = %response.node_errors,
                "Prompt queued with node errors",
            );
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(self.registry.register(&response.prompt_id))
    }

    async fn interrupt(&self, timeout: Duration) -> Result<(), ComputeError> {
        self.api.interrupt(timeout).await.map_err(into_compute_error)
    }

    async fn fetch_outputs(&self, prompt_id: &str) -> Result<OutputMap, ComputeError> {
        let history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(into_compute_error)?;
        parse_history_outputs(&history, prompt_id)
            .ok_or_else(|| ComputeError::NotFound(format!("history for prompt {prompt_id}")))
    }

    async fn download_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComputeError> {
        self.api.view_image(image).await.map_err(into_compute_error)
    }

    fn subscribe_previews(&self) -> broadcast::Receiver<PreviewImage> {
        self.preview_tx.subscribe()
    }
}

fn into_compute_error(e: ComfyUIApiError) -> ComputeError {
    match e {
        ComfyUIApiError::PromptRejected { message, body } => ComputeError::Rejected {
            message,
            diagnostic: body,
        },
        ComfyUIApiError::ApiError { status: 404, body } => ComputeError::NotFound(body),
        other => ComputeError::Transport(other.to_string()),
    }
}

/// Core connection loop: process messages -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(
    conn: ComfyUIConnection,
    client: &ComfyUIClient,
    registry: &TaskRegistry,
    preview_tx: &broadcast::Sender<PreviewImage>,
    reconnect_config: &ReconnectConfig,
    cancel: &CancellationToken,
) {
    let mut conn = conn;

    loop {
        let mut ws_stream = conn.ws_stream;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = process_messages(&mut ws_stream, registry, preview_tx) => {}
        }

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!(client_id = %client.client_id(), "Connection lost, entering reconnect loop");
        conn = match reestablish(client, reconnect_config, cancel).await {
            Some(conn) => conn,
            None => return,
        };
    }
}
