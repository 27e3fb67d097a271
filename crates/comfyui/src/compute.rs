//! The compute-client seam consumed by the job pipeline.
//!
//! [`ComputeClient`] is everything the orchestrator needs from a remote
//! generation engine. [`crate::session::ComfyUISession`] implements it for
//! ComfyUI; tests substitute in-memory fakes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::RemoteTask;

/// A file produced by an output node, as reported in the prompt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Engine-side folder kind (`output`, `temp`, `input`).
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl OutputImage {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: String::new(),
            folder_type: default_folder_type(),
        }
    }
}

/// Output files keyed by output node identifier, in engine order.
pub type OutputMap = HashMap<String, Vec<OutputImage>>;

/// Encoding of a live preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
}

/// A live preview frame streamed while a prompt executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub format: PreviewFormat,
    pub bytes: Vec<u8>,
}

/// Step-level progress within the running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub value: u32,
    pub maximum: u32,
    pub running_node: Option<String>,
}

/// Errors surfaced by a [`ComputeClient`].
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The engine validated the prompt and refused it.
    #[error("Prompt rejected: {message}")]
    Rejected {
        message: String,
        /// The engine's structured diagnostic body.
        diagnostic: serde_json::Value,
    },

    /// Network, protocol or decoding failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested prompt or file does not exist on the engine.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Operations the job pipeline needs from a generation engine.
#[async_trait::async_trait]
pub trait ComputeClient: Send + Sync {
    /// Directory output artifacts are written to, if configured.
    fn output_dir(&self) -> Option<&Path>;

    /// Upload an input image under `upload_name`.
    async fn upload_image(&self, bytes: Vec<u8>, upload_name: &str) -> Result<(), ComputeError>;

    /// Queue a workflow for execution.
    ///
    /// Fails with [`ComputeError::Rejected`] when the engine refuses it.
    async fn submit(&self, workflow: &serde_json::Value) -> Result<RemoteTask, ComputeError>;

    /// Best-effort interrupt of whatever is currently executing.
    async fn interrupt(&self, timeout: Duration) -> Result<(), ComputeError>;

    /// Output files of a finished prompt.
    async fn fetch_outputs(&self, prompt_id: &str) -> Result<OutputMap, ComputeError>;

    /// Download one output file fully into memory.
    async fn download_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComputeError>;

    /// Subscribe to live preview frames. Dropping the receiver unsubscribes.
    fn subscribe_previews(&self) -> broadcast::Receiver<PreviewImage>;
}
