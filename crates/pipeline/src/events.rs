//! Job lifecycle events backed by a `tokio::sync::broadcast` channel.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

/// Length of the prompt id shown in completion notices.
pub const SHORT_PROMPT_ID_LEN: usize = 7;

/// Something the caller may want to surface outside the progress bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// An artifact was written to disk.
    FileAdded { path: PathBuf },

    /// The job finished and its artifacts are in the gallery.
    PromptCompleted {
        /// Lowercased prefix of the prompt id.
        short_id: String,
        /// First artifact (the grid for batches).
        preview_path: Option<PathBuf>,
    },

    /// The engine finished without producing images.
    NoOutput,
}

impl GenerationEvent {
    pub fn prompt_completed(prompt_id: &str, preview_path: Option<PathBuf>) -> Self {
        Self::PromptCompleted {
            short_id: short_prompt_id(prompt_id),
            preview_path,
        }
    }
}

pub fn short_prompt_id(prompt_id: &str) -> String {
    prompt_id
        .chars()
        .take(SHORT_PROMPT_ID_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of [`GenerationEvent`]s to any number of subscribers.
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers observe `RecvError::Lagged` once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: GenerationEvent) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
