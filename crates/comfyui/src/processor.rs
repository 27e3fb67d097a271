//! Drains one event socket into the [`TaskRegistry`] and the preview
//! channel.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::compute::{PreviewImage, ProgressUpdate};
use crate::messages::{parse_binary_message, parse_message, ComfyUIMessage};
use crate::task::{TaskError, TaskRegistry};

/// Consume frames until the socket closes or fails.
pub async fn process_messages<S>(
    ws_stream: &mut S,
    registry: &TaskRegistry,
    preview_tx: &broadcast::Sender<PreviewImage>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws_stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "ComfyUI WebSocket read failed");
                return;
            }
        };

        match message {
            Message::Text(text) => handle_text_message(&text, registry),
            Message::Binary(data) => {
                if let Some(preview) = parse_binary_message(&data) {
                    // Err only means no job is watching previews right now.
                    let _ = preview_tx.send(preview);
                } else {
                    tracing::trace!(len = data.len(), "Skipping unknown binary frame");
                }
            }
            Message::Close(frame) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed by server");
                return;
            }
            // Pings are answered by tungstenite itself.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Dispatch a single text frame to the registered task it concerns.
pub fn handle_text_message(text: &str, registry: &TaskRegistry) {
    match parse_message(text) {
        Ok(msg) => dispatch(msg, registry),
        Err(e) => tracing::debug!(error = %e, frame = %text, "Ignoring ComfyUI message"),
    }
}

fn dispatch(msg: ComfyUIMessage, registry: &TaskRegistry) {
    match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
            registry.set_current(&data.prompt_id);
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                cached_nodes = data.nodes.len(),
                "Execution used cache",
            );
        }
        ComfyUIMessage::Executing(data) => match (data.node, data.prompt_id) {
            (Some(node), prompt_id) => {
                if let Some(id) = prompt_id.as_deref() {
                    registry.set_current(id);
                }
                tracing::debug!(node = %node, "Executing node");
                if let Some(reporter) = registry.reporter(prompt_id.as_deref()) {
                    reporter.report_running_node(node);
                }
            }
            (None, Some(prompt_id)) => {
                // node == None means execution is complete for this prompt.
                tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
                registry.finish(&prompt_id, Ok(()));
            }
            (None, None) => {}
        },
        ComfyUIMessage::Progress(data) => {
            if let Some(reporter) = registry.reporter(data.prompt_id.as_deref()) {
                reporter.report_progress(ProgressUpdate {
                    value: data.value,
                    maximum: data.max,
                    running_node: data.node,
                });
            }
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                "Node executed with output",
            );
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            registry.finish(&data.prompt_id, Ok(()));
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::info!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                "Execution interrupted",
            );
            registry.finish(&data.prompt_id, Err(TaskError::Interrupted));
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            let error = TaskError::Execution {
                message: data.summary(),
                diagnostic: data.diagnostic(),
            };
            registry.finish(&data.prompt_id, Err(error));
        }
    }
}
