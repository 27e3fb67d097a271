//! Frames received on the ComfyUI event socket.
//!
//! Text frames are `{"type": ..., "data": {...}}` JSON; binary frames
//! carry live previews.

use serde::{Deserialize, Serialize};

use crate::compute::{PreviewFormat, PreviewImage};

const BINARY_EVENT_PREVIEW_IMAGE: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    Status(QueueStatus),
    ExecutionStart(PromptRef),
    ExecutionCached(CachedNodes),
    /// `node == None` marks the end of the prompt.
    Executing(NodeRef),
    Progress(StepProgress),
    Executed(NodeOutput),
    ExecutionSuccess(PromptRef),
    ExecutionInterrupted(Interrupted),
    ExecutionError(ExecutionFailure),
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub status: QueueInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeRef {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Sampler steps within one node. Older servers send neither id.
#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    pub prompt_id: String,
    pub node: String,
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interrupted {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// A node raised during execution.
///
/// Re-serializes to the full payload (unknown fields included), which is
/// what callers receive as the failure diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_type: String,
    pub exception_message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionFailure {
    /// `"<exception type>: <message>"`.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.exception_type, self.exception_message)
    }

    pub fn diagnostic(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Parse a text frame. Unknown `type`s are errors the caller logs and skips.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Parse a binary frame: `u32` event, `u32` image format (1 = JPEG,
/// 2 = PNG), both big-endian, then the encoded image.
pub fn parse_binary_message(frame: &[u8]) -> Option<PreviewImage> {
    let word = |at: usize| -> Option<u32> {
        let bytes: [u8; 4] = frame.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    };

    if word(0)? != BINARY_EVENT_PREVIEW_IMAGE {
        return None;
    }
    let format = match word(4)? {
        1 => PreviewFormat::Jpeg,
        2 => PreviewFormat::Png,
        _ => return None,
    };
    Some(PreviewImage {
        format,
        bytes: frame[8..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    #[test]
    fn queue_status() {
        let msg = parse(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#);
        assert_matches!(msg, ComfyUIMessage::Status(s) if s.status.exec_info.queue_remaining == 3);
    }

    #[test]
    fn lifecycle_messages() {
        assert_matches!(
            parse(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            ComfyUIMessage::ExecutionStart(p) if p.prompt_id == "p1"
        );
        assert_matches!(
            parse(r#"{"type":"execution_success","data":{"prompt_id":"p1","timestamp":1}}"#),
            ComfyUIMessage::ExecutionSuccess(p) if p.prompt_id == "p1"
        );
        assert_matches!(
            parse(r#"{"type":"execution_cached","data":{"prompt_id":"p1"}}"#),
            ComfyUIMessage::ExecutionCached(c) if c.nodes.is_empty()
        );
        assert_matches!(
            parse(r#"{"type":"execution_interrupted","data":{"prompt_id":"p1","node_id":"7"}}"#),
            ComfyUIMessage::ExecutionInterrupted(i) if i.node_id.as_deref() == Some("7")
        );
    }

    #[test]
    fn executing_null_node_ends_prompt() {
        let msg = parse(r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#);
        assert_matches!(
            msg,
            ComfyUIMessage::Executing(NodeRef { node: None, prompt_id: Some(id) }) if id == "xyz"
        );
    }

    #[test]
    fn progress_with_and_without_ids() {
        let msg = parse(r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"p","node":"3"}}"#);
        assert_matches!(
            msg,
            ComfyUIMessage::Progress(StepProgress { value: 5, max: 20, prompt_id: Some(_), node: Some(_) })
        );

        let msg = parse(r#"{"type":"progress","data":{"value":1,"max":2}}"#);
        assert_matches!(msg, ComfyUIMessage::Progress(StepProgress { prompt_id: None, node: None, .. }));
    }

    #[test]
    fn execution_error_diagnostic_keeps_unknown_fields() {
        let msg = parse(
            r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","node_type":"KSampler",
                "exception_message":"out of memory","exception_type":"RuntimeError",
                "traceback":["line 1"],"current_inputs":{"seed":1}}}"#,
        );
        let ComfyUIMessage::ExecutionError(failure) = msg else {
            panic!("expected execution_error");
        };
        assert_eq!(failure.summary(), "RuntimeError: out of memory");

        let diagnostic = failure.diagnostic();
        assert_eq!(diagnostic["node_type"], "KSampler");
        assert_eq!(diagnostic["traceback"][0], "line 1");
        assert_eq!(diagnostic["current_inputs"]["seed"], 1);
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(parse_message(r#"{"type":"crystools.monitor","data":{}}"#).is_err());
    }

    #[test]
    fn preview_frames() {
        let mut frame = vec![0, 0, 0, 1, 0, 0, 0, 2];
        frame.extend_from_slice(b"\x89PNG");
        let preview = parse_binary_message(&frame).unwrap();
        assert_eq!(preview.format, PreviewFormat::Png);
        assert_eq!(preview.bytes, b"\x89PNG");

        assert!(parse_binary_message(&[0, 0, 0, 9, 0, 0, 0, 1]).is_none());
        assert!(parse_binary_message(&[0, 0, 0, 1, 0, 0, 0, 5]).is_none());
        assert!(parse_binary_message(&[0, 0]).is_none());
    }
}
