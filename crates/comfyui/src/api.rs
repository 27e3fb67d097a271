//! HTTP side of a ComfyUI instance: queueing, interrupting, history,
//! and moving image files in and out.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::compute::{OutputImage, OutputMap};

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx status; `body` is the raw response text.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// `/prompt` answered 400 with an `{error, node_errors}` body.
    #[error("Prompt rejected: {message}")]
    PromptRejected {
        message: String,
        body: serde_json::Value,
    },
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position.
    pub number: i32,
    /// Validation problems on nodes that did not block queueing.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

pub struct ComfyUIApi {
    http: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// `api_url` is the server root, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url: String = api_url.into();
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue `workflow` on behalf of the socket identified by `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let request = self.http.post(self.url("/prompt")).json(&serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        }));

        let response = request.send().await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            return Err(rejection_from_body(&text).unwrap_or(ComfyUIApiError::ApiError {
                status: StatusCode::BAD_REQUEST.as_u16(),
                body: text,
            }));
        }
        Ok(success(response).await?.json().await?)
    }

    /// Stop whatever the server is executing. The engine has no per-prompt
    /// interrupt, so callers only send this while their prompt is the one
    /// that can be running.
    pub async fn interrupt(&self, timeout: Duration) -> Result<(), ComfyUIApiError> {
        send(self.http.post(self.url("/interrupt")).timeout(timeout)).await?;
        Ok(())
    }

    /// Raw `/history/{id}` document.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = send(self.http.get(self.url(&format!("/history/{prompt_id}")))).await?;
        Ok(response.json().await?)
    }

    pub async fn view_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.http.get(self.url("/view")).query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.folder_type.as_str()),
        ]);
        Ok(send(request).await?.bytes().await?.to_vec())
    }

    /// Store `bytes` in the server's input folder as `file_name`,
    /// replacing a same-named file.
    pub async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<(), ComfyUIApiError> {
        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string()),
            )
            .text("type", "input")
            .text("overwrite", "true");

        send(self.http.post(self.url("/upload/image")).multipart(form)).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ComfyUIApiError> {
    success(request.send().await?).await
}

async fn success(response: Response) -> Result<Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ComfyUIApiError::ApiError {
        status: status.as_u16(),
        body,
    })
}

/// Interpret a `400` body of the form
/// `{"error": {"type", "message", "details"}, "node_errors": {...}}`.
pub fn rejection_from_body(text: &str) -> Option<ComfyUIApiError> {
    let body: serde_json::Value = serde_json::from_str(text).ok()?;
    let error = body.get("error")?;
    let message = match error {
        serde_json::Value::String(s) => s.clone(),
        other => {
            let msg = other.get("message").and_then(|m| m.as_str()).unwrap_or("");
            let details = other.get("details").and_then(|d| d.as_str()).unwrap_or("");
            if details.is_empty() {
                msg.to_string()
            } else {
                format!("{msg}: {details}")
            }
        }
    };
    Some(ComfyUIApiError::PromptRejected { message, body })
}

/// Extract the image outputs of `prompt_id` from a `/history` response.
///
/// Nodes without an `images` array are skipped; image order is preserved.
pub fn parse_history_outputs(history: &serde_json::Value, prompt_id: &str) -> Option<OutputMap> {
    let outputs = history.get(prompt_id)?.get("outputs")?.as_object()?;

    let map = outputs
        .iter()
        .filter_map(|(node_id, output)| {
            let images = output.get("images")?.as_array()?;
            let parsed = images
                .iter()
                .filter_map(|img| serde_json::from_value::<OutputImage>(img.clone()).ok())
                .collect::<Vec<_>>();
            Some((node_id.clone(), parsed))
        })
        .collect();
    Some(map)
}
