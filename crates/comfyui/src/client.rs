//! WebSocket endpoint of a ComfyUI instance.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Failed to open ComfyUI WebSocket at {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
}

/// Dials the event socket of one ComfyUI instance.
///
/// The engine addresses `executing`, `progress` and preview frames by
/// client id, and the same id is sent with every submitted prompt. It is
/// therefore generated once here and kept across reconnects.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    client_id: String,
    ws_base: String,
}

/// An open event socket.
pub struct ComfyUIConnection {
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// `ws_base` is the socket root, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_base: impl Into<String>) -> Self {
        let ws_base: String = ws_base.into();
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
        }
    }

    /// Client for the socket next to an HTTP API root.
    pub fn for_api_url(api_url: &str) -> Self {
        Self::new(ws_url_from_api_url(api_url))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Full socket URL including the `clientId` query.
    pub fn endpoint(&self) -> String {
        format!("{}/ws?clientId={}", self.ws_base, self.client_id)
    }

    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let endpoint = self.endpoint();
        let (ws_stream, _) = connect_async(endpoint.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection {
                endpoint: self.ws_base.clone(),
                source: Box::new(e),
            }
        })?;

        tracing::info!(
            client_id = %self.client_id,
            endpoint = %self.ws_base,
            "ComfyUI WebSocket open",
        );
        Ok(ComfyUIConnection { ws_stream })
    }
}

/// Map an `http(s)://` API root to its `ws(s)://` counterpart. Anything
/// else is assumed to be a socket URL already.
pub fn ws_url_from_api_url(api_url: &str) -> String {
    let root = api_url.trim_end_matches('/');
    match root.split_once("://") {
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("http", rest)) => format!("ws://{rest}"),
        _ => root.to_string(),
    }
}
