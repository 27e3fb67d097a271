//! ComfyUI WebSocket and REST client library.
//!
//! Provides the [`ComputeClient`](compute::ComputeClient) seam used by the
//! job pipeline, remote task handles, typed message parsing, HTTP API
//! wrappers, reconnection logic and a [`ComfyUISession`](session::ComfyUISession)
//! that ties them together for one ComfyUI server.

pub mod api;
pub mod client;
pub mod compute;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod session;
pub mod task;
