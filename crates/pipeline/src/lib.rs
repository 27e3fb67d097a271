//! Generation job pipeline.
//!
//! Submits a job through a [`ComputeClient`](imagegen_comfyui::compute::ComputeClient),
//! tracks its progress, handles cancellation and turns the engine's outputs
//! into named, metadata-annotated files on disk.

pub mod collector;
pub mod error;
pub mod events;
pub mod gallery;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod router;
pub mod upload;
