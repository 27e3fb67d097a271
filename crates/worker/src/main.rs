mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagegen_comfyui::compute::PreviewImage;
use imagegen_comfyui::session::ComfyUISession;
use imagegen_pipeline::collector::OutputArtifact;
use imagegen_pipeline::events::GenerationEvent;
use imagegen_pipeline::gallery::OutputGallery;
use imagegen_pipeline::job::{Job, JobOutcome};
use imagegen_pipeline::orchestrator::JobOrchestrator;

use config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "imagegen_worker=debug,imagegen_pipeline=debug,imagegen_comfyui=info".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(config.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    tracing::info!(
        comfyui_url = %config.comfyui_url,
        output_dir = %config.output_dir.display(),
        "Loaded worker configuration",
    );

    // --- Job ---
    let job_path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: imagegen-worker <job.json>")?;
    let job = load_job(&job_path).await?;
    tracing::info!(
        job_file = %job_path.display(),
        output_nodes = ?job.output_node_names,
        input_images = job.input_images.len(),
        "Loaded job",
    );

    // --- ComfyUI session ---
    let session = ComfyUISession::connect(config.session_config())
        .await
        .context("Failed to connect to ComfyUI")?;
    tracing::info!(client_id = %session.client_id(), "ComfyUI session started");

    // --- Orchestrator ---
    let orchestrator = JobOrchestrator::new(
        session.clone(),
        Arc::new(LoggingGallery),
        config.orchestrator_config(),
    );
    let events_handle = tokio::spawn(log_events(orchestrator.subscribe()));

    // --- Ctrl-C cancels the job ---
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    let ctrl_c_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, cancelling job");
            ctrl_c_cancel.cancel();
        }
    });

    let result = orchestrator.run(&job, &cancel).await;

    ctrl_c_handle.abort();
    drop(orchestrator);
    let _ = events_handle.await;
    session.shutdown().await;

    match result? {
        JobOutcome::Completed(artifacts) => {
            for artifact in &artifacts {
                println!("{}", artifact.path().display());
            }
            tracing::info!(artifact_count = artifacts.len(), "Job finished");
        }
        JobOutcome::NoOutput => tracing::warn!("Job finished without output images"),
    }

    Ok(())
}

async fn load_job(path: &std::path::Path) -> anyhow::Result<Job> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid job file {}", path.display()))
}

/// Log lifecycle events until the orchestrator is dropped.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<GenerationEvent>) {
    loop {
        match events.recv().await {
            Ok(GenerationEvent::FileAdded { path }) => {
                tracing::info!(path = %path.display(), "File added");
            }
            Ok(GenerationEvent::PromptCompleted {
                short_id,
                preview_path,
            }) => {
                tracing::info!(
                    prompt = %short_id,
                    preview = ?preview_path,
                    "Prompt completed",
                );
            }
            Ok(GenerationEvent::NoOutput) => tracing::warn!("No output images received"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Headless gallery: reports what a UI would show.
struct LoggingGallery;

impl OutputGallery for LoggingGallery {
    fn set_preview_image(&self, preview: PreviewImage) {
        tracing::trace!(format = ?preview.format, len = preview.bytes.len(), "Preview frame");
    }

    fn clear_preview(&self) {}

    fn clear_images(&self) {}

    fn add_images(&self, artifacts: &[OutputArtifact]) {
        tracing::debug!(count = artifacts.len(), "Artifacts added to gallery");
    }
}
