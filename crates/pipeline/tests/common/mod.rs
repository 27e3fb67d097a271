#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::json;
use tokio::sync::{broadcast, Notify};

use imagegen_comfyui::compute::{
    ComputeClient, ComputeError, OutputImage, OutputMap, PreviewFormat, PreviewImage,
};
use imagegen_comfyui::task::{RemoteTask, TaskError, TaskReporter};
use imagegen_core::generation::{GenerationParameters, ProjectDocument, ProjectType};
use imagegen_pipeline::collector::OutputArtifact;
use imagegen_pipeline::gallery::OutputGallery;
use imagegen_pipeline::job::Job;

/// Output node used by [`test_job`].
pub const OUTPUT_NODE: &str = "9";

// ---------------------------------------------------------------------------
// Fake compute client
// ---------------------------------------------------------------------------

/// What the fake does when a workflow is submitted.
#[derive(Debug, Clone)]
pub enum SubmitBehavior {
    /// Queue and complete immediately.
    Complete,
    /// Queue and leave the task running; drive it with `with_reporter`.
    Hold,
    /// Refuse with a structured diagnostic.
    Reject(serde_json::Value),
    /// Queue, then fail with a node execution error.
    FailExecution(serde_json::Value),
    /// Never answer.
    Pending,
}

/// In-memory [`ComputeClient`] that records every call.
pub struct FakeComputeClient {
    output_dir: Option<PathBuf>,
    behavior: Mutex<SubmitBehavior>,
    outputs: Mutex<OutputMap>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    gate_fetch: AtomicBool,
    reporter: Mutex<Option<TaskReporter>>,
    preview_tx: broadcast::Sender<PreviewImage>,

    pub submit_started: Notify,
    pub submitted: Notify,
    pub fetch_started: Notify,
    pub submissions: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub releases: Arc<AtomicUsize>,
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeComputeClient {
    pub fn new(output_dir: Option<&Path>) -> Arc<Self> {
        let (preview_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            output_dir: output_dir.map(Path::to_path_buf),
            behavior: Mutex::new(SubmitBehavior::Complete),
            outputs: Mutex::new(OutputMap::new()),
            files: Mutex::new(HashMap::new()),
            gate_fetch: AtomicBool::new(false),
            reporter: Mutex::new(None),
            preview_tx,
            submit_started: Notify::new(),
            submitted: Notify::new(),
            fetch_started: Notify::new(),
            submissions: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: SubmitBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Register an output image of `node` served by `download_image`.
    pub fn add_output(&self, node: &str, filename: &str, bytes: Vec<u8>) {
        self.outputs
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push(OutputImage::new(filename));
        self.files.lock().unwrap().insert(filename.to_string(), bytes);
    }

    /// List an output image that `download_image` cannot serve.
    pub fn add_unavailable_output(&self, node: &str, filename: &str) {
        self.outputs
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push(OutputImage::new(filename));
    }

    /// Report an empty image list for `node`.
    pub fn add_empty_output(&self, node: &str) {
        self.outputs.lock().unwrap().insert(node.to_string(), Vec::new());
    }

    /// Make `fetch_outputs` hang after signalling `fetch_started`.
    pub fn gate_fetch(&self) {
        self.gate_fetch.store(true, Ordering::SeqCst);
    }

    pub fn with_reporter<R>(&self, f: impl FnOnce(&TaskReporter) -> R) -> R {
        let guard = self.reporter.lock().unwrap();
        f(guard.as_ref().expect("a prompt was submitted"))
    }

    pub fn send_preview(&self, bytes: Vec<u8>) -> usize {
        self.preview_tx
            .send(PreviewImage {
                format: PreviewFormat::Jpeg,
                bytes,
            })
            .unwrap_or(0)
    }

    pub fn preview_receivers(&self) -> usize {
        self.preview_tx.receiver_count()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ComputeClient for FakeComputeClient {
    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    async fn upload_image(&self, bytes: Vec<u8>, upload_name: &str) -> Result<(), ComputeError> {
        self.uploads
            .lock()
            .unwrap()
            .push((upload_name.to_string(), bytes));
        Ok(())
    }

    async fn submit(&self, _workflow: &serde_json::Value) -> Result<RemoteTask, ComputeError> {
        self.submit_started.notify_one();
        let behavior = self.behavior.lock().unwrap().clone();

        match &behavior {
            SubmitBehavior::Reject(diagnostic) => {
                return Err(ComputeError::Rejected {
                    message: "Prompt outputs failed validation".into(),
                    diagnostic: diagnostic.clone(),
                });
            }
            SubmitBehavior::Pending => std::future::pending::<()>().await,
            _ => {}
        }

        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let (task, reporter) = RemoteTask::new(format!("ABCDEF{n:02}-0000-4000-8000-000000000000"));
        let releases = Arc::clone(&self.releases);
        let task = task.with_release(move |_| {
            releases.fetch_add(1, Ordering::SeqCst);
        });

        match behavior {
            SubmitBehavior::Complete => {
                reporter.complete();
            }
            SubmitBehavior::FailExecution(diagnostic) => {
                reporter.fail(TaskError::Execution {
                    message: "ValueError: boom".into(),
                    diagnostic,
                });
            }
            _ => {}
        }

        *self.reporter.lock().unwrap() = Some(reporter);
        self.submitted.notify_one();
        Ok(task)
    }

    async fn interrupt(&self, _timeout: Duration) -> Result<(), ComputeError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_outputs(&self, _prompt_id: &str) -> Result<OutputMap, ComputeError> {
        if self.gate_fetch.load(Ordering::SeqCst) {
            self.fetch_started.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(self.outputs.lock().unwrap().clone())
    }

    async fn download_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComputeError> {
        self.files
            .lock()
            .unwrap()
            .get(&image.filename)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(image.filename.clone()))
    }

    fn subscribe_previews(&self) -> broadcast::Receiver<PreviewImage> {
        self.preview_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Recording gallery
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingGallery {
    pub previews: Mutex<Vec<PreviewImage>>,
    pub added: Mutex<Vec<PathBuf>>,
    pub clear_preview_calls: AtomicUsize,
    pub clear_images_calls: AtomicUsize,
}

impl RecordingGallery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn added_paths(&self) -> Vec<PathBuf> {
        self.added.lock().unwrap().clone()
    }
}

impl OutputGallery for RecordingGallery {
    fn set_preview_image(&self, preview: PreviewImage) {
        self.previews.lock().unwrap().push(preview);
    }

    fn clear_preview(&self) {
        self.clear_preview_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_images(&self) {
        self.clear_images_calls.fetch_add(1, Ordering::SeqCst);
        self.added.lock().unwrap().clear();
    }

    fn add_images(&self, artifacts: &[OutputArtifact]) {
        self.added
            .lock()
            .unwrap()
            .extend(artifacts.iter().map(|a| a.path().to_path_buf()));
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn test_parameters() -> GenerationParameters {
    GenerationParameters {
        positive_prompt: Some("a lighthouse at dusk".into()),
        negative_prompt: Some("blurry".into()),
        seed: Some(42),
        steps: Some(20),
        sampler: Some("euler".into()),
        cfg_scale: Some(7.0),
        width: Some(8),
        height: Some(8),
        model_name: Some("sdxl_base".into()),
        ..Default::default()
    }
}

pub fn test_project() -> ProjectDocument {
    ProjectDocument::new(ProjectType::TextToImage)
        .with_module("Seed", json!({"Seed": 42, "IsRandomizeEnabled": true}))
        .with_module("BatchSize", json!({"BatchSize": 3, "BatchCount": 1}))
}

pub fn test_job() -> Job {
    Job::new(
        json!({"9": {"class_type": "SaveImage", "inputs": {}}}),
        vec![OUTPUT_NODE.to_string()],
    )
    .with_parameters(test_parameters())
    .with_project(test_project())
}

pub fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    encode(width, height, shade, ImageFormat::Png)
}

pub fn webp_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    encode(width, height, shade, ImageFormat::WebP)
}

fn encode(width: u32, height: u32, shade: u8, format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([shade, shade, shade, 255]),
    ));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

/// Files currently in `dir`, sorted by name.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Poll `condition` until it holds, failing the test after one second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
