//! Turns a finished prompt's output files into persisted artifacts.
//!
//! Outputs are processed one at a time in engine order: download, embed
//! provenance metadata, name, write. Batches additionally get a grid
//! image at index 0. Any failure aborts the whole collection.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;

use imagegen_comfyui::compute::{ComputeClient, OutputImage};
use imagegen_core::generation::{GenerationParameters, ProjectDocument, ProjectType};
use imagegen_core::grid::compose_grid_png;
use imagegen_core::metadata::{embed_metadata, output_extension, png, ContainerFormat};
use imagegen_core::naming::{resolve_file_name, resolve_output_path, NamingContext};

use crate::error::JobError;
use crate::events::{EventBus, GenerationEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Extension of the composed grid image.
const GRID_EXTENSION: &str = "png";

/// Attempts to find a free path when another writer wins the race for it.
const PERSIST_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// OutputArtifact
// ---------------------------------------------------------------------------

/// A persisted output: its path, encoded bytes and decoded pixels.
#[derive(Clone)]
pub struct OutputArtifact {
    path: PathBuf,
    bytes: Arc<[u8]>,
    image: Option<Arc<DynamicImage>>,
}

impl OutputArtifact {
    fn new(path: PathBuf, bytes: Vec<u8>) -> Self {
        Self {
            path,
            bytes: bytes.into(),
            image: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exactly the bytes written to [`path`](Self::path).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded image, `None` for outputs the decoder does not understand.
    pub fn image(&self) -> Option<&DynamicImage> {
        self.image.as_deref()
    }

    fn preload(&mut self) {
        match image::load_from_memory(&self.bytes) {
            Ok(decoded) => self.image = Some(Arc::new(decoded)),
            Err(e) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "Output is not a decodable image, skipping preload",
                );
            }
        }
    }
}

impl fmt::Debug for OutputArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputArtifact")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .field("decoded", &self.image.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OutputCollector
// ---------------------------------------------------------------------------

pub struct OutputCollector<'a> {
    client: &'a dyn ComputeClient,
    output_dir: &'a Path,
    events: &'a EventBus,
    file_name_template: Option<&'a str>,
    project_name: Option<&'a str>,
}

impl<'a> OutputCollector<'a> {
    pub fn new(client: &'a dyn ComputeClient, output_dir: &'a Path, events: &'a EventBus) -> Self {
        Self {
            client,
            output_dir,
            events,
            file_name_template: None,
            project_name: None,
        }
    }

    pub fn with_file_name_template(mut self, template: Option<&'a str>) -> Self {
        self.file_name_template = template;
        self
    }

    pub fn with_project_name(mut self, project_name: Option<&'a str>) -> Self {
        self.project_name = project_name;
        self
    }

    /// Download, annotate and persist `images`.
    ///
    /// Returns the artifacts in engine order, preceded by a grid when more
    /// than one image was produced. Every artifact is decoded before return.
    pub async fn collect(
        &self,
        images: &[OutputImage],
        parameters: &GenerationParameters,
        project: &ProjectDocument,
    ) -> Result<Vec<OutputArtifact>, JobError> {
        tokio::fs::create_dir_all(self.output_dir)
            .await
            .map_err(processing_failed(0))?;

        let total = images.len();
        let mut locked_project = project.clone();
        locked_project.lock_seed();

        let base_ctx = NamingContext::new(parameters.clone()).with_project(
            project.project_type,
            self.project_name.map(str::to_string),
        );

        let mut downloads = Vec::with_capacity(total);
        let mut artifacts = Vec::with_capacity(total + 1);

        for (index, image) in images.iter().enumerate() {
            tracing::debug!(file_name = %image.filename, index, "Downloading output image");
            let bytes = self
                .client
                .download_image(image)
                .await
                .map_err(processing_failed(index))?;

            let batch_index = index as u32 + 1;
            let item_project = if total > 1 && project.project_type == ProjectType::TextToImage {
                locked_project.with_batch_index(batch_index)
            } else {
                locked_project.clone()
            };

            let format = ContainerFormat::from_file_name(&image.filename);
            let embedded = embed_metadata(&bytes, format, parameters, &item_project)
                .map_err(processing_failed(index))?;

            let ctx = base_ctx.clone().with_batch(batch_index, total as u32);
            let base_name = resolve_file_name(self.file_name_template, &ctx);
            let path = persist(
                self.output_dir,
                &base_name,
                &output_extension(&image.filename),
                &embedded,
            )
            .await
            .map_err(processing_failed(index))?;

            tracing::info!(path = %path.display(), index, "Output image saved");
            self.events.publish(GenerationEvent::FileAdded { path: path.clone() });
            artifacts.push(OutputArtifact::new(path, embedded));
            downloads.push(bytes);
        }

        if artifacts.len() > 1 {
            let grid = self
                .write_grid(downloads, parameters, &locked_project, &base_ctx)
                .await
                .map_err(|reason| JobError::OutputProcessingFailed {
                    index: total,
                    reason,
                })?;
            artifacts.insert(0, grid);
        }

        preload_all(artifacts).await
    }

    async fn write_grid(
        &self,
        downloads: Vec<Vec<u8>>,
        parameters: &GenerationParameters,
        project: &ProjectDocument,
        base_ctx: &NamingContext,
    ) -> Result<OutputArtifact, String> {
        let grid = tokio::task::spawn_blocking(move || compose_grid_png(&downloads))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;

        let embedded = png::add_metadata(&grid, parameters, project).map_err(|e| e.to_string())?;

        let base_name = resolve_file_name(self.file_name_template, &base_ctx.clone().as_grid());
        let path = persist(self.output_dir, &base_name, GRID_EXTENSION, &embedded)
            .await
            .map_err(|e| e.to_string())?;

        tracing::info!(path = %path.display(), "Grid image saved");
        self.events.publish(GenerationEvent::FileAdded { path: path.clone() });
        Ok(OutputArtifact::new(path, embedded))
    }
}

fn processing_failed<E: fmt::Display>(index: usize) -> impl FnOnce(E) -> JobError {
    move |e| JobError::OutputProcessingFailed {
        index,
        reason: e.to_string(),
    }
}

async fn preload_all(artifacts: Vec<OutputArtifact>) -> Result<Vec<OutputArtifact>, JobError> {
    let count = artifacts.len();
    tokio::task::spawn_blocking(move || {
        let mut artifacts = artifacts;
        artifacts.iter_mut().for_each(OutputArtifact::preload);
        artifacts
    })
    .await
    .map_err(processing_failed(count))
}

/// Write `bytes` to a fresh file named after `base` in `dir`.
///
/// Path resolution probes the filesystem, so the whole step runs on the
/// blocking pool.
pub async fn persist(dir: &Path, base: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let dir = dir.to_path_buf();
    let base = base.to_string();
    let extension = extension.to_string();
    let bytes = bytes.to_vec();

    tokio::task::spawn_blocking(move || {
        persist_with(&dir, &base, &extension, |file| file.write_all(&bytes))
    })
    .await
    .map_err(io::Error::other)?
}

/// Create a fresh file and fill it with `write`.
///
/// The file is created exclusively, so a path taken between resolution and
/// creation is resolved again instead of being overwritten. A file whose
/// write fails is removed.
fn persist_with<F>(dir: &Path, base: &str, extension: &str, write: F) -> io::Result<PathBuf>
where
    F: Fn(&mut File) -> io::Result<()>,
{
    let mut last_err = None;

    for _ in 0..PERSIST_ATTEMPTS {
        let path = resolve_output_path(dir, base, extension);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = write(&mut file) {
                    drop(file);
                    if let Err(remove_err) = std::fs::remove_file(&path) {
                        tracing::warn!(
                            path = %path.display(),
                            error = %remove_err,
                            "Could not remove partially written output",
                        );
                    }
                    return Err(e);
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "Output path taken concurrently, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::AlreadyExists, "no free output path")))
}
