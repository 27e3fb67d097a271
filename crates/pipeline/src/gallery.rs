//! Sink for previews and finished artifacts.

use imagegen_comfyui::compute::PreviewImage;

use crate::collector::OutputArtifact;

/// The caller's view of a job's images.
///
/// Called from background tasks, so implementations must be thread-safe
/// and must not block.
pub trait OutputGallery: Send + Sync {
    /// Replace the live preview.
    fn set_preview_image(&self, preview: PreviewImage);

    fn clear_preview(&self);

    /// Remove artifacts of earlier jobs.
    fn clear_images(&self);

    /// Append finished artifacts, grid first.
    fn add_images(&self, artifacts: &[OutputArtifact]);
}

/// A gallery that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGallery;

impl OutputGallery for NullGallery {
    fn set_preview_image(&self, _preview: PreviewImage) {}
    fn clear_preview(&self) {}
    fn clear_images(&self) {}
    fn add_images(&self, _artifacts: &[OutputArtifact]) {}
}
