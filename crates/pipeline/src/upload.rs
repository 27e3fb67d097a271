//! Uploads the local input images a workflow references.

use std::path::{Path, PathBuf};

use imagegen_comfyui::compute::ComputeClient;
use imagegen_core::hashing::upload_file_name;
use imagegen_core::metadata::png;

use crate::error::JobError;

/// Upload every image in order, each under its content-addressed name.
///
/// PNG text chunks are stripped first; some engine-side decoders reject
/// otherwise valid files that carry them.
pub async fn upload_input_images(
    client: &dyn ComputeClient,
    images: &[PathBuf],
) -> Result<Vec<String>, JobError> {
    let mut names = Vec::with_capacity(images.len());

    for path in images {
        let original = tokio::fs::read(path).await.map_err(|e| {
            JobError::InvalidRequest(format!("Cannot read input image {}: {e}", path.display()))
        })?;

        let extension = path.extension().and_then(|e| e.to_str());
        let upload_name = upload_file_name(&original, extension);
        let bytes = prepare_upload(path, original);

        tracing::debug!(
            file_name = %path.display(),
            upload_name = %upload_name,
            "Uploading input image",
        );
        client.upload_image(bytes, &upload_name).await?;
        names.push(upload_name);
    }

    Ok(names)
}

fn prepare_upload(path: &Path, original: Vec<u8>) -> Vec<u8> {
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if !is_png {
        return original;
    }
    match png::strip_metadata(&original) {
        Ok(stripped) => stripped,
        Err(e) => {
            tracing::warn!(
                file_name = %path.display(),
                error = %e,
                "Could not strip PNG metadata, uploading unchanged",
            );
            original
        }
    }
}
