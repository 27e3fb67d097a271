//! Provenance metadata embedding for output images.
//!
//! Each container format has its own pure byte-transform; [`embed_metadata`]
//! dispatches on the [`ContainerFormat`] detected from the output filename.
//! Formats without metadata support pass through unchanged.

pub mod png;
pub mod webp;

use std::path::Path;

use crate::error::CoreError;
use crate::generation::{GenerationParameters, ProjectDocument};

/// Output container formats the embedder distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Png,
    Webp,
    /// Anything else; written as-is with no metadata.
    Opaque,
}

impl ContainerFormat {
    /// Detect the container from a filename's extension (case-insensitive).
    pub fn from_file_name(file_name: &str) -> Self {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("png") => Self::Png,
            Some("webp") => Self::Webp,
            _ => Self::Opaque,
        }
    }
}

/// Extension to use for the persisted file (without the dot).
///
/// Opaque formats keep whatever extension the engine assigned, falling back
/// to `bin` when there is none.
pub fn output_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "bin".to_string())
}

/// Attach generation parameters and the project document to `bytes`.
pub fn embed_metadata(
    bytes: &[u8],
    format: ContainerFormat,
    parameters: &GenerationParameters,
    project: &ProjectDocument,
) -> Result<Vec<u8>, CoreError> {
    match format {
        ContainerFormat::Png => png::add_metadata(bytes, parameters, project),
        ContainerFormat::Webp => {
            let description = serde_json::to_string(parameters)?;
            let software = serde_json::to_string(project)?;
            webp::add_exif_metadata(bytes, &description, &software)
        }
        ContainerFormat::Opaque => Ok(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ProjectType;

    #[test]
    fn detects_formats_case_insensitively() {
        assert_eq!(ContainerFormat::from_file_name("a.png"), ContainerFormat::Png);
        assert_eq!(ContainerFormat::from_file_name("a.PNG"), ContainerFormat::Png);
        assert_eq!(ContainerFormat::from_file_name("a_00001_.webp"), ContainerFormat::Webp);
        assert_eq!(ContainerFormat::from_file_name("a.jpg"), ContainerFormat::Opaque);
        assert_eq!(ContainerFormat::from_file_name("noext"), ContainerFormat::Opaque);
    }

    #[test]
    fn output_extension_keeps_engine_extension() {
        assert_eq!(output_extension("clip.gif"), "gif");
        assert_eq!(output_extension("noext"), "bin");
    }

    #[test]
    fn opaque_passes_through() {
        let bytes = b"GIF89a...".to_vec();
        let out = embed_metadata(
            &bytes,
            ContainerFormat::Opaque,
            &GenerationParameters::default(),
            &ProjectDocument::new(ProjectType::TextToImage),
        )
        .unwrap();
        assert_eq!(out, bytes);
    }
}
