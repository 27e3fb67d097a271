//! Pure domain logic for the image generation pipeline.
//!
//! Nothing in this crate performs network I/O. It owns the generation
//! parameter and project document models, output file naming, per-format
//! metadata embedding, and grid composition.

pub mod error;
pub mod generation;
pub mod grid;
pub mod hashing;
pub mod metadata;
pub mod naming;
