//! Filesystem layout for artifact exchange with the host application.
//!
//! Export artifacts live under `<project-root>/_AI_CACHE/`, inference
//! results under `<project-root>/_AI_OUT/`. File names are derived from
//! the composition name (sanitized) and the frame index, so the same
//! frame always maps to the same paths.

use std::path::{Path, PathBuf};

/// Directory under the project root holding exported frames and masks.
pub const CACHE_DIR_NAME: &str = "_AI_CACHE";

/// Directory under the project root holding inference results.
pub const OUTPUT_DIR_NAME: &str = "_AI_OUT";

/// Replace every non-alphanumeric character with `_`.
///
/// Composition names are user-controlled and may contain separators,
/// spaces, or unicode; the sanitized form is safe as a file-name stem
/// on every platform the host runs on.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `<root>/_AI_CACHE`
pub fn cache_dir(root: &Path) -> PathBuf {
    root.join(CACHE_DIR_NAME)
}

/// `<root>/_AI_OUT`
pub fn output_dir(root: &Path) -> PathBuf {
    root.join(OUTPUT_DIR_NAME)
}

/// Shared `<sanitized-comp>_frame<N>` stem for one frame's artifacts.
pub fn frame_stem(composition_name: &str, frame_index: u32) -> String {
    format!("{}_frame{}", sanitize_name(composition_name), frame_index)
}

/// Path the host writes the exported frame image to.
pub fn image_path(root: &Path, composition_name: &str, frame_index: u32) -> PathBuf {
    cache_dir(root).join(format!("{}_image.png", frame_stem(composition_name, frame_index)))
}

/// Path the host writes the exported mask to.
pub fn mask_path(root: &Path, composition_name: &str, frame_index: u32) -> PathBuf {
    cache_dir(root).join(format!("{}_mask.png", frame_stem(composition_name, frame_index)))
}

/// Path the pipeline writes the inference result to.
pub fn result_path(root: &Path, composition_name: &str, frame_index: u32) -> PathBuf {
    output_dir(root).join(format!("{}_result.png", frame_stem(composition_name, frame_index)))
}
