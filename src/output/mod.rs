mod encode;
mod folder;

pub use encode::{encode_view, encode_jpeg};
pub use folder::LabelFolderSink;

use std::path::PathBuf;

use image::DynamicImage;

use crate::error::Result;

/// Trait for save destinations
pub trait OutputSink {
    /// Persist `image` under `label` and return where it was written
    fn write_image(&mut self, label: &str, image: &DynamicImage) -> Result<PathBuf>;
}
