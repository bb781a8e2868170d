use anyhow::Result;
use image::RgbImage;

use crate::mask::Mask;
use crate::prompt::{PromptBox, PromptPoint};

/// Identifies the embedding a backend computed for one uploaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingHandle {
    /// Bumped on every `set_image`
    pub generation: u64,
    pub width: u32,
    pub height: u32,
}

/// A candidate mask with the backend's confidence
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mask: Mask,
    pub score: f32,
}

impl Prediction {
    pub fn new(mask: Mask, score: f32) -> Self {
        Self { mask, score }
    }
}

/// Trait for promptable segmentation models
///
/// One instance serves one session: it owns the embedding of the image the
/// session is working on.
pub trait SegmentationBackend: Send {
    /// Compute and cache the embedding for `image`
    ///
    /// Expensive; the session calls this once per upload.
    fn set_image(&mut self, image: &RgbImage) -> Result<EmbeddingHandle>;

    /// Candidate masks for the prompts, against the cached embedding
    ///
    /// At most one box per call. Masks match the image passed to `set_image`.
    fn predict(
        &mut self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
    ) -> Result<Vec<Prediction>>;

    /// Independently discovered masks covering the image
    fn generate_automatic(&mut self, image: &RgbImage) -> Result<Vec<Mask>>;
}
