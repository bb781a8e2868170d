use anyhow::Result;
use ndarray::{Array2, ArrayView2};

use super::preprocess::Preprocessor;
use crate::mask::Mask;
use crate::prompt::{PromptBox, PromptPoint};

/// Raw decoder output for one candidate
#[derive(Debug, Clone)]
pub struct LogitMask {
    /// Mask logits at image resolution, `[height, width]`
    pub logits: Array2<f32>,
    /// Predicted IoU reported by the decoder
    pub iou: f32,
}

/// Anything that can turn prompts into candidate logits for the current image
pub trait LogitDecoder {
    fn decode(
        &mut self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
    ) -> Result<Vec<LogitMask>>;
}

/// Automatic mask generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct AutoMaskConfig {
    /// Grid density: this many prompt points along each side
    pub points_per_side: u32,
    /// Drop candidates whose predicted IoU is lower than this
    pub pred_iou_thresh: f32,
    /// Drop candidates whose stability score is lower than this
    pub stability_score_thresh: f32,
    /// Logit offset used to measure stability
    pub stability_score_offset: f32,
    /// Box IoU above which the lower-scoring duplicate is dropped
    pub box_nms_thresh: f32,
    /// Masks with fewer pixels than this are dropped
    pub min_mask_region_area: usize,
}

impl Default for AutoMaskConfig {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            pred_iou_thresh: 0.88,
            stability_score_thresh: 0.95,
            stability_score_offset: 1.0,
            box_nms_thresh: 0.7,
            min_mask_region_area: 0,
        }
    }
}

/// Grid-prompted mask generator with score filtering and box NMS
#[derive(Debug, Clone, Default)]
pub struct AutoMaskGenerator {
    config: AutoMaskConfig,
}

struct Candidate {
    mask: Mask,
    bbox: (u32, u32, u32, u32),
    score: f32,
}

impl AutoMaskGenerator {
    pub fn new(config: AutoMaskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AutoMaskConfig {
        &self.config
    }

    /// Prompt every grid point and keep the surviving, de-duplicated masks
    ///
    /// Output is ordered by descending predicted IoU.
    pub fn generate(
        &self,
        decoder: &mut dyn LogitDecoder,
        width: u32,
        height: u32,
    ) -> Result<Vec<Mask>> {
        let _span = tracing::debug_span!("auto_masks").entered();

        let mut candidates = Vec::new();
        for point in self.grid(width, height) {
            for output in decoder.decode(&[point], None)? {
                if let Some(candidate) = self.filter(output) {
                    candidates.push(candidate);
                }
            }
        }

        let found = candidates.len();
        let kept = self.non_max_suppression(candidates);
        tracing::debug!("Automatic masks: {} candidates, {} kept", found, kept.len());

        Ok(kept.into_iter().map(|c| c.mask).collect())
    }

    /// Foreground points at the centres of an n×n grid of cells
    fn grid(&self, width: u32, height: u32) -> Vec<PromptPoint> {
        let n = self.config.points_per_side.max(1);
        let step_x = width as f32 / n as f32;
        let step_y = height as f32 / n as f32;

        (0..n)
            .flat_map(|j| {
                (0..n).map(move |i| {
                    PromptPoint::foreground((i as f32 + 0.5) * step_x, (j as f32 + 0.5) * step_y)
                })
            })
            .collect()
    }

    fn filter(&self, output: LogitMask) -> Option<Candidate> {
        if output.iou < self.config.pred_iou_thresh {
            return None;
        }

        let stability = stability_score(
            output.logits.view(),
            0.0,
            self.config.stability_score_offset,
        );
        if stability < self.config.stability_score_thresh {
            return None;
        }

        let mask = Preprocessor::logits_to_mask(output.logits.view(), 0.0);
        if mask.count() < self.config.min_mask_region_area.max(1) {
            return None;
        }

        let bbox = mask.bounding_box()?;
        Some(Candidate {
            mask,
            bbox,
            score: output.iou,
        })
    }

    fn non_max_suppression(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut kept: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            let duplicate = kept
                .iter()
                .any(|k| box_iou(k.bbox, candidate.bbox) > self.config.box_nms_thresh);
            if !duplicate {
                kept.push(candidate);
            }
        }
        kept
    }
}

/// IoU between the mask thresholded at `threshold ± offset`
pub fn stability_score(logits: ArrayView2<f32>, threshold: f32, offset: f32) -> f32 {
    let strict = logits.iter().filter(|&&v| v > threshold + offset).count();
    let loose = logits.iter().filter(|&&v| v > threshold - offset).count();
    if loose == 0 {
        0.0
    } else {
        strict as f32 / loose as f32
    }
}

fn box_iou(a: (u32, u32, u32, u32), b: (u32, u32, u32, u32)) -> f32 {
    let area = |(x1, y1, x2, y2): (u32, u32, u32, u32)| ((x2 - x1 + 1) * (y2 - y1 + 1)) as f32;

    let ix1 = a.0.max(b.0);
    let iy1 = a.1.max(b.1);
    let ix2 = a.2.min(b.2);
    let iy2 = a.3.min(b.3);
    if ix1 > ix2 || iy1 > iy2 {
        return 0.0;
    }

    let inter = area((ix1, iy1, ix2, iy2));
    inter / (area(a) + area(b) - inter)
}
