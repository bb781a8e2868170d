mod auto;
mod preprocess;
mod sam;
mod scripted;
pub mod types;

pub use auto::{stability_score, AutoMaskConfig, AutoMaskGenerator, LogitDecoder, LogitMask};
pub use preprocess::{Preprocessor, SAM_INPUT_SIZE};
pub use sam::{SamModel, SamPredictor};
pub use scripted::{BackendCall, ScriptedBackend};
pub use types::{EmbeddingHandle, Prediction, SegmentationBackend};

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use image::RgbImage;

use crate::mask::Mask;
use crate::prompt::{PromptBox, PromptPoint};

/// Build a backend factory that shares one loaded SAM model
///
/// Every call of the returned closure makes a fresh predictor with its own
/// embedding cache.
pub fn create_default_factory(
    encoder_path: &Path,
    decoder_path: &Path,
    auto: AutoMaskConfig,
) -> Result<impl Fn() -> Box<dyn SegmentationBackend> + Send + Sync> {
    let model = SamModel::load(encoder_path, decoder_path)?.shared();
    Ok(move || {
        Box::new(SamPredictor::new(
            Arc::clone(&model),
            AutoMaskGenerator::new(auto.clone()),
        )) as Box<dyn SegmentationBackend>
    })
}

/// How a set of prompts is turned into backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPlan {
    /// No prompts: let the backend discover masks on its own
    Automatic,
    /// Points with at most one box: one call, best candidate wins
    Single,
    /// Several boxes: one call per box, points are not used
    PerBox,
}

impl PromptPlan {
    pub fn for_counts(points: usize, boxes: usize) -> Self {
        match (points, boxes) {
            (0, 0) => PromptPlan::Automatic,
            (_, 0) | (_, 1) => PromptPlan::Single,
            _ => PromptPlan::PerBox,
        }
    }
}

/// Index of the highest score; ties go to the first, NaN scores never win
pub fn select_best(candidates: &[Prediction]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if candidate.score.is_nan() {
            continue;
        }
        match best {
            Some(b) if candidates[b].score >= candidate.score => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Records the embedding computed for one uploaded image
///
/// Filled the moment `set_image` returns, even when the rest of the
/// inference later fails or its caller has stopped waiting, so a retry
/// reuses the embedding instead of encoding the image again.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingSlot(Arc<Mutex<Option<EmbeddingHandle>>>);

impl EmbeddingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<EmbeddingHandle> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, handle: EmbeddingHandle) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// Everything an inference call needs, owned so it can move to a worker
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub image: Arc<RgbImage>,
    pub points: Vec<PromptPoint>,
    pub boxes: Vec<PromptBox>,
    /// Embedding slot of the upload `image` belongs to
    pub embedding: EmbeddingSlot,
}

#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub masks: Vec<Mask>,
    pub embedding: EmbeddingHandle,
}

/// Run one inference, computing the image embedding first if needed
pub fn run_inference(
    backend: &mut dyn SegmentationBackend,
    request: &InferenceRequest,
) -> Result<InferenceOutcome> {
    let _span = tracing::debug_span!(
        "inference",
        points = request.points.len(),
        boxes = request.boxes.len()
    )
    .entered();

    let embedding = match request.embedding.get() {
        Some(handle) => handle,
        None => {
            let handle = backend.set_image(&request.image)?;
            request.embedding.set(handle);
            handle
        }
    };

    let plan = PromptPlan::for_counts(request.points.len(), request.boxes.len());
    let masks = match plan {
        PromptPlan::Automatic => backend.generate_automatic(&request.image)?,
        PromptPlan::Single => {
            let candidates = backend.predict(&request.points, request.boxes.first())?;
            vec![take_best(candidates)?]
        }
        PromptPlan::PerBox => {
            if !request.points.is_empty() {
                tracing::debug!(
                    "{} points ignored for a {}-box prompt",
                    request.points.len(),
                    request.boxes.len()
                );
            }
            request
                .boxes
                .iter()
                .map(|b| take_best(backend.predict(&[], Some(b))?))
                .collect::<Result<Vec<_>>>()?
        }
    };

    tracing::debug!("{:?} inference produced {} masks", plan, masks.len());
    Ok(InferenceOutcome { masks, embedding })
}

fn take_best(mut candidates: Vec<Prediction>) -> Result<Mask> {
    match select_best(&candidates) {
        Some(i) => Ok(candidates.swap_remove(i).mask),
        None => bail!("Backend returned no candidate masks"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(scores: &[f32]) -> Vec<Prediction> {
        scores
            .iter()
            .map(|&s| Prediction::new(Mask::new(2, 2), s))
            .collect()
    }

    #[test]
    fn plan_follows_prompt_counts() {
        assert_eq!(PromptPlan::for_counts(0, 0), PromptPlan::Automatic);
        assert_eq!(PromptPlan::for_counts(0, 1), PromptPlan::Single);
        assert_eq!(PromptPlan::for_counts(3, 0), PromptPlan::Single);
        assert_eq!(PromptPlan::for_counts(3, 1), PromptPlan::Single);
        assert_eq!(PromptPlan::for_counts(0, 2), PromptPlan::PerBox);
        assert_eq!(PromptPlan::for_counts(2, 3), PromptPlan::PerBox);
    }

    #[test]
    fn best_is_argmax_with_first_tie() {
        assert_eq!(select_best(&scored(&[0.2, 0.9, 0.5])), Some(1));
        assert_eq!(select_best(&scored(&[0.7, 0.7, 0.1])), Some(0));
        assert_eq!(select_best(&scored(&[0.1, 0.8, 0.8])), Some(1));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn nan_scores_are_never_selected() {
        assert_eq!(select_best(&scored(&[0.3, f32::NAN, 0.2])), Some(0));
        assert_eq!(select_best(&scored(&[f32::NAN, 0.1])), Some(1));
        assert_eq!(select_best(&scored(&[f32::NAN])), None);
    }

    #[test]
    fn embedding_survives_a_failed_predict() {
        let mut backend = ScriptedBackend::new()
            .failing_once("decoder crashed")
            .with_prediction(scored(&[0.5]));
        let log = backend.call_log();

        let request = InferenceRequest {
            image: Arc::new(RgbImage::new(2, 2)),
            points: vec![PromptPoint::foreground(1.0, 1.0)],
            boxes: Vec::new(),
            embedding: EmbeddingSlot::new(),
        };
        assert!(run_inference(&mut backend, &request).is_err());
        assert!(request.embedding.get().is_some());
        run_inference(&mut backend, &request).unwrap();

        let set_image_calls = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, BackendCall::SetImage { .. }))
            .count();
        assert_eq!(set_image_calls, 1);
    }

    #[test]
    fn embedding_is_computed_only_when_missing() {
        let mut backend = ScriptedBackend::new()
            .with_prediction(scored(&[0.5]))
            .with_prediction(scored(&[0.5]));
        let log = backend.call_log();

        let request = InferenceRequest {
            image: Arc::new(RgbImage::new(2, 2)),
            points: vec![PromptPoint::foreground(1.0, 1.0)],
            boxes: Vec::new(),
            embedding: EmbeddingSlot::new(),
        };
        let first = run_inference(&mut backend, &request).unwrap();
        assert_eq!(request.embedding.get(), Some(first.embedding));
        run_inference(&mut backend, &request).unwrap();

        let set_image_calls = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, BackendCall::SetImage { .. }))
            .count();
        assert_eq!(set_image_calls, 1);
    }

    #[test]
    fn per_box_plan_predicts_each_box_without_points() {
        let mut backend = ScriptedBackend::new()
            .with_prediction(scored(&[0.1, 0.3]))
            .with_prediction(scored(&[0.9]));
        let log = backend.call_log();

        let request = InferenceRequest {
            image: Arc::new(RgbImage::new(2, 2)),
            points: vec![PromptPoint::foreground(0.0, 0.0)],
            boxes: vec![PromptBox::new(0.0, 0.0, 1.0, 1.0), PromptBox::new(1.0, 1.0, 2.0, 2.0)],
            embedding: EmbeddingSlot::new(),
        };
        let outcome = run_inference(&mut backend, &request).unwrap();
        assert_eq!(outcome.masks.len(), 2);

        let calls = log.lock().unwrap();
        let predicts: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Predict { points, prompt_box } => Some((points.len(), *prompt_box)),
                _ => None,
            })
            .collect();
        assert_eq!(
            predicts,
            vec![
                (0, Some(PromptBox::new(0.0, 0.0, 1.0, 1.0))),
                (0, Some(PromptBox::new(1.0, 1.0, 2.0, 2.0))),
            ]
        );
    }

    #[test]
    fn empty_candidate_list_is_an_error() {
        let mut backend = ScriptedBackend::new().with_prediction(Vec::new());
        let request = InferenceRequest {
            image: Arc::new(RgbImage::new(2, 2)),
            points: vec![PromptPoint::foreground(0.0, 0.0)],
            boxes: Vec::new(),
            embedding: EmbeddingSlot::new(),
        };
        assert!(run_inference(&mut backend, &request).is_err());
    }
}
