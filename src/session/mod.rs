//! One user's annotation session over one uploaded image.
//!
//! All mutation goes through [`Session::apply`] (plus upload, save and the
//! composite option setters). Each successful mutation rebuilds the
//! composites before swapping them in, so a failed action leaves the cached
//! views exactly as they were.

mod registry;
mod worker;

pub use registry::{BackendFactory, SessionId, SessionRegistry};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, RgbImage};

use crate::compose::{CompositeOptions, Composites, CompositingEngine};
use crate::error::{Result, SessionError};
use crate::history::{CommandLog, UndoStep, COMMAND_LOG_CAPACITY, SNAPSHOT_CAPACITY};
use crate::input::decode_upload;
use crate::mask::{MaskLayer, MaskLayerStore, PromptStroke};
use crate::output::{LabelFolderSink, OutputSink};
use crate::prompt::{PointLabel, PromptBox, PromptBuffer, PromptPoint};
use crate::segmentation::{EmbeddingHandle, EmbeddingSlot, InferenceRequest, SegmentationBackend};
use crate::view::{ViewMode, ViewRouter};
use worker::SharedBackend;

/// What a click on the image means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    PositivePoint,
    NegativePoint,
    Box,
}

impl InputMode {
    /// Label given to points submitted in this mode
    pub fn point_label(self) -> PointLabel {
        match self {
            InputMode::PositivePoint => PointLabel::Foreground,
            InputMode::NegativePoint | InputMode::Box => PointLabel::Background,
        }
    }
}

/// Every request a session understands, apart from upload and save
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Show(ViewMode),
    Clear,
    SetInputMode(InputMode),
    RunInference,
    Undo,
    AddPoint { x: f32, y: f32 },
    AddBox(PromptBox),
    Stroke(PromptStroke),
    SetDilation(u32),
    SetBlur(u32),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for one inference call; `None` waits for completion
    pub backend_timeout: Option<Duration>,
    /// Directory that receives `<label>/<n>.png` saves
    pub save_root: PathBuf,
    pub log_capacity: usize,
    pub snapshot_capacity: usize,
    pub composite: CompositeOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_timeout: None,
            save_root: default_save_root(),
            log_capacity: COMMAND_LOG_CAPACITY,
            snapshot_capacity: SNAPSHOT_CAPACITY,
            composite: CompositeOptions::default(),
        }
    }
}

/// `$HOME/Downloads`, or the working directory without a home
pub fn default_save_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// State tied to the uploaded image; replaced wholesale on upload
struct Workspace {
    image: Arc<RgbImage>,
    layers: MaskLayerStore,
    prompts: PromptBuffer,
    log: CommandLog,
    composites: Composites,
    embedding: EmbeddingSlot,
}

pub struct Session {
    config: SessionConfig,
    backend: SharedBackend,
    engine: CompositingEngine,
    router: ViewRouter,
    mode: InputMode,
    workspace: Option<Workspace>,
}

impl Session {
    pub fn new(backend: Box<dyn SegmentationBackend>, config: SessionConfig) -> Self {
        Self {
            engine: CompositingEngine::new(config.composite),
            config,
            backend: Arc::new(Mutex::new(backend)),
            router: ViewRouter::default(),
            mode: InputMode::default(),
            workspace: None,
        }
    }

    /// Start over on a new image
    ///
    /// Drops every layer, prompt and history entry along with the cached
    /// embedding, and routes back to the image view.
    pub fn upload(&mut self, image: RgbImage) -> Result<&RgbImage> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SessionError::Precondition(
                "uploaded image has no pixels".to_string(),
            ));
        }
        tracing::info!("Image uploaded: {}x{}", width, height);

        let composites = self.engine.recompute(&image, &[]);
        self.workspace = Some(Workspace {
            image: Arc::new(image),
            layers: MaskLayerStore::new(width, height),
            prompts: PromptBuffer::new(),
            log: CommandLog::new(self.config.log_capacity, self.config.snapshot_capacity),
            composites,
            embedding: EmbeddingSlot::new(),
        });
        self.router.select(ViewMode::Image);
        self.current_view()
    }

    /// Decode an encoded upload and start over on it
    pub fn upload_bytes(&mut self, bytes: &[u8]) -> Result<&RgbImage> {
        let image = decode_upload(bytes)?;
        self.upload(image)
    }

    /// Apply one action and return the composite now being shown
    pub fn apply(&mut self, action: Action) -> Result<&RgbImage> {
        if self.workspace.is_none() {
            return Err(SessionError::Precondition(format!(
                "{action:?} requested before any image was uploaded"
            )));
        }
        tracing::debug!("Applying {:?}", action);

        match action {
            Action::Show(mode) => self.router.select(mode),
            Action::SetInputMode(mode) => {
                tracing::debug!("Input mode {:?} -> {:?}", self.mode, mode);
                self.mode = mode;
            }
            Action::Clear => self.clear()?,
            Action::RunInference => self.run_inference()?,
            Action::Undo => self.undo()?,
            Action::AddPoint { x, y } => self.add_point(x, y)?,
            Action::AddBox(prompt_box) => self.add_box(prompt_box)?,
            Action::Stroke(stroke) => self.add_stroke(&stroke)?,
            Action::SetDilation(kernel) => self.set_dilation(kernel)?,
            Action::SetBlur(level) => self.set_blur(level)?,
        }

        self.current_view()
    }

    /// The composite selected by the view router
    pub fn current_view(&self) -> Result<&RgbImage> {
        let ws = self.workspace()?;
        Ok(ws.composites.view(self.router.current()))
    }

    pub fn set_dilation(&mut self, kernel: u32) -> Result<()> {
        let options = self.engine.options().with_dilation(kernel)?;
        tracing::debug!("Dilation kernel set to {}", kernel);
        self.set_composite_options(options)
    }

    pub fn set_blur(&mut self, level: u32) -> Result<()> {
        let options = self.engine.options().with_blur(level)?;
        tracing::debug!("Blur level set to {}", level);
        self.set_composite_options(options)
    }

    fn set_composite_options(&mut self, options: CompositeOptions) -> Result<()> {
        self.engine.set_options(options);
        if self.workspace.is_some() {
            self.recompute()?;
        }
        Ok(())
    }

    /// Point saves at another existing directory
    pub fn set_save_root<P: AsRef<Path>>(&mut self, root: P) -> Result<()> {
        let sink = LabelFolderSink::new(root)?;
        tracing::info!("Save root set to {}", sink.root().display());
        self.config.save_root = sink.root().to_path_buf();
        Ok(())
    }

    /// Write the chosen composite under the save root
    ///
    /// The cutout is written with an alpha channel from the union mask.
    pub fn save(&self, view: ViewMode, label: &str) -> Result<PathBuf> {
        self.workspace()?;
        let mut sink = LabelFolderSink::new(&self.config.save_root)?;
        self.save_to(&mut sink, view, label)
    }

    pub fn save_to(&self, sink: &mut dyn OutputSink, view: ViewMode, label: &str) -> Result<PathBuf> {
        let ws = self.workspace()?;
        let image = match view {
            ViewMode::Masks => DynamicImage::ImageRgba8(ws.composites.cutout_with_alpha()),
            other => DynamicImage::ImageRgb8(ws.composites.view(other).clone()),
        };
        sink.write_image(label, &image)
    }

    pub fn has_image(&self) -> bool {
        self.workspace.is_some()
    }

    pub fn image(&self) -> Option<&RgbImage> {
        self.workspace.as_ref().map(|ws| ws.image.as_ref())
    }

    pub fn view_mode(&self) -> ViewMode {
        self.router.current()
    }

    pub fn input_mode(&self) -> InputMode {
        self.mode
    }

    pub fn composite_options(&self) -> CompositeOptions {
        self.engine.options()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn layers(&self) -> &[MaskLayer] {
        self.workspace
            .as_ref()
            .map(|ws| ws.layers.layers())
            .unwrap_or_default()
    }

    pub fn prompts(&self) -> Option<&PromptBuffer> {
        self.workspace.as_ref().map(|ws| &ws.prompts)
    }

    pub fn history(&self) -> Option<&CommandLog> {
        self.workspace.as_ref().map(|ws| &ws.log)
    }

    pub fn composites(&self) -> Option<&Composites> {
        self.workspace.as_ref().map(|ws| &ws.composites)
    }

    /// Embedding computed for the current image, once an inference encoded it
    pub fn embedding(&self) -> Option<EmbeddingHandle> {
        self.workspace.as_ref().and_then(|ws| ws.embedding.get())
    }

    fn workspace(&self) -> Result<&Workspace> {
        self.workspace.as_ref().ok_or_else(no_image)
    }

    fn workspace_mut(&mut self) -> Result<&mut Workspace> {
        self.workspace.as_mut().ok_or_else(no_image)
    }

    fn recompute(&mut self) -> Result<()> {
        let engine = &self.engine;
        let ws = self.workspace.as_mut().ok_or_else(no_image)?;
        let composites = engine.recompute(&ws.image, ws.layers.layers());
        ws.composites = composites;
        Ok(())
    }

    /// Drop layers, prompts and history; the image and its embedding stay
    fn clear(&mut self) -> Result<()> {
        let ws = self.workspace_mut()?;
        ws.layers.clear();
        ws.prompts.clear();
        ws.log.clear();
        tracing::info!("Session cleared");
        self.recompute()
    }

    fn add_point(&mut self, x: f32, y: f32) -> Result<()> {
        let label = self.mode.point_label();
        let ws = self.workspace_mut()?;
        ws.prompts.push_point(PromptPoint::new(x, y, label));
        ws.log.push_point();
        tracing::debug!("Point ({}, {}) {:?}", x, y, label);
        Ok(())
    }

    fn add_box(&mut self, prompt_box: PromptBox) -> Result<()> {
        let ws = self.workspace_mut()?;
        ws.prompts.push_box(prompt_box);
        ws.log.push_box();
        tracing::debug!("Box {:?}", prompt_box);
        Ok(())
    }

    fn add_stroke(&mut self, stroke: &PromptStroke) -> Result<()> {
        let ws = self.workspace_mut()?;
        let (width, height) = ws.layers.dimensions();
        let layer = stroke.resolve(width, height)?;
        let polarity = layer.polarity();
        let len = ws.layers.append(layer)?;
        ws.log.push_brush();
        tracing::debug!("Stroke added as {:?} layer, {} layers", polarity, len);
        self.recompute()
    }

    fn run_inference(&mut self) -> Result<()> {
        let request = {
            let ws = self.workspace()?;
            InferenceRequest {
                image: Arc::clone(&ws.image),
                points: ws.prompts.points().to_vec(),
                boxes: ws.prompts.boxes().to_vec(),
                embedding: ws.embedding.clone(),
            }
        };

        let outcome = worker::dispatch(&self.backend, request, self.config.backend_timeout)?;

        let ws = self.workspace_mut()?;
        for mask in &outcome.masks {
            ws.layers.check_dimensions(mask)?;
        }

        let snapshot = ws.prompts.snapshot();
        let count = outcome.masks.len();
        for mask in outcome.masks {
            ws.layers.append(MaskLayer::positive(mask))?;
        }
        ws.log.push_inference(count, snapshot);
        ws.prompts.clear();
        tracing::info!("Inference added {} layers, {} total", count, ws.layers.len());

        self.recompute()
    }

    /// Reverse the newest logged action; an empty log is a no-op
    fn undo(&mut self) -> Result<()> {
        let ws = self.workspace_mut()?;
        let Some(step) = ws.log.pop() else {
            tracing::debug!("Nothing to undo");
            return Ok(());
        };
        tracing::debug!("Undoing {:?}", step);

        let layers_changed = match step {
            UndoStep::Point => {
                if let Err(e) = ws.prompts.pop_point() {
                    tracing::warn!("Undo point: {}", e);
                }
                false
            }
            UndoStep::Box => {
                if let Err(e) = ws.prompts.pop_box() {
                    tracing::warn!("Undo box: {}", e);
                }
                false
            }
            UndoStep::Brush => {
                if let Err(e) = ws.layers.pop() {
                    tracing::warn!("Undo stroke: {}", e);
                }
                true
            }
            UndoStep::Inference { count, snapshot } => {
                let len = ws.layers.len();
                let keep = len.saturating_sub(count);
                if count > len {
                    tracing::warn!(
                        "Undo inference: {}",
                        SessionError::InvalidRange {
                            requested: count,
                            len
                        }
                    );
                }
                ws.layers.truncate(keep)?;
                ws.prompts.restore(snapshot);
                true
            }
        };

        if layers_changed {
            self.recompute()?;
        }
        Ok(())
    }
}

fn no_image() -> SessionError {
    SessionError::Precondition("no image has been uploaded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{Mask, Polarity, NEGATIVE_STROKE, POSITIVE_STROKE};
    use crate::segmentation::{BackendCall, Prediction, ScriptedBackend};
    use image::Rgb;

    fn session_with(backend: ScriptedBackend) -> Session {
        let mut session = Session::new(Box::new(backend), SessionConfig::default());
        session.upload(RgbImage::new(20, 20)).unwrap();
        session
    }

    fn square(x1: u32, y1: u32, x2: u32, y2: u32) -> Mask {
        Mask::rect(20, 20, x1, y1, x2, y2)
    }

    #[test]
    fn actions_before_upload_fail_with_precondition() {
        let mut session = Session::new(Box::new(ScriptedBackend::new()), SessionConfig::default());
        for action in [Action::Undo, Action::RunInference, Action::Show(ViewMode::Masks)] {
            let err = session.apply(action).unwrap_err();
            assert_eq!(err.code(), "PRECONDITION");
        }
        assert!(session.current_view().is_err());
    }

    #[test]
    fn point_labels_follow_input_mode() {
        let mut session = session_with(ScriptedBackend::new());
        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();
        session
            .apply(Action::SetInputMode(InputMode::NegativePoint))
            .unwrap();
        session.apply(Action::AddPoint { x: 2.0, y: 2.0 }).unwrap();

        let labels: Vec<_> = session
            .prompts()
            .unwrap()
            .points()
            .iter()
            .map(|p| p.label)
            .collect();
        assert_eq!(labels, vec![PointLabel::Foreground, PointLabel::Background]);
        // mode switches are not logged
        assert_eq!(session.history().unwrap().len(), 2);
    }

    #[test]
    fn inference_clears_prompts_and_undo_restores_them() {
        let backend = ScriptedBackend::new().with_prediction(vec![
            Prediction::new(square(0, 0, 3, 3), 0.4),
            Prediction::new(square(5, 5, 9, 9), 0.8),
        ]);
        let mut session = session_with(backend);
        session.apply(Action::AddPoint { x: 6.0, y: 6.0 }).unwrap();
        let before = session.prompts().unwrap().snapshot();

        session.apply(Action::RunInference).unwrap();
        assert_eq!(session.layers().len(), 1);
        assert_eq!(session.layers()[0].mask(), &square(5, 5, 9, 9));
        assert!(session.prompts().unwrap().is_empty());

        session.apply(Action::Undo).unwrap();
        assert!(session.layers().is_empty());
        assert_eq!(session.prompts().unwrap().snapshot(), before);
        assert_eq!(session.history().unwrap().snapshot_count(), 0);
    }

    #[test]
    fn failed_inference_changes_nothing() {
        let mut session = session_with(ScriptedBackend::new().failing_once("decoder crashed"));
        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();
        let view_before = session.current_view().unwrap().clone();

        let err = session.apply(Action::RunInference).unwrap_err();
        assert_eq!(err.code(), "BACKEND_ERROR");
        assert!(err.is_recoverable());
        assert_eq!(session.prompts().unwrap().points().len(), 1);
        assert_eq!(session.history().unwrap().len(), 1);
        assert!(session.layers().is_empty());
        assert_eq!(session.current_view().unwrap(), &view_before);
    }

    #[test]
    fn mismatched_mask_is_rejected_whole() {
        let backend = ScriptedBackend::new().with_automatic(vec![
            square(0, 0, 2, 2),
            Mask::rect(10, 10, 0, 0, 2, 2),
        ]);
        let mut session = session_with(backend);

        let err = session.apply(Action::RunInference).unwrap_err();
        assert!(matches!(err, SessionError::DimensionMismatch { .. }));
        assert!(session.layers().is_empty());
        assert!(session.history().unwrap().is_empty());
    }

    #[test]
    fn strokes_are_undone_as_brush_entries() {
        let mut session = session_with(ScriptedBackend::new());
        let positive = PromptStroke::new(vec![(2.0, 2.0), (12.0, 2.0)], 3.0, POSITIVE_STROKE);
        let negative = PromptStroke::new(vec![(5.0, 2.0)], 3.0, NEGATIVE_STROKE);

        session.apply(Action::Stroke(positive)).unwrap();
        session.apply(Action::Stroke(negative)).unwrap();
        assert_eq!(session.layers()[1].polarity(), Polarity::Negative);
        assert!(!session.composites().unwrap().union_mask().get(5, 2));

        session.apply(Action::Undo).unwrap();
        assert_eq!(session.layers().len(), 1);
        assert!(session.composites().unwrap().union_mask().get(5, 2));
    }

    #[test]
    fn bad_stroke_colour_is_rejected() {
        let mut session = session_with(ScriptedBackend::new());
        let stroke = PromptStroke::new(vec![(1.0, 1.0)], 2.0, [0, 255, 0]);
        let err = session.apply(Action::Stroke(stroke)).unwrap_err();
        assert_eq!(err.code(), "INVALID_STROKE_COLOR");
        assert!(session.history().unwrap().is_empty());
    }

    #[test]
    fn clear_keeps_image_and_embedding() {
        let backend = ScriptedBackend::new()
            .with_prediction(vec![Prediction::new(square(0, 0, 4, 4), 0.9)])
            .with_prediction(vec![Prediction::new(square(0, 0, 4, 4), 0.9)]);
        let calls = backend.call_log();
        let mut session = session_with(backend);

        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();
        session.apply(Action::RunInference).unwrap();
        session.apply(Action::Clear).unwrap();
        assert!(session.layers().is_empty());
        assert!(session.history().unwrap().is_empty());
        assert!(session.embedding().is_some());

        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();
        session.apply(Action::RunInference).unwrap();
        let set_image = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, BackendCall::SetImage { .. }))
            .count();
        assert_eq!(set_image, 1);
    }

    #[test]
    fn show_switches_view_without_recompute() {
        let mut session = session_with(ScriptedBackend::new());
        let before = session.composites().unwrap().clone();
        let shown = session.apply(Action::Show(ViewMode::ComposeMasks)).unwrap();
        // black image-sized raster until a layer exists
        assert_eq!(shown.dimensions(), (20, 20));
        assert_eq!(session.composites().unwrap(), &before);
        assert_eq!(session.view_mode(), ViewMode::ComposeMasks);

        let stroke = PromptStroke::new(vec![(4.0, 4.0)], 3.0, POSITIVE_STROKE);
        let shown = session.apply(Action::Stroke(stroke)).unwrap();
        assert_eq!(shown.dimensions(), (40, 20));
    }

    #[test]
    fn retry_after_failed_predict_reuses_embedding() {
        let backend = ScriptedBackend::new()
            .failing_once("decoder crashed")
            .with_prediction(vec![Prediction::new(square(0, 0, 4, 4), 0.9)]);
        let calls = backend.call_log();
        let mut session = session_with(backend);
        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();

        assert!(session.apply(Action::RunInference).is_err());
        assert!(session.embedding().is_some());
        session.apply(Action::RunInference).unwrap();
        assert_eq!(session.layers().len(), 1);

        let set_image = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, BackendCall::SetImage { .. }))
            .count();
        assert_eq!(set_image, 1);
    }

    #[test]
    fn slow_encode_recovers_after_timeout() {
        let answer = || vec![Prediction::new(square(0, 0, 4, 4), 0.9)];
        let backend = ScriptedBackend::new()
            .with_encode_delay(Duration::from_millis(150))
            .with_prediction(answer())
            .with_prediction(answer());
        let calls = backend.call_log();
        let config = SessionConfig {
            backend_timeout: Some(Duration::from_millis(100)),
            ..SessionConfig::default()
        };
        let mut session = Session::new(Box::new(backend), config);
        session.upload(RgbImage::new(20, 20)).unwrap();
        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();

        let err = session.apply(Action::RunInference).unwrap_err();
        assert!(matches!(err, SessionError::BackendTimeout(_)));

        // the abandoned worker still finishes encoding
        std::thread::sleep(Duration::from_millis(250));
        session.apply(Action::RunInference).unwrap();
        assert_eq!(session.layers().len(), 1);

        let set_image = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, BackendCall::SetImage { .. }))
            .count();
        assert_eq!(set_image, 1);
    }

    #[test]
    fn zero_history_capacity_still_uploads() {
        let config = SessionConfig {
            log_capacity: 0,
            snapshot_capacity: 0,
            ..SessionConfig::default()
        };
        let mut session = Session::new(Box::new(ScriptedBackend::new()), config);
        session.upload(RgbImage::new(4, 4)).unwrap();
        session.apply(Action::AddPoint { x: 1.0, y: 1.0 }).unwrap();
        session.apply(Action::AddPoint { x: 2.0, y: 2.0 }).unwrap();
        assert_eq!(session.history().unwrap().len(), 1);
    }

    #[test]
    fn save_before_upload_is_a_precondition_even_with_bad_root() {
        let config = SessionConfig {
            save_root: PathBuf::from("/definitely/not/a/save/root"),
            ..SessionConfig::default()
        };
        let session = Session::new(Box::new(ScriptedBackend::new()), config);
        let err = session.save(ViewMode::Image, "cat").unwrap_err();
        assert_eq!(err.code(), "PRECONDITION");
    }

    #[test]
    fn option_errors_leave_options_unchanged() {
        let mut session = session_with(ScriptedBackend::new());
        session.apply(Action::SetDilation(4)).unwrap();
        assert!(matches!(
            session.apply(Action::SetDilation(21)),
            Err(SessionError::InvalidDilation(21))
        ));
        assert!(matches!(
            session.apply(Action::SetBlur(40)),
            Err(SessionError::InvalidBlur(40))
        ));
        assert_eq!(session.composite_options().dilation_kernel, 4);
        assert_eq!(session.composite_options().blur_level, 0);
    }

    #[test]
    fn upload_resets_everything() {
        let mut session = session_with(ScriptedBackend::new());
        session.apply(Action::AddBox(PromptBox::new(0.0, 0.0, 4.0, 4.0))).unwrap();
        session.apply(Action::Show(ViewMode::Masks)).unwrap();

        let view = session
            .upload(RgbImage::from_pixel(8, 6, Rgb([1, 2, 3])))
            .unwrap();
        assert_eq!(view.dimensions(), (8, 6));
        assert_eq!(session.view_mode(), ViewMode::Image);
        assert!(session.prompts().unwrap().is_empty());
        assert!(session.history().unwrap().is_empty());
        assert!(session.embedding().is_none());
    }

    #[test]
    fn empty_upload_is_rejected() {
        let mut session = Session::new(Box::new(ScriptedBackend::new()), SessionConfig::default());
        assert!(matches!(
            session.upload(RgbImage::new(0, 5)),
            Err(SessionError::Precondition(_))
        ));
        assert!(!session.has_image());
    }
}
