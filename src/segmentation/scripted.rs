use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use image::RgbImage;

use super::types::{EmbeddingHandle, Prediction, SegmentationBackend};
use crate::mask::Mask;
use crate::prompt::{PromptBox, PromptPoint};

/// A call received by a [`ScriptedBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    SetImage { width: u32, height: u32 },
    Predict {
        points: Vec<PromptPoint>,
        prompt_box: Option<PromptBox>,
    },
    Automatic,
}

/// Deterministic backend that replays queued answers
///
/// Used by tests and by the binary when no model is configured. Every call is
/// recorded in a shared log that stays readable after the backend has been
/// handed to a session.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    predictions: VecDeque<Vec<Prediction>>,
    automatic: VecDeque<Vec<Mask>>,
    fail_next: Option<String>,
    unavailable: Option<String>,
    delay: Option<Duration>,
    encode_delay: Option<Duration>,
    calls: Arc<Mutex<Vec<BackendCall>>>,
    generation: u64,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose every call fails
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Queue the candidates returned by the next `predict` call
    pub fn with_prediction(mut self, candidates: Vec<Prediction>) -> Self {
        self.predictions.push_back(candidates);
        self
    }

    /// Queue the masks returned by the next `generate_automatic` call
    pub fn with_automatic(mut self, masks: Vec<Mask>) -> Self {
        self.automatic.push_back(masks);
        self
    }

    /// Make the next predict or automatic call fail
    pub fn failing_once(mut self, reason: impl Into<String>) -> Self {
        self.fail_next = Some(reason.into());
        self
    }

    /// Sleep before answering predict and automatic calls
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep before answering `set_image`
    pub fn with_encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = Some(delay);
        self
    }

    /// Shared view of every call made so far
    pub fn call_log(&self) -> Arc<Mutex<Vec<BackendCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: BackendCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn check_available(&mut self) -> Result<()> {
        if let Some(reason) = &self.unavailable {
            bail!("{reason}");
        }
        if let Some(reason) = self.fail_next.take() {
            bail!("{reason}");
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

impl SegmentationBackend for ScriptedBackend {
    fn set_image(&mut self, image: &RgbImage) -> Result<EmbeddingHandle> {
        if let Some(reason) = &self.unavailable {
            bail!("{reason}");
        }
        if let Some(delay) = self.encode_delay {
            std::thread::sleep(delay);
        }
        let (width, height) = image.dimensions();
        self.record(BackendCall::SetImage { width, height });
        self.generation += 1;
        Ok(EmbeddingHandle {
            generation: self.generation,
            width,
            height,
        })
    }

    fn predict(
        &mut self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
    ) -> Result<Vec<Prediction>> {
        self.check_available()?;
        self.record(BackendCall::Predict {
            points: points.to_vec(),
            prompt_box: prompt_box.copied(),
        });
        self.predictions
            .pop_front()
            .ok_or_else(|| anyhow!("No scripted prediction left"))
    }

    fn generate_automatic(&mut self, _image: &RgbImage) -> Result<Vec<Mask>> {
        self.check_available()?;
        self.record(BackendCall::Automatic);
        Ok(self.automatic.pop_front().unwrap_or_default())
    }
}
