use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use ndarray::{Array1, Array2, Array3, Array4, Axis, Ix2, Ix4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::auto::{AutoMaskGenerator, LogitDecoder, LogitMask};
use super::preprocess::Preprocessor;
use super::types::{EmbeddingHandle, Prediction, SegmentationBackend};
use crate::mask::Mask;
use crate::prompt::{PromptBox, PromptPoint};

/// Side length of the low-resolution mask prompt the decoder expects
const MASK_INPUT_SIZE: usize = 256;

/// Decoder labels for the two corners of a box prompt
const BOX_TOP_LEFT_LABEL: f32 = 2.0;
const BOX_BOTTOM_RIGHT_LABEL: f32 = 3.0;

/// Label of the padding point added when no box is given
const PADDING_LABEL: f32 = -1.0;

/// The exported SAM encoder/decoder pair
///
/// Loading is expensive, so one model is shared by every session's
/// [`SamPredictor`]; each predictor keeps its own embedding.
pub struct SamModel {
    encoder: Session,
    decoder: Session,
}

impl SamModel {
    /// Load the encoder and decoder ONNX files
    pub fn load<P: AsRef<Path>>(encoder_path: P, decoder_path: P) -> Result<Self> {
        let encoder = load_session(encoder_path.as_ref())?;
        let decoder = load_session(decoder_path.as_ref())?;
        Ok(Self { encoder, decoder })
    }

    pub fn shared(self) -> Arc<Mutex<SamModel>> {
        Arc::new(Mutex::new(self))
    }
}

fn load_session(path: &Path) -> Result<Session> {
    tracing::info!("Loading SAM model part from {}", path.display());

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;

    tracing::info!("Loaded {}", path.display());
    Ok(session)
}

struct CachedEmbedding {
    handle: EmbeddingHandle,
    features: Array4<f32>,
}

/// Per-session SAM predictor
///
/// Holds the embedding of the current image so repeated prompts only run the
/// light decoder.
pub struct SamPredictor {
    model: Arc<Mutex<SamModel>>,
    preprocessor: Preprocessor,
    generator: AutoMaskGenerator,
    embedding: Option<CachedEmbedding>,
    generation: u64,
}

impl SamPredictor {
    pub fn new(model: Arc<Mutex<SamModel>>, generator: AutoMaskGenerator) -> Self {
        Self {
            model,
            preprocessor: Preprocessor::default(),
            generator,
            embedding: None,
            generation: 0,
        }
    }

    fn lock_model(&self) -> Result<MutexGuard<'_, SamModel>> {
        self.model
            .lock()
            .map_err(|_| anyhow!("SAM model lock poisoned"))
    }

    fn encode(&self, input: Array4<f32>) -> Result<Array4<f32>> {
        let mut model = self.lock_model()?;
        let outputs = model
            .encoder
            .run(ort::inputs![Tensor::from_array(input)?])
            .context("Failed to run SAM encoder")?;

        // image_embeddings: [1, 256, 64, 64]
        let features = outputs[0]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;
        Ok(features)
    }

    fn cached(&self) -> Result<&CachedEmbedding> {
        self.embedding
            .as_ref()
            .ok_or_else(|| anyhow!("No image embedding: set_image must run before predict"))
    }

    /// Point coordinates and labels in decoder space
    fn encode_prompts(
        &self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
        width: u32,
        height: u32,
    ) -> (Array3<f32>, Array2<f32>) {
        let mut coords: Vec<(f32, f32)> = Vec::new();
        let mut labels: Vec<f32> = Vec::new();

        for point in points {
            coords.push(self.preprocessor.transform_coords(point.x, point.y, width, height));
            labels.push(point.label.model_label());
        }

        match prompt_box {
            Some(b) => {
                coords.push(self.preprocessor.transform_coords(b.x1, b.y1, width, height));
                labels.push(BOX_TOP_LEFT_LABEL);
                coords.push(self.preprocessor.transform_coords(b.x2, b.y2, width, height));
                labels.push(BOX_BOTTOM_RIGHT_LABEL);
            }
            None => {
                coords.push((0.0, 0.0));
                labels.push(PADDING_LABEL);
            }
        }

        let n = coords.len();
        let coords = Array3::from_shape_fn((1, n, 2), |(_, i, k)| {
            if k == 0 {
                coords[i].0
            } else {
                coords[i].1
            }
        });
        let labels = Array2::from_shape_fn((1, n), |(_, i)| labels[i]);
        (coords, labels)
    }
}

impl LogitDecoder for SamPredictor {
    fn decode(
        &mut self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
    ) -> Result<Vec<LogitMask>> {
        let _span = tracing::debug_span!("sam_decode", points = points.len()).entered();

        let cached = self.cached()?;
        let (width, height) = (cached.handle.width, cached.handle.height);
        let (coords, labels) = self.encode_prompts(points, prompt_box, width, height);

        let features = cached.features.clone();
        let mask_input = Array4::<f32>::zeros((1, 1, MASK_INPUT_SIZE, MASK_INPUT_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);
        let orig_im_size = Array1::from(vec![height as f32, width as f32]);

        let mut model = self.lock_model()?;
        let outputs = model
            .decoder
            .run(ort::inputs![
                "image_embeddings" => Tensor::from_array(features)?,
                "point_coords" => Tensor::from_array(coords)?,
                "point_labels" => Tensor::from_array(labels)?,
                "mask_input" => Tensor::from_array(mask_input)?,
                "has_mask_input" => Tensor::from_array(has_mask_input)?,
                "orig_im_size" => Tensor::from_array(orig_im_size)?,
            ])
            .context("Failed to run SAM decoder")?;

        // masks: [1, C, H, W] logits, iou_predictions: [1, C]
        let masks = outputs["masks"]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;
        let scores = outputs["iou_predictions"]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix2>()?;

        if masks.shape()[2] != height as usize || masks.shape()[3] != width as usize {
            bail!(
                "Decoder returned {}x{} masks for a {}x{} image",
                masks.shape()[3],
                masks.shape()[2],
                width,
                height
            );
        }

        let candidates = masks
            .index_axis(Axis(0), 0)
            .outer_iter()
            .zip(scores.index_axis(Axis(0), 0).iter())
            .map(|(logits, &iou)| LogitMask {
                logits: logits.to_owned(),
                iou,
            })
            .collect();

        Ok(candidates)
    }
}

impl SegmentationBackend for SamPredictor {
    fn set_image(&mut self, image: &RgbImage) -> Result<EmbeddingHandle> {
        let _span = tracing::debug_span!("sam_encode").entered();

        let input = self.preprocessor.preprocess(image)?;
        let features = self.encode(input)?;

        self.generation += 1;
        let (width, height) = image.dimensions();
        let handle = EmbeddingHandle {
            generation: self.generation,
            width,
            height,
        };
        tracing::info!(
            "Computed image embedding #{} for {}x{} image",
            handle.generation,
            width,
            height
        );

        self.embedding = Some(CachedEmbedding { handle, features });
        Ok(handle)
    }

    fn predict(
        &mut self,
        points: &[PromptPoint],
        prompt_box: Option<&PromptBox>,
    ) -> Result<Vec<Prediction>> {
        let candidates = self.decode(points, prompt_box)?;
        Ok(candidates
            .into_iter()
            .map(|c| Prediction::new(Preprocessor::logits_to_mask(c.logits.view(), 0.0), c.iou))
            .collect())
    }

    fn generate_automatic(&mut self, image: &RgbImage) -> Result<Vec<Mask>> {
        let needs_embedding = match &self.embedding {
            Some(cached) => (cached.handle.width, cached.handle.height) != image.dimensions(),
            None => true,
        };
        if needs_embedding {
            self.set_image(image)?;
        }

        let generator = self.generator.clone();
        let (width, height) = image.dimensions();
        generator.generate(self, width, height)
    }
}
