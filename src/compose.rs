//! Preview composites derived from the mask layer stack.
//!
//! Every mutation of the layers produces a fresh [`Composites`] value; view
//! switches only pick one of its rasters.

use std::borrow::Cow;

use image::{imageops, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::{Result, SessionError};
use crate::mask::{Mask, MaskLayer, Polarity};
use crate::view::ViewMode;

/// Colour of the only layer when exactly one exists
pub const SINGLE_LAYER_COLOR: Rgb<u8> = Rgb([255, 144, 30]);

/// Colour of every positive layer in the white masks view
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Seed for per-layer colours, reapplied on every recompute
pub const COLOR_SEED: u64 = 0;

/// Opacity of layer colours blended over the accumulator
pub const MASK_ALPHA: f32 = 0.5;

/// Dilation passes applied to coloured footprints
pub const DILATION_ITERATIONS: u32 = 3;

/// Largest accepted dilation kernel
pub const MAX_DILATION_KERNEL: u32 = 20;

/// Largest accepted background blur level
pub const MAX_BLUR_LEVEL: u32 = 25;

/// How a negative layer updates the union mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeUnionRule {
    /// Clear the layer's footprint from the union
    #[default]
    ClearFootprint,
    /// Historical behaviour: the footprint is ANDed into a zeroed buffer
    /// that is then ORed back, so negative layers never shrink the union
    LegacyAnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompositeOptions {
    pub dilation_kernel: u32,
    pub blur_level: u32,
    pub negative_union: NegativeUnionRule,
}

impl CompositeOptions {
    pub fn with_dilation(mut self, kernel: u32) -> Result<Self> {
        if kernel > MAX_DILATION_KERNEL {
            return Err(SessionError::InvalidDilation(kernel));
        }
        self.dilation_kernel = kernel;
        Ok(self)
    }

    pub fn with_blur(mut self, level: u32) -> Result<Self> {
        if level > MAX_BLUR_LEVEL {
            return Err(SessionError::InvalidBlur(level));
        }
        self.blur_level = level;
        Ok(self)
    }
}

/// All rasters derived from one state of the layer stack
#[derive(Debug, Clone, PartialEq)]
pub struct Composites {
    overlay: RgbImage,
    cutout: RgbImage,
    color_masks: RgbImage,
    white_masks: RgbImage,
    compose_masks: RgbImage,
    union: Mask,
}

impl Composites {
    pub fn view(&self, mode: ViewMode) -> &RgbImage {
        match mode {
            ViewMode::Image => &self.overlay,
            ViewMode::Masks => &self.cutout,
            ViewMode::ColorMasks => &self.color_masks,
            ViewMode::WhiteMasks => &self.white_masks,
            ViewMode::ComposeMasks => &self.compose_masks,
        }
    }

    pub fn overlay(&self) -> &RgbImage {
        &self.overlay
    }

    pub fn cutout(&self) -> &RgbImage {
        &self.cutout
    }

    pub fn color_masks(&self) -> &RgbImage {
        &self.color_masks
    }

    pub fn white_masks(&self) -> &RgbImage {
        &self.white_masks
    }

    pub fn compose_masks(&self) -> &RgbImage {
        &self.compose_masks
    }

    pub fn union_mask(&self) -> &Mask {
        &self.union
    }

    /// Cutout with alpha 255 inside the union mask and 0 outside
    pub fn cutout_with_alpha(&self) -> RgbaImage {
        RgbaImage::from_fn(self.cutout.width(), self.cutout.height(), |x, y| {
            let Rgb([r, g, b]) = *self.cutout.get_pixel(x, y);
            let a = if self.union.get(x, y) { 255 } else { 0 };
            Rgba([r, g, b, a])
        })
    }
}

/// Derives every preview raster from the image and its layers
#[derive(Debug, Clone, Default)]
pub struct CompositingEngine {
    options: CompositeOptions,
}

impl CompositingEngine {
    pub fn new(options: CompositeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> CompositeOptions {
        self.options
    }

    pub fn set_options(&mut self, options: CompositeOptions) {
        self.options = options;
    }

    /// Build a complete set of composites
    ///
    /// Pure in its inputs: identical layers always give identical pixels.
    pub fn recompute(&self, image: &RgbImage, layers: &[MaskLayer]) -> Composites {
        let _span = tracing::debug_span!("recompute", layers = layers.len()).entered();

        let (width, height) = image.dimensions();
        let black = RgbImage::new(width, height);

        if layers.is_empty() {
            return Composites {
                overlay: image.clone(),
                cutout: black.clone(),
                color_masks: black.clone(),
                white_masks: black.clone(),
                compose_masks: black,
                union: Mask::new(width, height),
            };
        }

        let colors = layer_palette(layers);
        let whites: Vec<Rgb<u8>> = vec![WHITE; layers.len()];

        let footprints: Vec<Cow<'_, Mask>> = layers
            .iter()
            .map(|layer| match layer.polarity() {
                Polarity::Positive if self.options.dilation_kernel > 0 => Cow::Owned(
                    layer
                        .mask()
                        .dilate(self.options.dilation_kernel, DILATION_ITERATIONS),
                ),
                _ => Cow::Borrowed(layer.mask()),
            })
            .collect();
        let plain: Vec<Cow<'_, Mask>> = layers.iter().map(|l| Cow::Borrowed(l.mask())).collect();

        let union = union_mask(layers, self.options.negative_union, width, height);

        let mut overlay = paint_layers(image, layers, &colors, &plain);
        if self.options.blur_level > 0 {
            let blurred = imageops::blur(image, self.options.blur_level as f32);
            for (x, y, px) in overlay.enumerate_pixels_mut() {
                if !union.get(x, y) {
                    *px = *blurred.get_pixel(x, y);
                }
            }
        }

        let cutout = RgbImage::from_fn(width, height, |x, y| {
            if union.get(x, y) {
                *image.get_pixel(x, y)
            } else {
                Rgb([0, 0, 0])
            }
        });

        let color_masks = paint_layers(&black, layers, &colors, &footprints);
        let white_masks = paint_layers(&black, layers, &whites, &footprints);

        let last_positive = layers
            .iter()
            .zip(&footprints)
            .rev()
            .find(|(layer, _)| layer.polarity() == Polarity::Positive)
            .map(|(_, footprint)| &**footprint);
        let compose_masks = side_by_side(image, &white_masks, last_positive);

        tracing::debug!(
            "Recomputed composites: {} layers, union covers {} px",
            layers.len(),
            union.count()
        );

        Composites {
            overlay,
            cutout,
            color_masks,
            white_masks,
            compose_masks,
            union,
        }
    }
}

/// One colour per layer; a lone layer gets the fixed colour
fn layer_palette(layers: &[MaskLayer]) -> Vec<Rgb<u8>> {
    if layers.len() == 1 {
        return vec![SINGLE_LAYER_COLOR];
    }

    let mut rng = StdRng::seed_from_u64(COLOR_SEED);
    layers
        .iter()
        .map(|layer| match layer.polarity() {
            Polarity::Positive => Rgb(rng.gen::<[u8; 3]>()),
            Polarity::Negative => Rgb([0, 0, 0]),
        })
        .collect()
}

fn union_mask(layers: &[MaskLayer], rule: NegativeUnionRule, width: u32, height: u32) -> Mask {
    let mut union = Mask::new(width, height);
    for layer in layers {
        match (layer.polarity(), rule) {
            (Polarity::Positive, _) => union.union_with(layer.mask()),
            (Polarity::Negative, NegativeUnionRule::ClearFootprint) => {
                union.subtract(layer.mask())
            }
            (Polarity::Negative, NegativeUnionRule::LegacyAnd) => {}
        }
    }
    union
}

/// Replay the layers over `base`
///
/// Positive layers blend their colour under their footprint; negative layers
/// put `base` back under their own mask.
fn paint_layers(
    base: &RgbImage,
    layers: &[MaskLayer],
    colors: &[Rgb<u8>],
    footprints: &[Cow<'_, Mask>],
) -> RgbImage {
    let mut acc = base.clone();
    for ((layer, color), footprint) in layers.iter().zip(colors).zip(footprints) {
        match layer.polarity() {
            Polarity::Negative => {
                for (x, y, px) in acc.enumerate_pixels_mut() {
                    if layer.mask().get(x, y) {
                        *px = *base.get_pixel(x, y);
                    }
                }
            }
            Polarity::Positive => {
                for (x, y, px) in acc.enumerate_pixels_mut() {
                    if footprint.get(x, y) {
                        *px = blend(*px, *color);
                    }
                }
            }
        }
    }
    acc
}

fn blend(under: Rgb<u8>, over: Rgb<u8>) -> Rgb<u8> {
    let mix = |a: u8, b: u8| (a as f32 * (1.0 - MASK_ALPHA) + b as f32 * MASK_ALPHA).round() as u8;
    Rgb([
        mix(under[0], over[0]),
        mix(under[1], over[1]),
        mix(under[2], over[2]),
    ])
}

/// Grey white-masks view on the left, grey image half-blended with the
/// latest positive footprint on the right
fn side_by_side(image: &RgbImage, white_masks: &RgbImage, last_positive: Option<&Mask>) -> RgbImage {
    let (width, height) = image.dimensions();
    let left: GrayImage = imageops::grayscale(white_masks);
    let gray: GrayImage = imageops::grayscale(image);

    RgbImage::from_fn(width * 2, height, |x, y| {
        let value = if x < width {
            left.get_pixel(x, y)[0]
        } else {
            let x = x - width;
            let mask_value = match last_positive {
                Some(mask) if mask.get(x, y) => 255u16,
                _ => 0,
            };
            ((gray.get_pixel(x, y)[0] as u16 + mask_value) / 2) as u8
        };
        Rgb([value, value, value])
    })
}
