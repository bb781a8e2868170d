use anyhow::Result;
use image::{imageops, RgbImage};
use ndarray::{Array4, ArrayView2};

use crate::mask::Mask;

/// Side length of the square SAM encoder input
pub const SAM_INPUT_SIZE: u32 = 1024;

const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Preprocessor for converting RGB images and prompts to SAM model space
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(SAM_INPUT_SIZE)
    }
}

impl Preprocessor {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    /// Size after scaling the longest side to the target, rounded like SAM
    pub fn scaled_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = self.target_size as f32 / width.max(height) as f32;
        let new_w = (width as f32 * scale + 0.5) as u32;
        let new_h = (height as f32 * scale + 0.5) as u32;
        (new_w.max(1), new_h.max(1))
    }

    /// Preprocess an RGB image into a normalized, zero-padded NCHW tensor
    ///
    /// Steps:
    /// 1. Resize so the longest side equals the target size
    /// 2. Normalize each channel with the SAM pixel mean and std
    /// 3. Pad bottom and right with zeros to a square
    ///
    /// Returns: Array4<f32> with shape [1, 3, target, target]
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let (width, height) = image.dimensions();
        let (new_w, new_h) = self.scaled_size(width, height);

        let resized = if (new_w, new_h) != (width, height) {
            imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle)
        } else {
            image.clone()
        };

        let size = self.target_size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - PIXEL_MEAN[c]) / PIXEL_STD[c];
            }
        }

        Ok(tensor)
    }

    /// Map an image-space coordinate into the resized frame
    pub fn transform_coords(&self, x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
        let (new_w, new_h) = self.scaled_size(width, height);
        (
            x * new_w as f32 / width as f32,
            y * new_h as f32 / height as f32,
        )
    }

    /// Threshold decoder logits into a mask
    pub fn logits_to_mask(logits: ArrayView2<f32>, threshold: f32) -> Mask {
        Mask::from_array(logits.mapv(|v| v > threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::array;

    #[test]
    fn longest_side_is_scaled_to_target() {
        let pre = Preprocessor::default();
        assert_eq!(pre.scaled_size(2048, 1024), (1024, 512));
        assert_eq!(pre.scaled_size(300, 600), (512, 1024));
        assert_eq!(pre.scaled_size(1024, 1024), (1024, 1024));
    }

    #[test]
    fn coords_follow_the_resize() {
        let pre = Preprocessor::default();
        let (x, y) = pre.transform_coords(100.0, 50.0, 2048, 1024);
        assert!((x - 50.0).abs() < 1e-4);
        assert!((y - 25.0).abs() < 1e-4);
    }

    #[test]
    fn tensor_is_normalized_and_padded() {
        let pre = Preprocessor::new(8);
        let image = RgbImage::from_pixel(8, 4, Rgb([124, 116, 104]));
        let tensor = pre.preprocess(&image).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        let expected_r = (124.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((tensor[[0, 0, 0, 0]] - expected_r).abs() < 1e-5);
        // rows past the resized height are padding
        assert_eq!(tensor[[0, 0, 6, 3]], 0.0);
        assert_eq!(tensor[[0, 2, 7, 7]], 0.0);
    }

    #[test]
    fn logits_threshold_at_zero() {
        let logits = array![[-1.0f32, 0.0], [0.5, 3.0]];
        let mask = Preprocessor::logits_to_mask(logits.view(), 0.0);
        assert!(!mask.get(0, 0));
        assert!(!mask.get(1, 0));
        assert!(mask.get(0, 1));
        assert!(mask.get(1, 1));
    }
}
