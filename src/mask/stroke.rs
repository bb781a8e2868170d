use super::raster::Mask;
use super::store::{MaskLayer, Polarity};
use crate::error::{Result, SessionError};

/// Brush colour that paints a positive layer
pub const POSITIVE_STROKE: [u8; 3] = [255, 0, 0];

/// Brush colour that paints a negative layer
pub const NEGATIVE_STROKE: [u8; 3] = [0, 0, 255];

/// A freehand brush stroke in image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct PromptStroke {
    pub points: Vec<(f32, f32)>,
    pub brush_size: f32,
    pub color: [u8; 3],
}

impl PromptStroke {
    pub fn new(points: Vec<(f32, f32)>, brush_size: f32, color: [u8; 3]) -> Self {
        Self {
            points,
            brush_size,
            color,
        }
    }

    /// Polarity encoded by the brush colour
    pub fn polarity(&self) -> Result<Polarity> {
        match self.color {
            POSITIVE_STROKE => Ok(Polarity::Positive),
            NEGATIVE_STROKE => Ok(Polarity::Negative),
            rgb => Err(SessionError::InvalidStrokeColor { rgb }),
        }
    }

    /// Rasterise the stroke as round-capped segments between consecutive points
    pub fn rasterize(&self, width: u32, height: u32) -> Mask {
        let mut mask = Mask::new(width, height);
        if width == 0 || height == 0 {
            return mask;
        }

        let radius = (self.brush_size / 2.0).max(0.5);

        let segments: Vec<((f32, f32), (f32, f32))> = match self.points.as_slice() {
            [] => Vec::new(),
            [only] => vec![(*only, *only)],
            points => points.windows(2).map(|w| (w[0], w[1])).collect(),
        };

        for ((x1, y1), (x2, y2)) in segments {
            let min_x = (x1.min(x2) - radius).floor().max(0.0) as u32;
            let min_y = (y1.min(y2) - radius).floor().max(0.0) as u32;
            let max_x = ((x1.max(x2) + radius).ceil() as i64).min(width as i64 - 1);
            let max_y = ((y1.max(y2) + radius).ceil() as i64).min(height as i64 - 1);
            if max_x < 0 || max_y < 0 {
                continue;
            }

            for y in min_y..=max_y as u32 {
                for x in min_x..=max_x as u32 {
                    if point_to_segment_dist(x as f32, y as f32, x1, y1, x2, y2) <= radius {
                        mask.set(x, y, true);
                    }
                }
            }
        }

        mask
    }

    /// Turn the stroke into a single mask layer sized to the image
    pub fn resolve(&self, width: u32, height: u32) -> Result<MaskLayer> {
        let polarity = self.polarity()?;
        if self.points.is_empty() {
            return Err(SessionError::Precondition(
                "stroke contains no points".to_string(),
            ));
        }
        Ok(MaskLayer::new(self.rasterize(width, height), polarity))
    }
}

fn point_to_segment_dist(px: f32, py: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
    let dx = x2 - x1;
    let dy = y2 - y1;
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-10 {
        return ((px - x1).powi(2) + (py - y1).powi(2)).sqrt();
    }
    let t = (((px - x1) * dx + (py - y1) * dy) / len_sq).clamp(0.0, 1.0);
    let cx = x1 + t * dx;
    let cy = y1 + t * dy;
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}
