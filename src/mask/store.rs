use super::raster::Mask;
use crate::error::{Result, SessionError};

/// Whether a layer adds to or removes from the selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

/// One mask with its polarity
///
/// Fields are private: once a layer is in the store its pixels never change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskLayer {
    mask: Mask,
    polarity: Polarity,
}

impl MaskLayer {
    pub fn new(mask: Mask, polarity: Polarity) -> Self {
        Self { mask, polarity }
    }

    pub fn positive(mask: Mask) -> Self {
        Self::new(mask, Polarity::Positive)
    }

    pub fn negative(mask: Mask) -> Self {
        Self::new(mask, Polarity::Negative)
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }
}

/// Ordered stack of mask layers for one image
#[derive(Debug, Clone)]
pub struct MaskLayerStore {
    width: u32,
    height: u32,
    layers: Vec<MaskLayer>,
}

impl MaskLayerStore {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: Vec::new(),
        }
    }

    /// Append a layer and return the new length
    ///
    /// A layer whose raster does not match the image is rejected.
    pub fn append(&mut self, layer: MaskLayer) -> Result<usize> {
        self.check_dimensions(layer.mask())?;
        self.layers.push(layer);
        Ok(self.layers.len())
    }

    /// Fail unless `mask` matches the store's image dimensions
    pub fn check_dimensions(&self, mask: &Mask) -> Result<()> {
        if mask.dimensions() != (self.width, self.height) {
            return Err(SessionError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: mask.dimensions(),
            });
        }
        Ok(())
    }

    /// Keep the first `n` layers
    pub fn truncate(&mut self, n: usize) -> Result<()> {
        if n > self.layers.len() {
            return Err(SessionError::InvalidRange {
                requested: n,
                len: self.layers.len(),
            });
        }
        self.layers.truncate(n);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<MaskLayer> {
        self.layers.pop().ok_or(SessionError::EmptyStore)
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[MaskLayer] {
        &self.layers
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
