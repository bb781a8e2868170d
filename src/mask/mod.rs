mod raster;
mod store;
mod stroke;

pub use raster::Mask;
pub use store::{MaskLayer, MaskLayerStore, Polarity};
pub use stroke::{PromptStroke, NEGATIVE_STROKE, POSITIVE_STROKE};
