use std::path::Path;

use image::RgbImage;

use crate::error::{Result, SessionError};

/// Decode an uploaded image buffer into RGB
pub fn decode_upload(bytes: &[u8]) -> Result<RgbImage> {
    let decoded = image::load_from_memory(bytes)?.to_rgb8();
    check_not_empty(decoded)
}

/// Load an image file from disk into RGB
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    let path = path.as_ref();
    tracing::info!("Loading image from {}", path.display());

    let bytes = std::fs::read(path).map_err(|e| SessionError::io(path, e))?;
    decode_upload(&bytes)
}

fn check_not_empty(image: RgbImage) -> Result<RgbImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(SessionError::Precondition(
            "uploaded image has no pixels".to_string(),
        ));
    }
    Ok(image)
}
