use std::io::Cursor;

use image::{ImageFormat, RgbImage};

use crate::error::Result;

/// Encode a composite for the response body
pub fn encode_view(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), format)?;
    Ok(buffer)
}

/// JPEG is what the preview client displays
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    encode_view(image, ImageFormat::Jpeg)
}
