//! Raster encoding: `DynamicImage` to PNG [`RasterPayload`].
//!
//! PNG is chosen over JPEG because it is lossless: compression artefacts on
//! rendered text measurably degrade what the extraction service can read.
//! Every page is encoded twice, once at full resolution for the service and
//! once scaled down for list views.

use crate::types::RasterPayload;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a raster as PNG, capturing its pixel dimensions.
pub fn encode_raster(img: &DynamicImage) -> Result<RasterPayload, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} raster, {} bytes", img.width(), img.height(), buf.len());

    Ok(RasterPayload {
        png: buf,
        width: img.width(),
        height: img.height(),
    })
}

/// Encode a page raster at full size plus a thumbnail whose longest edge is
/// `thumb_px`. Aspect ratio is preserved.
pub fn encode_with_thumbnail(
    img: &DynamicImage,
    thumb_px: u32,
) -> Result<(RasterPayload, RasterPayload), image::ImageError> {
    let full = encode_raster(img)?;
    let thumb_img = img.thumbnail(thumb_px, thumb_px);
    let thumb = encode_raster(&thumb_img)?;
    Ok((full, thumb))
}
