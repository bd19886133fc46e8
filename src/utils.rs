use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, GenericImageView, ImageOutputFormat};

use crate::faces::FaceBox;

/// Decodes a base64 image as the engine returns it. Tolerates a data-URL prefix.
pub fn decode_base64_image(data: &str) -> Result<Vec<u8>> {
    let data = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD.decode(data.trim()).context("image is not valid base64")
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .context("failed to encode PNG")?;
    Ok(buffer.into_inner())
}

/// Grows `face` by `padding` pixels on every side and clamps it to the image.
/// Returns (x1, y1, x2, y2), or None if nothing is left.
pub fn padded_region(face: &FaceBox, padding: u32, width: u32, height: u32) -> Option<[u32; 4]> {
    let pad = padding as f32;
    let x1 = (face.x1 - pad).floor().max(0.0) as u32;
    let y1 = (face.y1 - pad).floor().max(0.0) as u32;
    let x2 = ((face.x2 + pad).ceil().max(0.0) as u32).min(width);
    let y2 = ((face.y2 + pad).ceil().max(0.0) as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some([x1, y1, x2, y2])
}

/// Crops `region` out of `image` and encodes it as PNG.
pub fn crop_png(image: &DynamicImage, region: [u32; 4]) -> Result<Vec<u8>> {
    let [x1, y1, x2, y2] = region;
    let (width, height) = image.dimensions();
    if x2 > width || y2 > height || x2 <= x1 || y2 <= y1 {
        bail!("crop region {:?} outside {}x{} image", region, width, height);
    }
    encode_png(&image.crop_imm(x1, y1, x2 - x1, y2 - y1))
}

/// Storage key for an object belonging to a job.
pub fn object_key(prefix: &str, job_id: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", job_id, name)
    } else {
        format!("{}/{}/{}", prefix, job_id, name)
    }
}
