//! Upload decoding and pixel preprocessing.

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{RgbImage, imageops, imageops::FilterType};

use crate::error::ServiceError;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Decodes an uploaded file (any format the `image` crate recognises) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Decode("empty image payload".into()));
    }
    let image = image::load_from_memory(bytes).map_err(|e| ServiceError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Decodes a base64 string, tolerating a `data:image/...;base64,` prefix.
pub fn decode_base64_image(encoded: &str) -> Result<RgbImage, ServiceError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| ServiceError::Decode(format!("invalid base64: {e}")))?;
    decode_image(&bytes)
}

/// Resizes to `side`×`side` and returns CLIP-normalised planar RGB (CHW).
pub fn to_normalized_chw(image: &RgbImage, side: u32) -> Vec<f32> {
    let resized = imageops::resize(image, side, side, FilterType::CatmullRom);
    let plane = (side as usize) * (side as usize);
    let mut data = vec![0f32; 3 * plane];
    for (idx, pixel) in resized.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * plane + idx] = (value - CLIP_MEAN[channel]) / CLIP_STD[channel];
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb};

    use super::*;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn decodes_jpeg_bytes() {
        let image = decode_image(&jpeg_bytes(16, 8)).unwrap();
        assert_eq!(image.dimensions(), (16, 8));
    }

    #[test]
    fn decodes_base64_with_and_without_data_uri() {
        let encoded = STANDARD.encode(jpeg_bytes(4, 4));
        assert!(decode_base64_image(&encoded).is_ok());
        let uri = format!("data:image/jpeg;base64,{encoded}");
        assert_eq!(decode_base64_image(&uri).unwrap().dimensions(), (4, 4));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(ServiceError::Decode(_))
        ));
        assert!(matches!(
            decode_base64_image("%%%not base64%%%"),
            Err(ServiceError::Decode(_))
        ));
        assert!(matches!(decode_image(&[]), Err(ServiceError::Decode(_))));
    }

    #[test]
    fn normalisation_is_planar_and_sized() {
        let image = RgbImage::from_pixel(10, 20, Rgb([255, 0, 0]));
        let data = to_normalized_chw(&image, 8);
        assert_eq!(data.len(), 3 * 8 * 8);
        let red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let green = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        assert!((data[0] - red).abs() < 1e-4);
        assert!((data[64] - green).abs() < 1e-4);
    }
}
