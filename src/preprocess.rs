//! Image decoding and conversion into the planar float layout the model
//! consumes

use crate::config::{Normalization, ResizeMode, INPUT_SIZE};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use thiserror::Error;

/// ImageNet normalization mean values
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Number of floats in one preprocessed image
pub const INPUT_LEN: usize = 3 * (INPUT_SIZE as usize) * (INPUT_SIZE as usize);

/// Reasons an uploaded image is rejected
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image data is empty")]
    Empty,

    #[error("image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("failed to decode {0:?} image: {1}")]
    Decode(ImageFormat, String),
}

/// Decode raw upload bytes. The format is detected from magic bytes
pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<DynamicImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(ImageError::TooLarge(bytes.len(), max_bytes));
    }

    let format = image::guess_format(bytes).map_err(|_| ImageError::UnsupportedFormat)?;
    image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ImageError::Decode(format, e.to_string()))
}

/// Resize `image` to `INPUT_SIZE` x `INPUT_SIZE` RGB and normalize it into a
/// CHW vector of `INPUT_LEN` floats
pub fn preprocess(image: &DynamicImage, resize: ResizeMode, norm: Normalization) -> Vec<f32> {
    let resized = match resize {
        ResizeMode::Stretch => image.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom),
        ResizeMode::CenterCrop => center_crop_resize(image, INPUT_SIZE),
    };
    let rgb = resized.to_rgb8();

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0f32; INPUT_LEN];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * INPUT_SIZE + x) as usize;
        for c in 0..3 {
            data[c * plane + offset] = normalize(pixel[c], c, norm);
        }
    }
    data
}

fn normalize(value: u8, channel: usize, norm: Normalization) -> f32 {
    match norm {
        Normalization::Imagenet => (value as f32 / 255.0 - MEAN[channel]) / STD[channel],
        Normalization::Symmetric => value as f32 / 127.5 - 1.0,
    }
}

/// Resize to cover the target, then crop the centre (no distortion, may lose
/// edges)
fn center_crop_resize(image: &DynamicImage, target: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    let scale = (target as f32 / w as f32).max(target as f32 / h as f32);

    let new_w = ((w as f32 * scale).round() as u32).max(target);
    let new_h = ((h as f32 * scale).round() as u32).max(target);
    let resized = image.resize_exact(new_w, new_h, FilterType::CatmullRom);

    let x = (new_w - target) / 2;
    let y = (new_h - target) / 2;
    resized.crop_imm(x, y, target, target)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_UPLOAD_BYTES;

    #[test]
    fn test_decode_png() {
        let bytes = test::solid_png(31, 17, [10, 20, 30]);
        let img = decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        assert_eq!(img.dimensions(), (31, 17));
    }

    #[test]
    fn test_decode_rejects() {
        assert!(matches!(
            decode_image(&[], DEFAULT_MAX_UPLOAD_BYTES),
            Err(ImageError::Empty)
        ));
        assert!(matches!(
            decode_image(b"definitely not an image", DEFAULT_MAX_UPLOAD_BYTES),
            Err(ImageError::UnsupportedFormat)
        ));

        // Valid PNG signature, truncated body
        let mut bytes = test::solid_png(8, 8, [0, 0, 0]);
        bytes.truncate(24);
        assert!(matches!(
            decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES),
            Err(ImageError::Decode(ImageFormat::Png, _))
        ));

        let bytes = test::solid_png(8, 8, [0, 0, 0]);
        assert!(matches!(
            decode_image(&bytes, 16),
            Err(ImageError::TooLarge(_, 16))
        ));
    }

    #[test]
    fn test_preprocess_layout() {
        let bytes = test::solid_png(640, 480, [255, 0, 128]);
        let img = decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();

        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        for mode in [ResizeMode::Stretch, ResizeMode::CenterCrop] {
            let data = preprocess(&img, mode, Normalization::Symmetric);
            assert_eq!(data.len(), INPUT_LEN);
            assert!(data[..plane].iter().all(|v| (v - 1.0).abs() < 1e-6));
            assert!(data[plane..2 * plane].iter().all(|v| (v + 1.0).abs() < 1e-6));
            let blue = 128.0 / 127.5 - 1.0;
            assert!(data[2 * plane..].iter().all(|v| (v - blue).abs() < 1e-6));
        }
    }

    #[test]
    fn test_imagenet_normalization() {
        let bytes = test::solid_png(3, 3, [0, 255, 124]);
        let img = decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        let data = preprocess(&img, ResizeMode::Stretch, Normalization::Imagenet);

        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let expected = [
            -MEAN[0] / STD[0],
            (1.0 - MEAN[1]) / STD[1],
            (124.0 / 255.0 - MEAN[2]) / STD[2],
        ];
        for (c, want) in expected.iter().enumerate() {
            let got = data[c * plane + plane / 2];
            assert!((got - want).abs() < 1e-4, "channel {c}: {got} != {want}");
        }
    }

    #[test]
    fn test_alpha_and_tiny_images() {
        let bytes = test::gradient_rgba_png(1, 1);
        let img = decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        let data = preprocess(&img, ResizeMode::CenterCrop, Normalization::Symmetric);
        assert_eq!(data.len(), INPUT_LEN);
        assert!(data.iter().all(|v| (-1.0..=1.0).contains(v)));

        let bytes = test::gradient_rgba_png(300, 3);
        let img = decode_image(&bytes, DEFAULT_MAX_UPLOAD_BYTES).unwrap();
        let data = preprocess(&img, ResizeMode::CenterCrop, Normalization::Imagenet);
        assert_eq!(data.len(), INPUT_LEN);
    }
}
