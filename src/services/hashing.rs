//! Image fingerprints: exact content hash and DCT perceptual hash

use std::f64::consts::PI;

use image::{imageops::FilterType, ImageFormat};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

const DCT_INPUT: usize = 32;
const DCT_KEPT: usize = 8;

/// Fingerprints of one uploaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFingerprint {
    /// First 128 bits of the SHA-256 digest, hex encoded
    pub content_hash: String,
    pub perceptual_hash: u64,
    pub format: ImageFormat,
}

impl ImageFingerprint {
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Fingerprint raw upload bytes. Only JPEG, PNG and WebP are accepted.
    pub fn hash(&self, bytes: &[u8]) -> AppResult<ImageFingerprint> {
        let format = image::guess_format(bytes)
            .map_err(|_| AppError::Validation("Unrecognised image data".to_string()))?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
            return Err(AppError::Validation(format!(
                "Unsupported image type: {}",
                format.to_mime_type()
            )));
        }

        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| AppError::Validation(format!("Failed to decode image: {}", e)))?;

        Ok(ImageFingerprint {
            content_hash: content_hash(bytes),
            perceptual_hash: perceptual_hash(&image),
            format,
        })
    }

    /// Run [`HashService::hash`] off the async executor
    pub async fn hash_blocking(&self, bytes: Vec<u8>) -> AppResult<ImageFingerprint> {
        let service = *self;
        tokio::task::spawn_blocking(move || service.hash(&bytes))
            .await
            .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))?
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

/// 64-bit DCT hash: grayscale, 32x32, keep the lowest 8x8 frequencies and
/// set each bit whose coefficient lies above the median of the AC terms.
pub fn perceptual_hash(image: &image::DynamicImage) -> u64 {
    let gray = image::imageops::resize(
        &image.to_luma8(),
        DCT_INPUT as u32,
        DCT_INPUT as u32,
        FilterType::Triangle,
    );

    let mut pixels = [[0f64; DCT_INPUT]; DCT_INPUT];
    for (x, y, p) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = f64::from(p.0[0]);
    }

    let mut basis = [[0f64; DCT_INPUT]; DCT_KEPT];
    for (u, row) in basis.iter_mut().enumerate() {
        for (x, cell) in row.iter_mut().enumerate() {
            *cell = ((2 * x + 1) as f64 * u as f64 * PI / (2 * DCT_INPUT) as f64).cos();
        }
    }

    let mut coefficients = [0f64; DCT_KEPT * DCT_KEPT];
    for u in 0..DCT_KEPT {
        for v in 0..DCT_KEPT {
            let mut sum = 0.0;
            for (y, row) in pixels.iter().enumerate() {
                for (x, value) in row.iter().enumerate() {
                    sum += value * basis[u][y] * basis[v][x];
                }
            }
            coefficients[u * DCT_KEPT + v] = sum;
        }
    }

    let mut ac: Vec<f64> = coefficients[1..].to_vec();
    ac.sort_by(|a, b| a.total_cmp(b));
    let median = (ac[ac.len() / 2 - 1] + ac[ac.len() / 2]) / 2.0;

    coefficients
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > median)
        .fold(0u64, |hash, (i, _)| hash | (1 << (63 - i)))
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::io::Cursor;

    fn wave(shift: i32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let (x, y) = (x as f64, y as f64);
            let v = 128.0 + 40.0 * (x / 9.0).sin() + 30.0 * (y / 7.0).cos()
                + 20.0 * ((x + y) / 13.0).sin();
            Luma([(v as i32 + shift).clamp(0, 255) as u8])
        })
    }

    fn encode(image: GrayImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(image)
            .write_to(&mut out, format)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_identical_bytes_identical_fingerprint() {
        let bytes = encode(wave(0), ImageFormat::Png);
        let service = HashService::new();
        let a = service.hash(&bytes).unwrap();
        let b = service.hash(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.content_hash.len(), 32);
        assert_eq!(a.content_type(), "image/png");
    }

    #[test]
    fn test_brightened_copy_is_near_duplicate() {
        let service = HashService::new();
        let original = service.hash(&encode(wave(0), ImageFormat::Png)).unwrap();
        let brighter = service.hash(&encode(wave(10), ImageFormat::Png)).unwrap();

        assert_ne!(original.content_hash, brighter.content_hash);
        assert!(hamming_distance(original.perceptual_hash, brighter.perceptual_hash) <= 8);
    }

    #[test]
    fn test_inverted_image_is_far() {
        let mut inverted = wave(0);
        image::imageops::invert(&mut inverted);

        let service = HashService::new();
        let a = service.hash(&encode(wave(0), ImageFormat::Png)).unwrap();
        let b = service.hash(&encode(inverted, ImageFormat::Png)).unwrap();
        assert!(hamming_distance(a.perceptual_hash, b.perceptual_hash) > 32);
    }

    #[test]
    fn test_rejects_non_images() {
        let err = HashService::new().hash(b"%PDF-1.7 not a photo").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0b1011, 0b0001), 2);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }
}
