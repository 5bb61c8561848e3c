//! Patch decoding and post-processing (JPEG re-encode, blur, noise).

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat};
use rand::Rng;
use rand_distr::{Distribution as _, Normal};

use crate::types::{Distortion, PatchError};

/// Decodes patches into grayscale `f32` pixels in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct PatchLoader {
    image_size: usize,
}

impl PatchLoader {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Decode one patch, apply the optional distortion, and return
    /// `image_size * image_size` pixels.
    pub fn load(
        &self,
        path: &Path,
        distortion: Option<Distortion>,
        rng: &mut impl Rng,
    ) -> Result<Vec<f32>, PatchError> {
        let decoded = image::open(path).map_err(|source| PatchError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let gray = self.fit(decoded.to_luma8());

        let pixels = match distortion {
            None => to_unit(&gray),
            Some(Distortion::Jpeg { quality }) => {
                let reencoded = jpeg_roundtrip(&gray, quality).map_err(|source| PatchError::Decode {
                    path: path.to_path_buf(),
                    source,
                })?;
                to_unit(&reencoded)
            }
            Some(Distortion::Blur { sigma }) => to_unit(&imageops::blur(&gray, sigma)),
            Some(Distortion::Noise { std }) => add_gaussian_noise(&gray, std, rng),
        };
        Ok(pixels)
    }

    /// Center-crop patches larger than `image_size`, resize smaller ones.
    fn fit(&self, gray: GrayImage) -> GrayImage {
        let size = self.image_size as u32;
        let (w, h) = gray.dimensions();
        if w == size && h == size {
            gray
        } else if w >= size && h >= size {
            imageops::crop_imm(&gray, (w - size) / 2, (h - size) / 2, size, size).to_image()
        } else {
            imageops::resize(&gray, size, size, FilterType::Triangle)
        }
    }
}

fn to_unit(gray: &GrayImage) -> Vec<f32> {
    gray.as_raw().iter().map(|&p| p as f32 / 255.0).collect()
}

/// Encode as JPEG at `quality` and decode back.
fn jpeg_roundtrip(gray: &GrayImage, quality: u8) -> Result<GrayImage, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(gray)?;
    let decoded = image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)?;
    Ok(decoded.to_luma8())
}

/// Add N(0, std) noise on the 0-255 scale, clamp, and rescale to `[0, 1]`.
fn add_gaussian_noise(gray: &GrayImage, std: f32, rng: &mut impl Rng) -> Vec<f32> {
    let normal = match Normal::new(0.0_f32, std.max(0.0)) {
        Ok(n) => n,
        Err(_) => return to_unit(gray),
    };
    gray.as_raw()
        .iter()
        .map(|&p| (p as f32 + normal.sample(rng)).clamp(0.0, 255.0) / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn checkerboard(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        })
    }

    fn write_png(dir: &Path, name: &str, img: &GrayImage) -> std::path::PathBuf {
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_load_plain_scales_to_unit() {
        let tmp = TempDir::new().unwrap();
        let path = write_png(tmp.path(), "p.png", &checkerboard(8));
        let mut rng = StdRng::seed_from_u64(0);

        let pixels = PatchLoader::new(8).load(&path, None, &mut rng).unwrap();
        assert_eq!(pixels.len(), 64);
        assert!((pixels[0] - 1.0).abs() < 1e-6);
        assert!(pixels[1].abs() < 1e-6);
    }

    #[test]
    fn test_load_center_crops_large_patch() {
        let tmp = TempDir::new().unwrap();
        let path = write_png(tmp.path(), "big.png", &checkerboard(12));
        let mut rng = StdRng::seed_from_u64(0);

        let pixels = PatchLoader::new(8).load(&path, None, &mut rng).unwrap();
        assert_eq!(pixels.len(), 64);
    }

    #[test]
    fn test_blur_smooths_checkerboard() {
        let tmp = TempDir::new().unwrap();
        let path = write_png(tmp.path(), "p.png", &checkerboard(16));
        let mut rng = StdRng::seed_from_u64(0);
        let loader = PatchLoader::new(16);

        let sharp = loader.load(&path, None, &mut rng).unwrap();
        let blurred = loader
            .load(&path, Some(Distortion::Blur { sigma: 1.1 }), &mut rng)
            .unwrap();

        let spread = |v: &[f32]| {
            let max = v.iter().cloned().fold(f32::MIN, f32::max);
            let min = v.iter().cloned().fold(f32::MAX, f32::min);
            max - min
        };
        assert!(spread(&blurred) < spread(&sharp));
    }

    #[test]
    fn test_noise_stays_in_unit_range_and_changes_pixels() {
        let tmp = TempDir::new().unwrap();
        let flat = GrayImage::from_pixel(8, 8, Luma([128u8]));
        let path = write_png(tmp.path(), "flat.png", &flat);
        let mut rng = StdRng::seed_from_u64(7);

        let noisy = PatchLoader::new(8)
            .load(&path, Some(Distortion::Noise { std: 2.0 }), &mut rng)
            .unwrap();
        assert!(noisy.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(noisy.iter().any(|&p| (p - 128.0 / 255.0).abs() > 1e-6));
    }

    #[test]
    fn test_jpeg_roundtrip_keeps_shape() {
        let tmp = TempDir::new().unwrap();
        let path = write_png(tmp.path(), "p.png", &checkerboard(16));
        let mut rng = StdRng::seed_from_u64(0);

        let pixels = PatchLoader::new(16)
            .load(&path, Some(Distortion::Jpeg { quality: 70 }), &mut rng)
            .unwrap();
        assert_eq!(pixels.len(), 256);
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = PatchLoader::new(8)
            .load(Path::new("/nonexistent/patch.png"), None, &mut rng)
            .unwrap_err();
        assert!(matches!(err, PatchError::Decode { .. }));
    }
}
