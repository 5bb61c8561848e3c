//! Data types for dataset slices, batches, and the data-pipeline config.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Errors raised while listing, decoding, or batching image patches.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// A directory or file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An image file could not be decoded or re-encoded.
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A slice has no examples, so no batch can be drawn from it.
    #[error("dataset slice '{0}' is empty")]
    EmptySlice(String),

    /// Batch size of zero was requested.
    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// Named partition of the data used during training or uncertainty analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceKind {
    Train,
    Val,
    Test,
    /// Camera models never seen during training.
    Unseen,
    /// External dataset (Kaggle camera-model identification).
    Kaggle,
    /// Test slice re-encoded as JPEG.
    Jpeg,
    /// Test slice with Gaussian blur.
    Blur,
    /// Test slice with additive Gaussian noise.
    Noise,
}

impl SliceKind {
    /// Split directory holding this slice's class folders.
    pub fn split_dir(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            _ => "test",
        }
    }

    /// Whether the slice is out-of-distribution for the trained classifier.
    pub fn is_out_of_distribution(self) -> bool {
        !matches!(self, Self::Train | Self::Val | Self::Test)
    }
}

impl fmt::Display for SliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
            Self::Unseen => "unseen",
            Self::Kaggle => "kaggle",
            Self::Jpeg => "jpeg",
            Self::Blur => "blur",
            Self::Noise => "noise",
        };
        f.write_str(name)
    }
}

/// Post-processing applied to a patch after decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distortion {
    /// Re-encode with the given JPEG quality (1-100).
    Jpeg { quality: u8 },
    /// Gaussian blur with the given sigma in pixels.
    Blur { sigma: f32 },
    /// Additive Gaussian noise, std on the 0-255 pixel scale.
    Noise { std: f32 },
}

/// One labeled image patch on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub path: PathBuf,
    /// Index into the slice's class list.
    pub label: usize,
}

/// A batch of decoded grayscale patches, row-major `[len, 1, size, size]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub pixels: Vec<f32>,
    pub labels: Vec<usize>,
    pub image_size: usize,
}

impl Batch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Data-pipeline section of the parameters file.
///
/// Empty class lists are discovered from the `train` (or `test` for the
/// out-of-distribution roots) split directory at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Root holding `{split}/{class}/*` patches of the known camera models.
    #[serde(default = "default_patch_dir")]
    pub patch_dir: PathBuf,
    /// Known camera models, in label order.
    #[serde(default)]
    pub brand_models: Vec<String>,
    /// Root of patches from camera models excluded from training.
    #[serde(default = "default_unseen_dir")]
    pub unseen_dir: PathBuf,
    #[serde(default)]
    pub unseen_brand_models: Vec<String>,
    /// Root of the external dataset.
    #[serde(default = "default_kaggle_dir")]
    pub kaggle_dir: PathBuf,
    #[serde(default)]
    pub kaggle_models: Vec<String>,
    /// Side length of the square patch fed to the network.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    #[serde(default = "default_noise_std")]
    pub noise_std: f32,
    /// Seed for shuffling and noise.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_patch_dir() -> PathBuf {
    PathBuf::from("data/patches")
}
fn default_unseen_dir() -> PathBuf {
    PathBuf::from("data/unseen")
}
fn default_kaggle_dir() -> PathBuf {
    PathBuf::from("data/kaggle")
}
fn default_image_size() -> usize {
    256
}
fn default_jpeg_quality() -> u8 {
    70
}
fn default_blur_sigma() -> f32 {
    1.1
}
fn default_noise_std() -> f32 {
    2.0
}
fn default_seed() -> u64 {
    42
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            patch_dir: default_patch_dir(),
            brand_models: Vec::new(),
            unseen_dir: default_unseen_dir(),
            unseen_brand_models: Vec::new(),
            kaggle_dir: default_kaggle_dir(),
            kaggle_models: Vec::new(),
            image_size: default_image_size(),
            jpeg_quality: default_jpeg_quality(),
            blur_sigma: default_blur_sigma(),
            noise_std: default_noise_std(),
            seed: default_seed(),
        }
    }
}

impl DataConfig {
    /// Distortion used to build the given post-processed slice, if any.
    pub fn distortion_for(&self, kind: SliceKind) -> Option<Distortion> {
        match kind {
            SliceKind::Jpeg => Some(Distortion::Jpeg {
                quality: self.jpeg_quality,
            }),
            SliceKind::Blur => Some(Distortion::Blur {
                sigma: self.blur_sigma,
            }),
            SliceKind::Noise => Some(Distortion::Noise {
                std: self.noise_std,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_dir_mapping() {
        assert_eq!(SliceKind::Train.split_dir(), "train");
        assert_eq!(SliceKind::Val.split_dir(), "val");
        assert_eq!(SliceKind::Test.split_dir(), "test");
        assert_eq!(SliceKind::Unseen.split_dir(), "test");
        assert_eq!(SliceKind::Noise.split_dir(), "test");
    }

    #[test]
    fn test_out_of_distribution_flags() {
        assert!(!SliceKind::Test.is_out_of_distribution());
        assert!(SliceKind::Kaggle.is_out_of_distribution());
        assert!(SliceKind::Jpeg.is_out_of_distribution());
    }

    #[test]
    fn test_data_config_defaults_from_empty_toml() {
        let config: DataConfig = toml::from_str("").unwrap();
        assert_eq!(config.image_size, 256);
        assert_eq!(config.jpeg_quality, 70);
        assert!((config.blur_sigma - 1.1).abs() < 1e-6);
        assert!((config.noise_std - 2.0).abs() < 1e-6);
        assert!(config.brand_models.is_empty());
    }

    #[test]
    fn test_distortion_for_slice() {
        let config = DataConfig::default();
        assert_eq!(
            config.distortion_for(SliceKind::Jpeg),
            Some(Distortion::Jpeg { quality: 70 })
        );
        assert_eq!(config.distortion_for(SliceKind::Test), None);
        assert_eq!(config.distortion_for(SliceKind::Unseen), None);
    }
}
