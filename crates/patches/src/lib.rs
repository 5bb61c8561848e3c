//! Image-patch datasets for camera-model identification.
//!
//! Lists `{root}/{split}/{class}/*` patch trees, decodes patches to grayscale
//! pixels with optional post-processing (JPEG, blur, noise), and serves them
//! as repeating fixed-size batches.

pub mod batches;
pub mod decode;
pub mod reader;
pub mod types;

pub use batches::{BatchSource, SliceBatches};
pub use decode::PatchLoader;
pub use reader::{compute_steps, discover_classes, list_class_files, DatasetSlice};
pub use types::{Batch, DataConfig, Distortion, Example, PatchError, SliceKind};
