//! Class-directory listing and dataset slice construction.

use std::path::{Path, PathBuf};

use crate::types::{Distortion, Example, PatchError, SliceKind};

/// List the files of one class directory, sorted by path.
///
/// A missing or unreadable directory is an error; sub-directories are skipped.
pub fn list_class_files(root: &Path, split: &str, class: &str) -> Result<Vec<PathBuf>, PatchError> {
    let dir = root.join(split).join(class);
    let entries = std::fs::read_dir(&dir).map_err(|source| PatchError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PatchError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Discover class names as the sorted sub-directories of `{root}/{split}`.
pub fn discover_classes(root: &Path, split: &str) -> Result<Vec<String>, PatchError> {
    let dir = root.join(split);
    let entries = std::fs::read_dir(&dir).map_err(|source| PatchError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut classes: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(str::to_string))
        .collect();
    classes.sort();
    Ok(classes)
}

/// Number of batches needed to iterate a split once: `ceil(total_files / batch_size)`.
///
/// Counts the files in every class directory under `{root}/{split}`.
pub fn compute_steps(
    root: &Path,
    split: &str,
    classes: &[String],
    batch_size: usize,
) -> Result<usize, PatchError> {
    if batch_size == 0 {
        return Err(PatchError::ZeroBatchSize);
    }
    let mut size = 0;
    for class in classes {
        size += list_class_files(root, split, class)?.len();
    }
    Ok(size.div_ceil(batch_size))
}

/// An ordered, labeled partition of image patches.
#[derive(Debug, Clone)]
pub struct DatasetSlice {
    pub kind: SliceKind,
    pub classes: Vec<String>,
    pub examples: Vec<Example>,
    /// Post-processing applied when examples are decoded.
    pub distortion: Option<Distortion>,
}

impl DatasetSlice {
    /// Build a slice from `{root}/{kind.split_dir()}/{class}/*`.
    ///
    /// Examples are ordered class by class, files sorted within a class.
    pub fn from_class_dirs(
        kind: SliceKind,
        root: &Path,
        classes: &[String],
    ) -> Result<Self, PatchError> {
        let split = kind.split_dir();
        let mut examples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            for path in list_class_files(root, split, class)? {
                examples.push(Example { path, label });
            }
        }

        tracing::debug!(
            slice = %kind,
            root = %root.display(),
            classes = classes.len(),
            examples = examples.len(),
            "Built dataset slice"
        );

        Ok(Self {
            kind,
            classes: classes.to_vec(),
            examples,
            distortion: None,
        })
    }

    /// Copy of this slice relabeled as a post-processed variant.
    pub fn with_distortion(&self, kind: SliceKind, distortion: Distortion) -> Self {
        Self {
            kind,
            classes: self.classes.clone(),
            examples: self.examples.clone(),
            distortion: Some(distortion),
        }
    }

    /// Cycle or truncate the examples so the slice yields exactly
    /// `num_batches` full batches of `batch_size`.
    ///
    /// Used to align out-of-distribution slices with the in-distribution
    /// test slice. An empty slice stays empty.
    pub fn aligned(mut self, num_batches: usize, batch_size: usize) -> Self {
        if self.examples.is_empty() {
            return self;
        }
        let target = num_batches * batch_size;
        let aligned: Vec<Example> = self.examples.iter().cycle().take(target).cloned().collect();
        self.examples = aligned;
        self
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of batches needed to cover the slice once.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.examples.len().div_ceil(batch_size)
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}
