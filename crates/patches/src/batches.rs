//! Repeating batch iteration over a dataset slice.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::decode::PatchLoader;
use crate::reader::DatasetSlice;
use crate::types::{Batch, PatchError};

/// Anything that can hand out labeled batches on demand.
///
/// Sources repeat forever: trainers pull a fixed number of steps per epoch.
pub trait BatchSource {
    /// Decode and return the next batch.
    fn next_batch(&mut self) -> Result<Batch, PatchError>;

    /// Number of classes labels are drawn from.
    fn num_classes(&self) -> usize;
}

/// Cycles over a [`DatasetSlice`] in fixed-size batches.
///
/// Batches always hold `batch_size` examples and wrap across the end of the
/// slice. With shuffling enabled the order is reshuffled on every pass.
pub struct SliceBatches {
    slice: DatasetSlice,
    loader: PatchLoader,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    rng: StdRng,
}

impl SliceBatches {
    pub fn new(
        slice: DatasetSlice,
        loader: PatchLoader,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, PatchError> {
        if batch_size == 0 {
            return Err(PatchError::ZeroBatchSize);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..slice.len()).collect();
        if shuffle {
            order.shuffle(&mut rng);
        }
        Ok(Self {
            slice,
            loader,
            batch_size,
            order,
            cursor: 0,
            shuffle,
            rng,
        })
    }

    pub fn slice(&self) -> &DatasetSlice {
        &self.slice
    }

    /// Batches needed to see every example once.
    pub fn batches_per_pass(&self) -> usize {
        self.slice.num_batches(self.batch_size)
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.cursor = 0;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }
}

impl BatchSource for SliceBatches {
    fn next_batch(&mut self) -> Result<Batch, PatchError> {
        if self.slice.is_empty() {
            return Err(PatchError::EmptySlice(self.slice.kind.to_string()));
        }

        let size = self.loader.image_size();
        let mut pixels = Vec::with_capacity(self.batch_size * size * size);
        let mut labels = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            let idx = self.next_index();
            let example = &self.slice.examples[idx];
            let path = example.path.clone();
            let label = example.label;
            let distortion = self.slice.distortion;
            pixels.extend(self.loader.load(&path, distortion, &mut self.rng)?);
            labels.push(label);
        }

        Ok(Batch {
            pixels,
            labels,
            image_size: size,
        })
    }

    fn num_classes(&self) -> usize {
        self.slice.num_classes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SliceKind;
    use image::{GrayImage, Luma};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_class(root: &Path, class: &str, n: usize, value: u8) {
        let dir = root.join("test").join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..n {
            GrayImage::from_pixel(4, 4, Luma([value]))
                .save(dir.join(format!("{i}.png")))
                .unwrap();
        }
    }

    fn build(root: &Path, batch_size: usize, shuffle: bool) -> SliceBatches {
        let classes = vec!["a".to_string(), "b".to_string()];
        let slice = DatasetSlice::from_class_dirs(SliceKind::Test, root, &classes).unwrap();
        SliceBatches::new(slice, PatchLoader::new(4), batch_size, shuffle, 1).unwrap()
    }

    #[test]
    fn test_batches_wrap_around_slice_end() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "a", 2, 0);
        write_class(tmp.path(), "b", 1, 255);

        let mut batches = build(tmp.path(), 2, false);
        assert_eq!(batches.batches_per_pass(), 2);

        let first = batches.next_batch().unwrap();
        assert_eq!(first.labels, vec![0, 0]);
        assert_eq!(first.pixels.len(), 2 * 16);

        // third example then wrap to the first
        let second = batches.next_batch().unwrap();
        assert_eq!(second.labels, vec![1, 0]);
        assert!((second.pixels[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_shuffled_pass_covers_every_example() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "a", 3, 0);
        write_class(tmp.path(), "b", 3, 255);

        let mut batches = build(tmp.path(), 3, true);
        let mut labels = batches.next_batch().unwrap().labels;
        labels.extend(batches.next_batch().unwrap().labels);
        labels.sort_unstable();
        assert_eq!(labels, vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_empty_slice_errors() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "a", 0, 0);
        write_class(tmp.path(), "b", 0, 0);

        let mut batches = build(tmp.path(), 2, false);
        let err = batches.next_batch().unwrap_err();
        assert!(matches!(err, PatchError::EmptySlice(_)));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let slice = DatasetSlice {
            kind: SliceKind::Test,
            classes: vec![],
            examples: vec![],
            distortion: None,
        };
        assert!(matches!(
            SliceBatches::new(slice, PatchLoader::new(4), 0, false, 0),
            Err(PatchError::ZeroBatchSize)
        ));
    }
}
