//! Tensor bridge: converts `patches` batches (flat `Vec<f32>` pixels and
//! class indices) into burn tensors, and burn outputs back into plain vectors.

use burn::prelude::*;
use burn::tensor::TensorData;
use patches::Batch;

/// Labels of one batch in both encodings used by the losses.
pub struct Targets<B: Backend> {
    /// Class indices, shape `(batch,)`.
    pub indices: Tensor<B, 1, Int>,
    /// One-hot labels, shape `(batch, num_classes)`.
    pub one_hot: Tensor<B, 2>,
}

/// Convert a batch of grayscale patches to a `(batch, 1, size, size)` tensor.
pub fn batch_to_images<B: Backend>(batch: &Batch, device: &B::Device) -> Tensor<B, 4> {
    let size = batch.image_size;
    Tensor::from_data(
        TensorData::new(batch.pixels.clone(), [batch.len(), 1, size, size]),
        device,
    )
}

/// Build index and one-hot label tensors for a batch.
pub fn batch_to_targets<B: Backend>(
    labels: &[usize],
    num_classes: usize,
    device: &B::Device,
) -> Targets<B> {
    let n = labels.len();
    let indices: Vec<i64> = labels.iter().map(|&l| l as i64).collect();

    let mut one_hot = vec![0.0_f32; n * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label < num_classes {
            one_hot[row * num_classes + label] = 1.0;
        }
    }

    Targets {
        indices: Tensor::from_data(TensorData::new(indices, [n]), device),
        one_hot: Tensor::from_data(TensorData::new(one_hot, [n, num_classes]), device),
    }
}

/// Row-wise argmax of `(batch, num_classes)` scores.
pub fn argmax_rows<B: Backend>(scores: Tensor<B, 2>) -> Vec<usize> {
    scores
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .map(|v| v.max(0) as usize)
        .collect()
}

/// Flatten any float tensor into a `Vec<f32>` in row-major order.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem()
}
