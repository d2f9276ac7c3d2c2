//! Tensor bridge: conversions between host buffers (`Vec<f32>`) and burn
//! tensors, plus small tensor helpers shared by the model and the loss.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Stack a batch of CHW images (flattened) into a `(batch, C, H, W)` tensor.
///
/// # Panics
/// Panics if `flat.len() != batch * C * H * W`.
pub fn images_to_tensor<B: Backend>(
    flat: Vec<f32>,
    batch: usize,
    chw: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [c, h, w] = chw;
    assert_eq!(
        flat.len(),
        batch * c * h * w,
        "image buffer has {} values, expected {batch}x{c}x{h}x{w}",
        flat.len()
    );
    Tensor::from_data(TensorData::new(flat, [batch, c, h, w]), device)
}

/// Extract f64 values from a burn 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> anyhow::Result<Vec<f64>> {
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read tensor data: {e:?}"))?;
    Ok(values.into_iter().map(f64::from).collect())
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Divide by the L2 norm along `dim` (norm clamped away from zero).
pub fn l2_normalize<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(dim).sqrt().clamp_min(1e-12);
    x / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_images_to_tensor_shape() {
        let device = Default::default();
        let flat = vec![0.5_f32; 2 * 3 * 4 * 5];
        let t = images_to_tensor::<TestBackend>(flat, 2, [3, 4, 5], &device);
        assert_eq!(t.dims(), [2, 3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "image buffer")]
    fn test_images_to_tensor_rejects_bad_length() {
        let device = Default::default();
        images_to_tensor::<TestBackend>(vec![0.0; 7], 1, [3, 2, 2], &device);
    }

    #[test]
    fn test_tensor_to_vec() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([1.0_f32, 2.5, -3.0]),
            &device,
        );
        let values = tensor_to_vec(tensor).unwrap();
        assert_eq!(values.len(), 3);
        assert!((values[1] - 2.5).abs() < 1e-6);

        let scalar = Tensor::<TestBackend, 1>::from_data(TensorData::from([42.0_f32]), &device);
        assert!((tensor_to_f64(scalar) - 42.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![3.0_f32, 4.0, 0.0, 0.0], [2, 2]),
            &device,
        );
        let n: Vec<f32> = l2_normalize(x, 1).into_data().to_vec().unwrap();
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
        // zero rows stay zero instead of turning into NaN
        assert_eq!(&n[2..], &[0.0, 0.0]);
    }
}
