//! Backend selection and rank-to-device binding.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn::backend::Wgpu<f32, i32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn::backend::NdArray<f32>;

/// Autodiff wrapper used by the training loop.
pub type AutodiffTrainBackend = Autodiff<TrainBackend>;

pub type TrainDevice = <TrainBackend as Backend>::Device;

/// Device bound to `rank`: the rank indexes into the configured GPU id list.
pub fn device_for_rank(gpu_ids: &[usize], rank: usize) -> anyhow::Result<TrainDevice> {
    let gpu_id = *gpu_ids.get(rank).ok_or_else(|| {
        anyhow::anyhow!(
            "rank {rank} has no device: only {} gpu id(s) configured ({gpu_ids:?})",
            gpu_ids.len()
        )
    })?;
    Ok(device_for_gpu(gpu_id))
}

#[cfg(feature = "backend-wgpu")]
fn device_for_gpu(gpu_id: usize) -> TrainDevice {
    burn::backend::wgpu::WgpuDevice::DiscreteGpu(gpu_id)
}

#[cfg(not(feature = "backend-wgpu"))]
fn device_for_gpu(gpu_id: usize) -> TrainDevice {
    tracing::debug!(gpu_id, "NdArray backend: binding rank to the CPU device");
    burn::backend::ndarray::NdArrayDevice::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_without_gpu_id_is_an_error() {
        assert!(device_for_rank(&[0, 1], 2).is_err());
        assert!(device_for_rank(&[], 0).is_err());
    }

    #[test]
    fn test_rank_with_gpu_id_binds() {
        assert!(device_for_rank(&[3, 5], 1).is_ok());
    }
}
