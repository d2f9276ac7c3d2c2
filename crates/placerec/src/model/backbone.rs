//! Convolutional feature extractors.
//!
//! A backbone is a stack of `conv → ReLU → [max-pool]` stages described by a
//! list of [`ConvStageSpec`]s, so AlexNet, VGG-11 and the small test network
//! share one module type:
//!
//! ```text
//! (batch, 3, H, W)
//!   → [Conv2d(k, stride, pad) → ReLU → MaxPool2d?] x stages
//!   → (batch, C_out, H', W')
//! ```

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

/// Max-pool applied after a stage's activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub kernel_size: usize,
    pub stride: usize,
}

/// One `conv → ReLU → pool?` stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvStageSpec {
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub pool: Option<PoolSpec>,
}

impl ConvStageSpec {
    fn conv(out_channels: usize, kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            out_channels,
            kernel_size,
            stride,
            padding,
            pool: None,
        }
    }

    fn pooled(mut self, kernel_size: usize, stride: usize) -> Self {
        self.pool = Some(PoolSpec {
            kernel_size,
            stride,
        });
        self
    }
}

/// Configuration for a [`ConvBackbone`].
#[derive(Config, Debug)]
pub struct ConvBackboneConfig {
    /// Stages applied in order.
    pub stages: Vec<ConvStageSpec>,
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl ConvBackboneConfig {
    /// AlexNet convolutional features without the final max-pool (256 channels).
    pub fn alexnet() -> Self {
        Self::new(vec![
            ConvStageSpec::conv(64, 11, 4, 2).pooled(3, 2),
            ConvStageSpec::conv(192, 5, 1, 2).pooled(3, 2),
            ConvStageSpec::conv(384, 3, 1, 1),
            ConvStageSpec::conv(256, 3, 1, 1),
            ConvStageSpec::conv(256, 3, 1, 1),
        ])
    }

    /// VGG-11 convolutional features without the final max-pool (512 channels).
    pub fn vgg11() -> Self {
        Self::new(vec![
            ConvStageSpec::conv(64, 3, 1, 1).pooled(2, 2),
            ConvStageSpec::conv(128, 3, 1, 1).pooled(2, 2),
            ConvStageSpec::conv(256, 3, 1, 1),
            ConvStageSpec::conv(256, 3, 1, 1).pooled(2, 2),
            ConvStageSpec::conv(512, 3, 1, 1),
            ConvStageSpec::conv(512, 3, 1, 1).pooled(2, 2),
            ConvStageSpec::conv(512, 3, 1, 1),
            ConvStageSpec::conv(512, 3, 1, 1),
        ])
    }

    /// Two small stages (16 channels) for smoke runs and tests.
    pub fn tiny() -> Self {
        Self::new(vec![
            ConvStageSpec::conv(8, 3, 1, 1).pooled(2, 2),
            ConvStageSpec::conv(16, 3, 1, 1),
        ])
    }

    /// Channels of the produced feature map.
    pub fn out_channels(&self) -> usize {
        self.stages
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(self.in_channels)
    }

    /// Initialize a backbone with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBackbone<B> {
        let mut in_channels = self.in_channels;
        let mut stages = Vec::with_capacity(self.stages.len());
        for spec in &self.stages {
            let conv = Conv2dConfig::new(
                [in_channels, spec.out_channels],
                [spec.kernel_size, spec.kernel_size],
            )
            .with_stride([spec.stride, spec.stride])
            .with_padding(PaddingConfig2d::Explicit(spec.padding, spec.padding))
            .init(device);
            let pool = spec.pool.map(|p| {
                MaxPool2dConfig::new([p.kernel_size, p.kernel_size])
                    .with_strides([p.stride, p.stride])
                    .init()
            });
            stages.push(ConvStage { conv, pool });
            in_channels = spec.out_channels;
        }
        ConvBackbone { stages }
    }
}

#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    conv: Conv2d<B>,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv.forward(x));
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// Feature extractor producing a spatial feature map.
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    stages: Vec<ConvStage<B>>,
}

impl<B: Backend> ConvBackbone<B> {
    /// Input shape: `(batch, in_channels, H, W)`
    /// Output shape: `(batch, out_channels, H', W')`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.stages
            .iter()
            .fold(images, |x, stage| stage.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tiny_output_shape() {
        let device = Default::default();
        let backbone = ConvBackboneConfig::tiny().init::<TestBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let features = backbone.forward(images);
        // one 2x2 pool halves the spatial size
        assert_eq!(features.dims(), [2, 16, 8, 8]);
    }

    #[test]
    fn test_alexnet_output_shape() {
        let device = Default::default();
        let backbone = ConvBackboneConfig::alexnet().init::<TestBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([1, 3, 63, 63], Distribution::Normal(0.0, 1.0), &device);
        let features = backbone.forward(images);
        // 63 -> conv(11,s4,p2) 15 -> pool(3,2) 7 -> conv 7 -> pool 3 -> 3 -> 3 -> 3
        assert_eq!(features.dims(), [1, 256, 3, 3]);
    }

    #[test]
    fn test_out_channels() {
        assert_eq!(ConvBackboneConfig::alexnet().out_channels(), 256);
        assert_eq!(ConvBackboneConfig::vgg11().out_channels(), 512);
        assert_eq!(ConvBackboneConfig::tiny().out_channels(), 16);
    }
}
