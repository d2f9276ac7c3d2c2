//! NetVLAD aggregation head.
//!
//! Turns a spatial feature map into a fixed-length descriptor by softly
//! assigning every location to K learned cluster centroids and summing the
//! assignment-weighted residuals:
//!
//! ```text
//! (batch, C, H, W)
//!   → [L2-normalize over C]                      (optional)
//!   → a = softmax_k(Conv1x1(C→K)(x))              (batch, K, HW)
//!   → V[k, c] = Σ_hw a[k, hw] · (x[c, hw] − μ[k, c])
//!   → L2-normalize each cluster row               (intra-normalization)
//!   → flatten (batch, K·C) → L2-normalize
//! ```
//!
//! The 1x1 convolution starts out as the soft-assignment that the centroids
//! alone would induce: weight `2α·μ_k`, bias `−α·‖μ_k‖`.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;

use crate::model::bridge::l2_normalize;

/// Configuration for the NetVLAD layer.
#[derive(Config, Debug)]
pub struct NetVladConfig {
    /// Channels of the incoming feature map.
    pub dim: usize,
    /// Number of clusters K.
    #[config(default = 21)]
    pub num_clusters: usize,
    /// Soft-assignment sharpness used to initialize the assignment conv.
    #[config(default = 1.0)]
    pub alpha: f64,
    /// L2-normalize each location's descriptor before assignment.
    #[config(default = true)]
    pub normalize_input: bool,
}

impl NetVladConfig {
    /// Descriptor length produced by the layer.
    pub fn output_dim(&self) -> usize {
        self.num_clusters * self.dim
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> NetVlad<B> {
        let k = self.num_clusters;
        let centroids =
            Tensor::<B, 2>::random([k, self.dim], Distribution::Uniform(0.0, 1.0), device);

        let weight = centroids
            .clone()
            .mul_scalar(2.0 * self.alpha)
            .reshape([k, self.dim, 1, 1]);
        let bias = centroids
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .reshape([k])
            .mul_scalar(-self.alpha);

        let mut assignment = Conv2dConfig::new([self.dim, k], [1, 1]).init(device);
        assignment.weight = Param::from_tensor(weight);
        assignment.bias = Some(Param::from_tensor(bias));

        NetVlad {
            assignment,
            centroids: Param::from_tensor(centroids),
            normalize_input: self.normalize_input,
        }
    }
}

#[derive(Module, Debug)]
pub struct NetVlad<B: Backend> {
    /// 1x1 conv producing per-location cluster logits.
    assignment: Conv2d<B>,
    /// Cluster centroids, shape `(K, C)`.
    centroids: Param<Tensor<B, 2>>,
    normalize_input: bool,
}

impl<B: Backend> NetVlad<B> {
    /// Input shape: `(batch, C, H, W)`
    /// Output shape: `(batch, K·C)`, unit L2 norm per row.
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, c, h, w] = features.dims();
        let [k, _] = self.centroids.dims();
        let hw = h * w;

        let x = if self.normalize_input {
            l2_normalize(features, 1)
        } else {
            features
        };

        let logits = self.assignment.forward(x.clone()).reshape([n, k, hw]);
        let soft_assign = softmax(logits, 1);

        let x_flat = x.reshape([n, c, hw]);
        // Σ_hw a[k,hw]·x[c,hw]  →  (n, k, c)
        let weighted = soft_assign.clone().matmul(x_flat.swap_dims(1, 2));
        // Σ_hw a[k,hw]·μ[k,c]  →  (n, k, c)
        let mass = soft_assign.sum_dim(2).expand([n, k, c]);
        let centroids = self.centroids.val().unsqueeze::<3>().expand([n, k, c]);
        let vlad = weighted - mass * centroids;

        let vlad = l2_normalize(vlad, 2);
        l2_normalize(vlad.reshape([n, k * c]), 1)
    }
}
