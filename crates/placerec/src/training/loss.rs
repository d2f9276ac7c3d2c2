//! Triplet margin loss over Euclidean embedding distances.

use burn::prelude::*;
use burn::tensor::activation::relu;

/// Added to the difference before taking the norm, so identical embeddings
/// still have a finite gradient.
pub const PAIRWISE_EPS: f64 = 1e-6;

/// Row-wise Euclidean distance `‖x1 − x2 + eps‖₂`.
///
/// Input shapes: `(batch, dim)` each. Output shape: `(batch,)`.
pub fn pairwise_distance<B: Backend>(x1: Tensor<B, 2>, x2: Tensor<B, 2>) -> Tensor<B, 1> {
    (x1 - x2)
        .add_scalar(PAIRWISE_EPS)
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .squeeze::<1>(1)
}

/// `mean(max(d(a, p) − d(a, n) + margin, 0))` over the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletMarginLoss {
    pub margin: f64,
}

impl TripletMarginLoss {
    pub fn new(margin: f64) -> Self {
        Self { margin }
    }

    /// Returns a scalar loss tensor of shape `(1,)`.
    pub fn forward<B: Backend>(
        &self,
        anchor: Tensor<B, 2>,
        positive: Tensor<B, 2>,
        negative: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let dist_pos = pairwise_distance(anchor.clone(), positive);
        let dist_neg = pairwise_distance(anchor, negative);
        self.loss_from_distances(dist_pos, dist_neg)
    }

    /// Same loss from precomputed `(batch,)` distances.
    pub fn loss_from_distances<B: Backend>(
        &self,
        dist_pos: Tensor<B, 1>,
        dist_neg: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        relu((dist_pos - dist_neg).add_scalar(self.margin)).mean()
    }
}
