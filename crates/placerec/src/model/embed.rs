use burn::prelude::*;

use crate::model::backbone::{ConvBackbone, ConvBackboneConfig};
use crate::model::netvlad::{NetVlad, NetVladConfig};

/// Configuration for an [`EmbedNet`].
///
/// ```text
/// (batch, 3, H, W)
///   → backbone                    (batch, C, H', W')
///   → NetVLAD(K clusters)         (batch, K·C), unit L2 norm
/// ```
#[derive(Config, Debug)]
pub struct EmbedNetConfig {
    pub backbone: ConvBackboneConfig,
    /// Clusters of the aggregation head; its input dim is taken from the backbone.
    #[config(default = 21)]
    pub num_clusters: usize,
    #[config(default = 1.0)]
    pub alpha: f64,
    #[config(default = true)]
    pub normalize_input: bool,
}

impl EmbedNetConfig {
    pub fn netvlad(&self) -> NetVladConfig {
        NetVladConfig::new(self.backbone.out_channels())
            .with_num_clusters(self.num_clusters)
            .with_alpha(self.alpha)
            .with_normalize_input(self.normalize_input)
    }

    /// Length of the produced descriptor.
    pub fn embedding_dim(&self) -> usize {
        self.netvlad().output_dim()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EmbedNet<B> {
        EmbedNet {
            backbone: self.backbone.init(device),
            netvlad: self.netvlad().init(device),
        }
    }

    /// Wrap a freshly initialized embedding network for triplet training.
    pub fn init_triplet<B: Backend>(&self, device: &B::Device) -> TripletNet<B> {
        TripletNet::new(self.init(device))
    }
}

/// Backbone followed by NetVLAD: one image in, one descriptor out.
#[derive(Module, Debug)]
pub struct EmbedNet<B: Backend> {
    backbone: ConvBackbone<B>,
    netvlad: NetVlad<B>,
}

impl<B: Backend> EmbedNet<B> {
    /// Input shape: `(batch, 3, H, W)`
    /// Output shape: `(batch, K·C)`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.netvlad.forward(self.backbone.forward(images))
    }
}

/// Applies one [`EmbedNet`] to anchor, positive and negative batches.
///
/// There is exactly one set of weights; all three branches share it.
#[derive(Module, Debug)]
pub struct TripletNet<B: Backend> {
    embed: EmbedNet<B>,
}

impl<B: Backend> TripletNet<B> {
    pub fn new(embed: EmbedNet<B>) -> Self {
        Self { embed }
    }

    pub fn embed_net(&self) -> &EmbedNet<B> {
        &self.embed
    }

    /// Returns `(anchor, positive, negative)` embeddings, each `(batch, K·C)`.
    pub fn forward(
        &self,
        anchor: Tensor<B, 4>,
        positive: Tensor<B, 4>,
        negative: Tensor<B, 4>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        (
            self.embed.forward(anchor),
            self.embed.forward(positive),
            self.embed.forward(negative),
        )
    }
}
