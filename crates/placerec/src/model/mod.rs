//! Embedding network components: convolutional backbones, the NetVLAD
//! aggregation head, the shared-weight triplet wrapper, and the tensor bridge
//! between host image buffers and burn tensors.

pub mod backbone;
pub mod bridge;
pub mod embed;
pub mod netvlad;
