//! NetVLAD place recognition trained with a triplet margin loss.
//!
//! A CNN backbone followed by a NetVLAD aggregation head embeds each image
//! into an L2-normalized descriptor. Training consumes (anchor, positive,
//! negative) image triples, replicates the model across ranks of a
//! [`collective`] process group and averages gradients after every backward
//! pass. Validation reports mean anchor–positive / anchor–negative distances
//! and the ROC AUC of the negated distances.

#![recursion_limit = "256"]

pub mod backend;
pub mod data;
pub mod model;
pub mod plot;
pub mod registry;
pub mod training;

pub use data::loader::{TripletBatch, TripletLoader};
pub use data::sampler::DistributedSampler;
pub use data::{DatasetOptions, TripletSource};
pub use model::embed::{EmbedNet, EmbedNetConfig, TripletNet};
pub use model::netvlad::{NetVlad, NetVladConfig};
pub use training::metrics::RunningMean;
pub use training::replica::DataParallel;
pub use training::roc::{auc, roc_curve, RocAccumulator, RocCurve};
pub use training::trainer::{EpochReport, TrainingConfig, TrainingSession, ValidationReport};
