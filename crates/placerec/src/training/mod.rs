//! Triplet training pipeline: loss, data-parallel replica, ROC metrics,
//! checkpoints and the per-epoch train/validate loop.

pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod replica;
pub mod roc;
pub mod trainer;
