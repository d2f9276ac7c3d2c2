//! Epoch-level training and validation.
//!
//! A [`TrainingSession`] owns everything one rank needs for a run: the
//! data-parallel replica, its optimizer, the train/test loaders, the device
//! and the checkpoint/plot writers. Each epoch is
//! `set_epoch → train_epoch → validate → (rank 0) checkpoint + ROC plot`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use collective::{CollectiveError, Communicator};
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::loader::TripletLoader;
use crate::data::sampler::DistributedSampler;
use crate::data::transform::ImageTransform;
use crate::data::{DatasetError, TripletSource};
use crate::model::bridge::{tensor_to_f64, tensor_to_vec};
use crate::model::embed::TripletNet;
use crate::plot::draw_roc_curve;
use crate::training::checkpoint::{load_checkpoint, save_checkpoint, CheckpointMeta, CheckpointPaths};
use crate::training::loss::{pairwise_distance, TripletMarginLoss};
use crate::training::metrics::RunningMean;
use crate::training::replica::DataParallel;
use crate::training::roc::{RocAccumulator, RocCurve};

/// Configuration for a training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Adam learning rate.
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Triplet loss margin.
    #[config(default = 0.1)]
    pub margin: f64,
    /// Epochs are numbered `1..=total_epoch`.
    #[config(default = 10)]
    pub total_epoch: usize,
    /// Triplets per batch on each rank.
    #[config(default = 8)]
    pub batch_size: usize,
    /// Image decoding threads per rank (0 = decode inline).
    #[config(default = 0)]
    pub num_workers: usize,
    /// Seed for sampler permutations and augmentation.
    #[config(default = 42)]
    pub seed: u64,
    /// Backbone registry name; part of checkpoint file names.
    #[config(default = "String::from(\"alexnet\")")]
    pub backbone: String,
    /// Aggregation model registry name; part of checkpoint file names.
    #[config(default = "String::from(\"netvlad\")")]
    pub model: String,
    #[config(default = "String::from(\"checkpoints\")")]
    pub checkpoint_dir: String,
    #[config(default = "String::from(\"visualizations\")")]
    pub visualization_dir: String,
    /// Continue after this saved epoch instead of starting from scratch.
    pub resume_epoch: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("non-finite loss {loss} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize, loss: f64 },
    #[error("validation partition of rank {rank} is empty")]
    EmptyValidation { rank: usize },
    #[error("resume epoch {resume} is not below total_epoch {total}")]
    ResumePastEnd { resume: usize, total: usize },
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Datasets and image preprocessing for one run.
pub struct SessionData {
    pub train: Arc<dyn TripletSource>,
    pub test: Arc<dyn TripletSource>,
    pub image_width: u32,
    pub image_height: u32,
    /// Horizontal flip probability for training images.
    pub flip_prob: f64,
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub loss: f64,
    /// Mean anchor–positive distance.
    pub dist_pos: f64,
    /// Mean anchor–negative distance.
    pub dist_neg: f64,
    pub auc: f64,
    pub curve: RocCurve,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation: ValidationReport,
}

impl EpochReport {
    /// The five per-epoch console lines.
    pub fn console_lines(&self) -> [String; 5] {
        let e = self.epoch;
        let v = &self.validation;
        [
            format!("[Epoch {e}] Train loss {:.4}", self.train_loss),
            format!("[Epoch {e}] Validation loss {:.4}", v.loss),
            format!("[Epoch {e}] Average distance with positive sample: {:.4}", v.dist_pos),
            format!("[Epoch {e}] Average distance with negative sample: {:.4}", v.dist_neg),
            format!("[Epoch {e}] ROC AUC: {:.4}", v.auc),
        ]
    }
}

pub struct TrainingSession<B: AutodiffBackend, O> {
    config: TrainingConfig,
    replica: DataParallel<B>,
    optimizer: O,
    criterion: TripletMarginLoss,
    train_loader: TripletLoader,
    test_loader: TripletLoader,
    device: B::Device,
    checkpoints: CheckpointPaths,
    /// First epoch `fit` will run.
    start_epoch: usize,
}

impl<B, O> TrainingSession<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<TripletNet<B>, B>,
{
    /// Build a session for the rank behind `comm`.
    ///
    /// The model is broadcast from rank 0. With `resume_epoch` set, every rank
    /// loads that epoch's checkpoint before the broadcast.
    pub fn new(
        config: TrainingConfig,
        data: SessionData,
        model: TripletNet<B>,
        optimizer: O,
        comm: Arc<dyn Communicator>,
        device: B::Device,
    ) -> anyhow::Result<Self> {
        let rank = comm.rank();
        let world_size = comm.world_size();
        let checkpoints = CheckpointPaths::new(&config.checkpoint_dir, &config.backbone, &config.model);

        let (model, optimizer, start_epoch) = match config.resume_epoch {
            Some(resume) => {
                if resume >= config.total_epoch {
                    return Err(TrainError::ResumePastEnd {
                        resume,
                        total: config.total_epoch,
                    }
                    .into());
                }
                let (model, optimizer, meta) =
                    load_checkpoint(&checkpoints, resume, model, optimizer, &device)?;
                tracing::info!(
                    resume,
                    train_loss = meta.train_loss,
                    val_loss = meta.val_loss,
                    auc = meta.auc,
                    "Resuming training"
                );
                (model, optimizer, resume + 1)
            }
            None => (model, optimizer, 1),
        };

        let replica = DataParallel::new(model, comm)?;

        let train_transform = ImageTransform::new(data.image_width, data.image_height)
            .with_flip_prob(data.flip_prob);
        let test_transform = ImageTransform::new(data.image_width, data.image_height);

        let train_sampler =
            DistributedSampler::new(data.train.len(), world_size, rank).with_seed(config.seed);
        let test_sampler =
            DistributedSampler::new(data.test.len(), world_size, rank).with_seed(config.seed);

        let train_loader = TripletLoader::new(
            data.train,
            train_sampler,
            train_transform,
            config.batch_size,
            config.num_workers,
            config.seed,
        )?;
        let test_loader = TripletLoader::new(
            data.test,
            test_sampler,
            test_transform,
            config.batch_size,
            config.num_workers,
            config.seed,
        )?;

        tracing::info!(
            rank,
            world_size,
            train_samples = train_loader.num_samples(),
            train_batches = train_loader.num_batches(),
            test_samples = test_loader.num_samples(),
            test_batches = test_loader.num_batches(),
            start_epoch,
            total_epoch = config.total_epoch,
            "Training session ready"
        );

        Ok(Self {
            criterion: TripletMarginLoss::new(config.margin),
            config,
            replica,
            optimizer,
            train_loader,
            test_loader,
            device,
            checkpoints,
            start_epoch,
        })
    }

    pub fn rank(&self) -> usize {
        self.replica.communicator().rank()
    }

    pub fn is_root(&self) -> bool {
        self.replica.communicator().is_root()
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn replica(&self) -> &DataParallel<B> {
        &self.replica
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Batches each epoch of training runs on this rank.
    pub fn train_batches(&self) -> usize {
        self.train_loader.num_batches()
    }

    /// Reshuffle the training partition. Must be called with the same epoch
    /// on every rank. The test partition keeps its initial order.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.train_loader.set_epoch(epoch as u64);
    }

    /// One pass over this rank's training partition.
    ///
    /// Returns the batch-size-weighted mean loss. Every step also sums the
    /// scalar loss across ranks, one single-value all-reduce per batch on top
    /// of the gradient averaging, so a non-finite loss on any rank stops every
    /// rank on the same batch.
    pub fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let lr = self.config.learning_rate;
        let comm = Arc::clone(self.replica.communicator());
        let pb = self.progress_bar(self.train_loader.num_batches(), format!("epoch {epoch} train"));
        let started = Instant::now();
        let mut losses = RunningMean::new();

        for (batch_idx, batch) in self.train_loader.iter().enumerate() {
            let batch = batch?;
            let batch_len = batch.len;
            let (anchor, positive, negative) = batch.into_tensors::<B>(&self.device);

            let (a, p, n) = self.replica.forward(anchor, positive, negative);
            let loss = self.criterion.forward(a, p, n);
            let loss_val = tensor_to_f64(loss.clone());

            let mut loss_sum = [loss_val as f32];
            comm.all_reduce_sum(&mut loss_sum)?;
            if !loss_sum[0].is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    epoch,
                    batch: batch_idx,
                    loss: loss_val,
                }
                .into());
            }

            let grads = self.replica.backward(loss)?;
            self.replica.step(&mut self.optimizer, lr, grads);

            losses.update(loss_val, batch_len);
            pb.inc(1);
            tracing::trace!(epoch, batch = batch_idx, loss = loss_val, "Train step");
        }
        pb.finish_and_clear();

        let avg = losses.average().unwrap_or(f64::NAN);
        tracing::info!(
            epoch,
            rank = comm.rank(),
            train_loss = avg,
            elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
            "Training epoch finished"
        );
        Ok(avg)
    }

    /// One pass over this rank's test partition without autodiff.
    pub fn validate(&self) -> anyhow::Result<ValidationReport> {
        let model = self.replica.valid();
        let pb = self.progress_bar(self.test_loader.num_batches(), "validate".to_string());

        let mut losses = RunningMean::new();
        let mut dist_poses = RunningMean::new();
        let mut dist_neges = RunningMean::new();
        let mut roc = RocAccumulator::new();

        for batch in self.test_loader.iter() {
            let batch = batch?;
            let batch_len = batch.len;
            let (anchor, positive, negative) = batch.into_tensors::<B::InnerBackend>(&self.device);

            let (a, p, n) = model.forward(anchor, positive, negative);
            let dist_pos = pairwise_distance(a.clone(), p);
            let dist_neg = pairwise_distance(a, n);
            let loss = self.criterion.loss_from_distances(dist_pos.clone(), dist_neg.clone());

            let dist_pos = tensor_to_vec(dist_pos)?;
            let dist_neg = tensor_to_vec(dist_neg)?;
            losses.update(tensor_to_f64(loss), batch_len);
            dist_poses.update(mean(&dist_pos), batch_len);
            dist_neges.update(mean(&dist_neg), batch_len);
            roc.extend_distances(&dist_pos, &dist_neg);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let rank = self.rank();
        let empty = || TrainError::EmptyValidation { rank };
        let curve = roc.curve().ok_or_else(empty)?;
        let report = ValidationReport {
            loss: losses.average().ok_or_else(empty)?,
            dist_pos: dist_poses.average().ok_or_else(empty)?,
            dist_neg: dist_neges.average().ok_or_else(empty)?,
            auc: curve.auc(),
            curve,
        };
        tracing::info!(
            rank,
            val_loss = report.loss,
            dist_pos = report.dist_pos,
            dist_neg = report.dist_neg,
            auc = report.auc,
            "Validation finished"
        );
        Ok(report)
    }

    /// Run the remaining epochs, calling `on_epoch` after each one.
    pub fn fit_with<F>(&mut self, mut on_epoch: F) -> anyhow::Result<Vec<EpochReport>>
    where
        F: FnMut(&EpochReport) -> anyhow::Result<()>,
    {
        let mut reports = Vec::new();
        for epoch in self.start_epoch..=self.config.total_epoch {
            self.set_epoch(epoch);
            let train_loss = self.train_epoch(epoch)?;
            let validation = self.validate()?;
            let report = EpochReport {
                epoch,
                train_loss,
                validation,
            };
            if self.is_root() {
                self.write_epoch_outputs(&report)?;
            }
            on_epoch(&report)?;
            reports.push(report);
        }
        self.start_epoch = self.config.total_epoch + 1;
        Ok(reports)
    }

    pub fn fit(&mut self) -> anyhow::Result<Vec<EpochReport>> {
        self.fit_with(|_| Ok(()))
    }

    /// Path of the ROC plot for `epoch`.
    pub fn roc_plot_path(&self, epoch: usize) -> PathBuf {
        PathBuf::from(&self.config.visualization_dir).join(format!("roc_curve_e{epoch}.png"))
    }

    pub fn checkpoint_paths(&self) -> &CheckpointPaths {
        &self.checkpoints
    }

    /// Save checkpoint, optimizer state, metadata and the ROC plot.
    fn write_epoch_outputs(&self, report: &EpochReport) -> anyhow::Result<()> {
        draw_roc_curve(&report.validation.curve, &self.roc_plot_path(report.epoch))?;
        save_checkpoint(
            &self.checkpoints,
            self.replica.module(),
            &self.optimizer,
            &CheckpointMeta {
                epoch: report.epoch,
                train_loss: report.train_loss,
                val_loss: report.validation.loss,
                auc: report.validation.auc,
            },
        )
    }

    fn progress_bar(&self, len: usize, message: String) -> ProgressBar {
        if !self.is_root() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(message);
        pb
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
