//! Per-epoch checkpoints: model weights, optimizer state and a JSON summary.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;

use crate::model::embed::TripletNet;

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub auc: f64,
}

/// File names of one run's checkpoints:
/// `{dir}/{backbone}_{model}_{checkpoint|optimizer|meta}_e{epoch}.{mpk|json}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    dir: PathBuf,
    prefix: String,
}

impl CheckpointPaths {
    pub fn new(dir: impl Into<PathBuf>, backbone: &str, model: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!("{backbone}_{model}"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("{}_checkpoint_e{epoch}.mpk", self.prefix))
    }

    pub fn optimizer(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("{}_optimizer_e{epoch}.mpk", self.prefix))
    }

    pub fn meta(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_meta_e{epoch}.json", self.prefix))
    }
}

/// Write model, optimizer and metadata for `meta.epoch`.
pub fn save_checkpoint<B, O>(
    paths: &CheckpointPaths,
    model: &TripletNet<B>,
    optimizer: &O,
    meta: &CheckpointMeta,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<TripletNet<B>, B>,
{
    let epoch = meta.epoch;
    std::fs::create_dir_all(paths.dir()).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create checkpoint dir {}: {e}",
            paths.dir().display()
        )
    })?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    model
        .clone()
        .save_file(paths.model(epoch), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save model at epoch {epoch}: {e}"))?;

    recorder
        .record(optimizer.to_record(), paths.optimizer(epoch))
        .map_err(|e| anyhow::anyhow!("Failed to save optimizer at epoch {epoch}: {e}"))?;

    let meta_path = paths.meta(epoch);
    serde_json::to_writer_pretty(
        std::fs::File::create(&meta_path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", meta_path.display()))?,
        meta,
    )?;

    tracing::info!(
        epoch,
        path = %paths.model(epoch).display(),
        "Checkpoint saved (model + optimizer + meta)"
    );
    Ok(())
}

/// Load the state saved for `epoch` on top of `model` and `optimizer`.
pub fn load_checkpoint<B, O>(
    paths: &CheckpointPaths,
    epoch: usize,
    model: TripletNet<B>,
    optimizer: O,
    device: &B::Device,
) -> anyhow::Result<(TripletNet<B>, O, CheckpointMeta)>
where
    B: AutodiffBackend,
    O: Optimizer<TripletNet<B>, B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    let model_path = paths.model(epoch);
    let model = model
        .load_file(model_path.clone(), &recorder, device)
        .map_err(|e| {
            anyhow::anyhow!("Failed to load checkpoint from {}: {e}", model_path.display())
        })?;

    let optim_path = paths.optimizer(epoch);
    let optim_record = recorder
        .load(optim_path.clone(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load optimizer from {}: {e}", optim_path.display()))?;
    let optimizer = optimizer.load_record(optim_record);

    let meta_path = paths.meta(epoch);
    let meta: CheckpointMeta = serde_json::from_reader(
        std::fs::File::open(&meta_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;

    tracing::info!(epoch, "Restored model, optimizer and metadata");
    Ok((model, optimizer, meta))
}
