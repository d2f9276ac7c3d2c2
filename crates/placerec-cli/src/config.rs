//! TOML config loading for the training CLI.
//!
//! Deserializes `configs/*.toml` which has `[data]`, `[model]`, `[train]`,
//! `[paths]` and `[distributed]` sections, merges CLI overrides on top and
//! resolves registry names into constructors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use placerec::data::DatasetOptions;
use placerec::registry::{build_embed_config, AggregationOptions, DatasetCtor, DATASETS};
use placerec::training::trainer::{SessionData, TrainingConfig};
use placerec::EmbedNetConfig;
use serde::{Deserialize, Serialize};

/// Top-level structure matching `configs/tokyo.toml`. Missing sections and
/// fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentToml {
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub train: TrainSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub distributed: DistributedSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DataSection {
    /// Dataset registry name.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_train_data_path")]
    pub train_data_path: PathBuf,
    #[serde(default = "default_test_data_path")]
    pub test_data_path: PathBuf,
    #[serde(default = "default_image_side")]
    pub image_height: u32,
    #[serde(default = "default_image_side")]
    pub image_width: u32,
    /// Horizontal flip probability for training images.
    #[serde(default = "default_flip_prob")]
    pub flip_prob: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    /// Backbone registry name.
    #[serde(default = "default_backbone")]
    pub backbone: String,
    /// Aggregation model registry name.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_num_clusters")]
    pub num_clusters: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_true")]
    pub normalize_input: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrainSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_total_epoch")]
    pub total_epoch: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Continue after this saved epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_epoch: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_visualization_dir")]
    pub visualization_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DistributedSection {
    /// Device id for each rank, indexed by rank.
    #[serde(default = "default_gpu_ids")]
    pub gpu_ids: Vec<usize>,
    /// How long ranks wait for the rendezvous with rank 0.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_dataset() -> String {
    "tokyo".to_string()
}
fn default_train_data_path() -> PathBuf {
    PathBuf::from("data/tokyo/train")
}
fn default_test_data_path() -> PathBuf {
    PathBuf::from("data/tokyo/test")
}
fn default_image_side() -> u32 {
    224
}
fn default_flip_prob() -> f64 {
    0.5
}
fn default_backbone() -> String {
    "alexnet".to_string()
}
fn default_model() -> String {
    "netvlad".to_string()
}
fn default_num_clusters() -> usize {
    21
}
fn default_alpha() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    8
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_margin() -> f64 {
    0.1
}
fn default_total_epoch() -> usize {
    10
}
fn default_seed() -> u64 {
    42
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_visualization_dir() -> PathBuf {
    PathBuf::from("visualizations")
}
fn default_gpu_ids() -> Vec<usize> {
    vec![0]
}
fn default_connect_timeout_secs() -> u64 {
    60
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            train_data_path: default_train_data_path(),
            test_data_path: default_test_data_path(),
            image_height: default_image_side(),
            image_width: default_image_side(),
            flip_prob: default_flip_prob(),
        }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            backbone: default_backbone(),
            model: default_model(),
            num_clusters: default_num_clusters(),
            alpha: default_alpha(),
            normalize_input: default_true(),
        }
    }
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_workers: 0,
            learning_rate: default_learning_rate(),
            margin: default_margin(),
            total_epoch: default_total_epoch(),
            seed: default_seed(),
            resume_epoch: None,
        }
    }
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            visualization_dir: default_visualization_dir(),
        }
    }
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            gpu_ids: default_gpu_ids(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Load and deserialize an `ExperimentToml` from a TOML file.
pub fn load_experiment_toml(path: &Path) -> anyhow::Result<ExperimentToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: ExperimentToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded experiment config");
    Ok(config)
}

/// Command-line values that replace the corresponding TOML fields.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CliOverrides {
    pub train_data_path: Option<PathBuf>,
    pub test_data_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub num_workers: Option<usize>,
    pub learning_rate: Option<f64>,
    pub total_epoch: Option<usize>,
    pub seed: Option<u64>,
    pub resume_epoch: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
    pub visualization_dir: Option<PathBuf>,
    pub gpu_ids: Option<Vec<usize>>,
}

impl CliOverrides {
    /// Priority chain: serde defaults < TOML values < CLI flags.
    pub fn apply(&self, config: &mut ExperimentToml) {
        if let Some(p) = &self.train_data_path {
            config.data.train_data_path = p.clone();
        }
        if let Some(p) = &self.test_data_path {
            config.data.test_data_path = p.clone();
        }
        if let Some(n) = self.batch_size {
            config.train.batch_size = n;
        }
        if let Some(n) = self.num_workers {
            config.train.num_workers = n;
        }
        if let Some(lr) = self.learning_rate {
            config.train.learning_rate = lr;
        }
        if let Some(n) = self.total_epoch {
            config.train.total_epoch = n;
        }
        if let Some(seed) = self.seed {
            config.train.seed = seed;
        }
        if let Some(e) = self.resume_epoch {
            config.train.resume_epoch = Some(e);
        }
        if let Some(p) = &self.checkpoint_dir {
            config.paths.checkpoint_dir = p.clone();
        }
        if let Some(p) = &self.visualization_dir {
            config.paths.visualization_dir = p.clone();
        }
        if let Some(ids) = &self.gpu_ids {
            config.distributed.gpu_ids = ids.clone();
        }
    }
}

/// A validated experiment with every registry name resolved.
///
/// Read-only once built; ranks share it through an `Arc`.
pub struct Experiment {
    pub toml: ExperimentToml,
    pub embed: EmbedNetConfig,
    dataset: DatasetCtor,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("toml", &self.toml)
            .field("embedding_dim", &self.embed.embedding_dim())
            .finish_non_exhaustive()
    }
}

impl Experiment {
    pub fn resolve(toml: ExperimentToml) -> anyhow::Result<Self> {
        validate(&toml)?;
        let dataset = DATASETS.lookup(&toml.data.dataset)?;
        let opts = AggregationOptions {
            num_clusters: toml.model.num_clusters,
            alpha: toml.model.alpha,
            normalize_input: toml.model.normalize_input,
        };
        let embed = build_embed_config(&toml.model.backbone, &toml.model.model, &opts)?;
        tracing::debug!(
            dataset = %toml.data.dataset,
            backbone = %toml.model.backbone,
            model = %toml.model.model,
            embedding_dim = embed.embedding_dim(),
            "Experiment resolved"
        );
        Ok(Self {
            toml,
            embed,
            dataset,
        })
    }

    pub fn training_config(&self) -> TrainingConfig {
        let t = &self.toml.train;
        TrainingConfig::new()
            .with_learning_rate(t.learning_rate)
            .with_margin(t.margin)
            .with_total_epoch(t.total_epoch)
            .with_batch_size(t.batch_size)
            .with_num_workers(t.num_workers)
            .with_seed(t.seed)
            .with_backbone(self.toml.model.backbone.clone())
            .with_model(self.toml.model.model.clone())
            .with_checkpoint_dir(self.toml.paths.checkpoint_dir.display().to_string())
            .with_visualization_dir(self.toml.paths.visualization_dir.display().to_string())
            .with_resume_epoch(t.resume_epoch)
    }

    /// Open the train and test datasets through the dataset registry.
    pub fn open_data(&self) -> anyhow::Result<SessionData> {
        let data = &self.toml.data;
        let opts = DatasetOptions {
            seed: self.toml.train.seed,
        };
        let train = (self.dataset)(&data.train_data_path, &opts)?;
        let test = (self.dataset)(&data.test_data_path, &opts)?;
        tracing::info!(
            dataset = %data.dataset,
            train = train.len(),
            test = test.len(),
            "Datasets opened"
        );
        Ok(SessionData {
            train: Arc::from(train),
            test: Arc::from(test),
            image_width: data.image_width,
            image_height: data.image_height,
            flip_prob: data.flip_prob,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.distributed.connect_timeout_secs)
    }

    pub fn gpu_ids(&self) -> &[usize] {
        &self.toml.distributed.gpu_ids
    }
}

fn validate(toml: &ExperimentToml) -> anyhow::Result<()> {
    anyhow::ensure!(toml.train.batch_size > 0, "train.batch_size must be at least 1");
    anyhow::ensure!(toml.train.total_epoch > 0, "train.total_epoch must be at least 1");
    anyhow::ensure!(
        toml.train.learning_rate > 0.0 && toml.train.learning_rate.is_finite(),
        "train.learning_rate must be positive, got {}",
        toml.train.learning_rate
    );
    anyhow::ensure!(
        toml.data.image_width > 0 && toml.data.image_height > 0,
        "data.image_width and data.image_height must be positive"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&toml.data.flip_prob),
        "data.flip_prob must lie in [0, 1], got {}",
        toml.data.flip_prob
    );
    anyhow::ensure!(toml.model.num_clusters > 0, "model.num_clusters must be at least 1");
    anyhow::ensure!(!toml.distributed.gpu_ids.is_empty(), "distributed.gpu_ids is empty");
    Ok(())
}
