//! Name → constructor tables for backbones, aggregation models and datasets.
//!
//! Configuration refers to components by name; every name is resolved here
//! once, when the configuration is loaded, so a typo fails at startup instead
//! of in the middle of a run.

use std::path::Path;

use crate::data::dataset::{ManifestDataset, PlaceFolderDataset};
use crate::data::{DatasetError, DatasetOptions, TripletSource};
use crate::model::backbone::ConvBackboneConfig;
use crate::model::embed::EmbedNetConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown {kind} '{name}' (available: {})", available.join(", "))]
    Unknown {
        kind: &'static str,
        name: String,
        available: Vec<&'static str>,
    },
}

/// A fixed table of named constructors.
pub struct Registry<F: 'static> {
    kind: &'static str,
    entries: &'static [(&'static str, F)],
}

impl<F: Copy + 'static> Registry<F> {
    pub const fn new(kind: &'static str, entries: &'static [(&'static str, F)]) -> Self {
        Self { kind, entries }
    }

    pub fn lookup(&self, name: &str) -> Result<F, RegistryError> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
            .ok_or_else(|| RegistryError::Unknown {
                kind: self.kind,
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(n, _)| *n).collect()
    }
}

/// Hyperparameters of the aggregation head that come from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOptions {
    pub num_clusters: usize,
    pub alpha: f64,
    pub normalize_input: bool,
}

pub type BackboneCtor = fn() -> ConvBackboneConfig;
pub type ModelCtor = fn(ConvBackboneConfig, &AggregationOptions) -> EmbedNetConfig;
pub type DatasetCtor =
    fn(&Path, &DatasetOptions) -> Result<Box<dyn TripletSource>, DatasetError>;

pub static BACKBONES: Registry<BackboneCtor> = Registry::new(
    "backbone",
    &[
        ("alexnet", ConvBackboneConfig::alexnet),
        ("vgg11", ConvBackboneConfig::vgg11),
        ("tiny", ConvBackboneConfig::tiny),
    ],
);

pub static MODELS: Registry<ModelCtor> = Registry::new("model", &[("netvlad", netvlad)]);

pub static DATASETS: Registry<DatasetCtor> = Registry::new(
    "dataset",
    &[("tokyo", place_folder), ("manifest", manifest)],
);

fn netvlad(backbone: ConvBackboneConfig, opts: &AggregationOptions) -> EmbedNetConfig {
    EmbedNetConfig::new(backbone)
        .with_num_clusters(opts.num_clusters)
        .with_alpha(opts.alpha)
        .with_normalize_input(opts.normalize_input)
}

fn place_folder(
    root: &Path,
    opts: &DatasetOptions,
) -> Result<Box<dyn TripletSource>, DatasetError> {
    Ok(Box::new(PlaceFolderDataset::open(root, opts)?))
}

fn manifest(root: &Path, opts: &DatasetOptions) -> Result<Box<dyn TripletSource>, DatasetError> {
    Ok(Box::new(ManifestDataset::open(root, opts)?))
}

/// Resolve the backbone and model names into one network configuration.
pub fn build_embed_config(
    backbone: &str,
    model: &str,
    opts: &AggregationOptions,
) -> Result<EmbedNetConfig, RegistryError> {
    let backbone = BACKBONES.lookup(backbone)?();
    Ok(MODELS.lookup(model)?(backbone, opts))
}
