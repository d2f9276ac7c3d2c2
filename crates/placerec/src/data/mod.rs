//! Triplet data pipeline.
//!
//! A [`TripletSource`] is a finite, indexable collection of
//! (anchor, positive, negative) image paths. A [`sampler::DistributedSampler`]
//! picks the indices this rank sees each epoch, and a
//! [`loader::TripletLoader`] decodes them into batches.

use std::path::PathBuf;

pub mod dataset;
pub mod loader;
pub mod sampler;
pub mod transform;

/// Image paths of one training triple.
///
/// `anchor` and `positive` show the same place; `negative` shows a different one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripletPaths {
    pub anchor: PathBuf,
    pub positive: PathBuf,
    pub negative: PathBuf,
}

/// Options shared by every dataset constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOptions {
    /// Seed for negative mining; fixed so every rank builds the same triples.
    pub seed: u64,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

pub trait TripletSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<TripletPaths, DatasetError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{path}:{line}: {message}")]
    Manifest {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("{root} has {found} place folder(s); at least 2 are needed to mine negatives")]
    TooFewPlaces { root: PathBuf, found: usize },
    #[error("no place under {root} has two images to form an anchor/positive pair")]
    NoPositivePairs { root: PathBuf },
    #[error("{path} contains no triplets")]
    Empty { path: PathBuf },
    #[error("index {index} out of range for dataset of {len} triplets")]
    IndexOutOfRange { index: usize, len: usize },
}
