//! On-disk triplet datasets.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::data::{DatasetError, DatasetOptions, TripletPaths, TripletSource};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Places stored as `root/<place_id>/<image>` (the Tokyo layout).
///
/// Triples are mined once at construction: every image of a place with at
/// least two images is an anchor, its positive is the next image of the same
/// place (wrapping around), and its negative is a seeded random image of a
/// different place. The same seed yields the same triples on every rank.
#[derive(Debug)]
pub struct PlaceFolderDataset {
    triplets: Vec<TripletPaths>,
    num_places: usize,
}

impl PlaceFolderDataset {
    pub fn open(root: &Path, opts: &DatasetOptions) -> Result<Self, DatasetError> {
        let places = scan_places(root)?;
        if places.len() < 2 {
            return Err(DatasetError::TooFewPlaces {
                root: root.to_path_buf(),
                found: places.len(),
            });
        }

        let place_list: Vec<&Vec<PathBuf>> = places.values().collect();
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let mut triplets = Vec::new();
        for (p, images) in place_list.iter().enumerate() {
            if images.len() < 2 {
                continue;
            }
            for (i, anchor) in images.iter().enumerate() {
                let positive = &images[(i + 1) % images.len()];
                // uniform over the other places
                let mut q = rng.gen_range(0..place_list.len() - 1);
                if q >= p {
                    q += 1;
                }
                let others = place_list[q];
                let negative = &others[rng.gen_range(0..others.len())];
                triplets.push(TripletPaths {
                    anchor: anchor.clone(),
                    positive: positive.clone(),
                    negative: negative.clone(),
                });
            }
        }

        if triplets.is_empty() {
            return Err(DatasetError::NoPositivePairs {
                root: root.to_path_buf(),
            });
        }

        tracing::info!(
            root = %root.display(),
            places = places.len(),
            triplets = triplets.len(),
            "Indexed place folder dataset"
        );
        Ok(Self {
            triplets,
            num_places: places.len(),
        })
    }

    pub fn num_places(&self) -> usize {
        self.num_places
    }
}

impl TripletSource for PlaceFolderDataset {
    fn len(&self) -> usize {
        self.triplets.len()
    }

    fn get(&self, index: usize) -> Result<TripletPaths, DatasetError> {
        self.triplets
            .get(index)
            .cloned()
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.triplets.len(),
            })
    }
}

/// Sorted image paths per place directory; places without images are skipped.
fn scan_places(root: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>, DatasetError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DatasetError::Io { path, source }
    };

    let mut places = BTreeMap::new();
    for entry in std::fs::read_dir(root).map_err(io_err(root))? {
        let dir = entry.map_err(io_err(root))?.path();
        if !dir.is_dir() {
            continue;
        }
        let mut images = Vec::new();
        for file in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = file.map_err(io_err(&dir))?.path();
            if is_image(&path) {
                images.push(path);
            }
        }
        if images.is_empty() {
            tracing::debug!(place = %dir.display(), "Skipping place without images");
            continue;
        }
        images.sort();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        places.insert(name, images);
    }
    Ok(places)
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// File name of the manifest inside a [`ManifestDataset`] root.
pub const MANIFEST_FILE: &str = "triplets.jsonl";

#[derive(Debug, Deserialize)]
struct ManifestLine {
    anchor: PathBuf,
    positive: PathBuf,
    negative: PathBuf,
}

/// Explicit triples listed in `root/triplets.jsonl`, one JSON object per line
/// with `anchor`, `positive` and `negative` paths relative to `root`.
#[derive(Debug)]
pub struct ManifestDataset {
    triplets: Vec<TripletPaths>,
}

impl ManifestDataset {
    pub fn open(root: &Path, _opts: &DatasetOptions) -> Result<Self, DatasetError> {
        let path = root.join(MANIFEST_FILE);
        let file = std::fs::File::open(&path).map_err(|source| DatasetError::Io {
            path: path.clone(),
            source,
        })?;

        let mut triplets = Vec::new();
        for (i, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| DatasetError::Io {
                path: path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ManifestLine =
                serde_json::from_str(&line).map_err(|e| DatasetError::Manifest {
                    path: path.clone(),
                    line: i + 1,
                    message: e.to_string(),
                })?;
            triplets.push(TripletPaths {
                anchor: root.join(entry.anchor),
                positive: root.join(entry.positive),
                negative: root.join(entry.negative),
            });
        }

        if triplets.is_empty() {
            return Err(DatasetError::Empty { path });
        }
        tracing::info!(manifest = %path.display(), triplets = triplets.len(), "Loaded triplet manifest");
        Ok(Self { triplets })
    }
}

impl TripletSource for ManifestDataset {
    fn len(&self) -> usize {
        self.triplets.len()
    }

    fn get(&self, index: usize) -> Result<TripletPaths, DatasetError> {
        self.triplets
            .get(index)
            .cloned()
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.triplets.len(),
            })
    }
}
