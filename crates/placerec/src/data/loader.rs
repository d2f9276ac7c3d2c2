//! Batched triplet loading.
//!
//! The loader walks this rank's sampler partition in fixed-size batches
//! (the last one may be short) and decodes each batch's images on a rayon
//! pool. Augmentation randomness is seeded per sample from
//! `(seed, epoch, index)`, so a batch is the same no matter which worker
//! thread decoded which image.

use std::sync::Arc;

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::data::sampler::DistributedSampler;
use crate::data::transform::ImageTransform;
use crate::data::{DatasetError, TripletSource};
use crate::model::bridge::images_to_tensor;

/// One decoded batch; each buffer holds `len` CHW images back to back.
#[derive(Debug, Clone)]
pub struct TripletBatch {
    pub anchor: Vec<f32>,
    pub positive: Vec<f32>,
    pub negative: Vec<f32>,
    pub len: usize,
    pub chw: [usize; 3],
}

impl TripletBatch {
    /// Move the three image buffers onto `device` as `(len, C, H, W)` tensors.
    pub fn into_tensors<B: Backend>(
        self,
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        (
            images_to_tensor(self.anchor, self.len, self.chw, device),
            images_to_tensor(self.positive, self.len, self.chw, device),
            images_to_tensor(self.negative, self.len, self.chw, device),
        )
    }
}

pub struct TripletLoader {
    source: Arc<dyn TripletSource>,
    sampler: DistributedSampler,
    transform: ImageTransform,
    batch_size: usize,
    seed: u64,
    pool: Option<rayon::ThreadPool>,
}

impl TripletLoader {
    /// `num_workers == 0` decodes on the calling thread.
    pub fn new(
        source: Arc<dyn TripletSource>,
        sampler: DistributedSampler,
        transform: ImageTransform,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("triplet-loader-{i}"))
                    .build()
                    .map_err(|e| anyhow::anyhow!("failed to build loader thread pool: {e}"))?,
            )
        } else {
            None
        };
        Ok(Self {
            source,
            sampler,
            transform,
            batch_size,
            seed,
            pool,
        })
    }

    /// Forward the epoch to the sampler; see [`DistributedSampler::set_epoch`].
    pub fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Samples this rank visits per epoch.
    pub fn num_samples(&self) -> usize {
        self.sampler.num_samples()
    }

    /// Batches per epoch: `ceil(num_samples / batch_size)`.
    pub fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    /// Iterate the current epoch's batches in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<TripletBatch, DatasetError>> + '_ {
        let indices = self.sampler.indices();
        let batches: Vec<Vec<usize>> = indices
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        batches.into_iter().map(move |batch| self.load_batch(&batch))
    }

    fn load_batch(&self, indices: &[usize]) -> Result<TripletBatch, DatasetError> {
        let samples: Vec<[Vec<f32>; 3]> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| self.load_sample(i))
                    .collect::<Result<_, _>>()
            })?,
            None => indices
                .iter()
                .map(|&i| self.load_sample(i))
                .collect::<Result<_, _>>()?,
        };

        let numel = self.transform.numel() * samples.len();
        let mut batch = TripletBatch {
            anchor: Vec::with_capacity(numel),
            positive: Vec::with_capacity(numel),
            negative: Vec::with_capacity(numel),
            len: samples.len(),
            chw: self.transform.chw(),
        };
        for [a, p, n] in samples {
            batch.anchor.extend(a);
            batch.positive.extend(p);
            batch.negative.extend(n);
        }
        Ok(batch)
    }

    fn load_sample(&self, index: usize) -> Result<[Vec<f32>; 3], DatasetError> {
        let paths = self.source.get(index)?;
        let mut rng = StdRng::seed_from_u64(sample_seed(self.seed, self.sampler.epoch(), index));
        Ok([
            self.transform.load(&paths.anchor, &mut rng)?,
            self.transform.load(&paths.positive, &mut rng)?,
            self.transform.load(&paths.negative, &mut rng)?,
        ])
    }
}

fn sample_seed(seed: u64, epoch: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ epoch.rotate_left(32)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TripletPaths;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    struct FixedSource {
        images: Vec<PathBuf>,
    }

    impl TripletSource for FixedSource {
        fn len(&self) -> usize {
            self.images.len()
        }

        fn get(&self, index: usize) -> Result<TripletPaths, DatasetError> {
            let next = &self.images[(index + 1) % self.images.len()];
            Ok(TripletPaths {
                anchor: self.images[index].clone(),
                positive: next.clone(),
                negative: next.clone(),
            })
        }
    }

    fn source_with_images(dir: &std::path::Path, count: usize) -> Arc<dyn TripletSource> {
        let images = (0..count)
            .map(|i| {
                let path = dir.join(format!("{i}.png"));
                let img = RgbImage::from_fn(6, 4, |x, _| Rgb([(i * 20) as u8, (x * 40) as u8, 7]));
                img.save(&path).unwrap();
                path
            })
            .collect();
        Arc::new(FixedSource { images })
    }

    #[test]
    fn test_batch_count_and_partial_last_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source_with_images(tmp.path(), 7);
        let sampler = DistributedSampler::new(7, 1, 0);
        let loader =
            TripletLoader::new(source, sampler, ImageTransform::new(4, 4), 3, 0, 1).unwrap();

        assert_eq!(loader.num_batches(), 3);
        let lens: Vec<usize> = loader.iter().map(|b| b.unwrap().len).collect();
        assert_eq!(lens, vec![3, 3, 1]);
    }

    #[test]
    fn test_batch_count_follows_partition_size() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source_with_images(tmp.path(), 5);
        // 5 samples over 2 ranks -> 3 per rank -> 2 batches of size 2
        for rank in 0..2 {
            let sampler = DistributedSampler::new(5, 2, rank);
            let loader = TripletLoader::new(
                source.clone(),
                sampler,
                ImageTransform::new(4, 4),
                2,
                0,
                1,
            )
            .unwrap();
            assert_eq!(loader.num_batches(), 2);
            assert_eq!(loader.iter().count(), 2);
        }
    }

    #[test]
    fn test_worker_pool_matches_inline_loading() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source_with_images(tmp.path(), 6);
        let transform = ImageTransform::new(4, 4).with_flip_prob(0.5);
        let make = |workers| {
            let mut loader = TripletLoader::new(
                source.clone(),
                DistributedSampler::new(6, 1, 0).with_seed(3),
                transform,
                4,
                workers,
                9,
            )
            .unwrap();
            loader.set_epoch(2);
            loader
                .iter()
                .map(|b| b.unwrap().anchor)
                .collect::<Vec<_>>()
        };
        assert_eq!(make(0), make(3));
    }

    #[test]
    fn test_into_tensors_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let source = source_with_images(tmp.path(), 2);
        let loader = TripletLoader::new(
            source,
            DistributedSampler::new(2, 1, 0),
            ImageTransform::new(5, 3),
            2,
            0,
            0,
        )
        .unwrap();
        let batch = loader.iter().next().unwrap().unwrap();
        let (a, p, n) = batch.into_tensors::<burn::backend::NdArray<f32>>(&Default::default());
        assert_eq!(a.dims(), [2, 3, 3, 5]);
        assert_eq!(p.dims(), n.dims());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let source: Arc<dyn TripletSource> = Arc::new(FixedSource { images: vec![] });
        assert!(TripletLoader::new(
            source,
            DistributedSampler::new(0, 1, 0),
            ImageTransform::new(4, 4),
            0,
            0,
            0
        )
        .is_err());
    }
}
