//! Image decoding and preprocessing.
//!
//! Every image goes through `decode → RGB8 → resize → [flip] → CHW f32`,
//! normalized with the ImageNet channel statistics the backbones expect.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;

use crate::data::DatasetError;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize target plus train-time augmentation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTransform {
    pub width: u32,
    pub height: u32,
    /// Probability of a horizontal flip; 0 disables augmentation.
    pub flip_prob: f64,
}

impl ImageTransform {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            flip_prob: 0.0,
        }
    }

    pub fn with_flip_prob(mut self, flip_prob: f64) -> Self {
        self.flip_prob = flip_prob;
        self
    }

    /// Shape of one preprocessed image.
    pub fn chw(&self) -> [usize; 3] {
        [3, self.height as usize, self.width as usize]
    }

    /// Number of f32 values per preprocessed image.
    pub fn numel(&self) -> usize {
        3 * self.height as usize * self.width as usize
    }

    /// Load one image, drawing the flip decision from `rng`.
    pub fn load<R: Rng>(&self, path: &Path, rng: &mut R) -> Result<Vec<f32>, DatasetError> {
        let flip = self.flip_prob > 0.0 && rng.gen_bool(self.flip_prob.min(1.0));
        let img = image::open(path)
            .map_err(|source| DatasetError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        Ok(self.apply(&img, flip))
    }

    /// Resize, optionally flip, and normalize into CHW order.
    pub fn apply(&self, img: &RgbImage, flip: bool) -> Vec<f32> {
        let resized = if img.dimensions() == (self.width, self.height) {
            img.clone()
        } else {
            imageops::resize(img, self.width, self.height, FilterType::Triangle)
        };
        let resized = if flip {
            imageops::flip_horizontal(&resized)
        } else {
            resized
        };

        let mut out = Vec::with_capacity(self.numel());
        for c in 0..3 {
            for y in 0..self.height {
                for x in 0..self.width {
                    let v = resized.get_pixel(x, y)[c] as f32 / 255.0;
                    out.push((v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
                }
            }
        }
        out
    }
}
