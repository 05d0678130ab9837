use std::path::Path;

use image::{imageops, DynamicImage};
use tch::{Kind, Tensor};

use crate::config::TransformConfig;
use crate::error::{PipelineError, PipelineResult};

/// Fixed preprocessing shared by training and inference: exact resize,
/// scale to `[0, 1]`, per-channel `(x - mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    size: u32,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Transform {
    pub fn new(size: u32, mean: Vec<f32>, std: Vec<f32>) -> PipelineResult<Self> {
        let channels = mean.len();
        if !(channels == 1 || channels == 3) || std.len() != channels {
            return Err(PipelineError::UnsupportedChannels(channels.max(std.len())));
        }
        Ok(Self { size, mean, std })
    }

    pub fn from_config(cfg: &TransformConfig) -> PipelineResult<Self> {
        Self::new(cfg.image_size, cfg.mean.clone(), cfg.std.clone())
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn load(&self, path: &Path) -> PipelineResult<Tensor> {
        let img = image::open(path).map_err(|source| PipelineError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.apply(&img))
    }

    /// Returns a `C x size x size` float tensor.
    pub fn apply(&self, img: &DynamicImage) -> Tensor {
        let img = img.resize_exact(self.size, self.size, imageops::FilterType::Triangle);
        let c = self.channels() as i64;
        let raw = if c == 1 {
            img.to_luma8().into_raw()
        } else {
            img.to_rgb8().into_raw()
        };
        let tensor = Tensor::from_slice(&raw)
            .reshape([self.size as i64, self.size as i64, c])
            .permute([2, 0, 1])
            .to_kind(Kind::Float);
        self.normalize(tensor / 255.0)
    }

    fn normalize(&self, tensor: Tensor) -> Tensor {
        let c = self.channels() as i64;
        let mean = Tensor::from_slice(&self.mean).view([c, 1, 1]);
        let std = Tensor::from_slice(&self.std).view([c, 1, 1]);
        (tensor - mean) / std
    }
}

impl Default for Transform {
    fn default() -> Self {
        let cfg = TransformConfig::default();
        Self {
            size: cfg.image_size,
            mean: cfg.mean,
            std: cfg.std,
        }
    }
}
