use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{ALEXNET_WIDTH, HEAD_PREFIX};

/// Everything the pipeline needs. Defaults reproduce the values the
/// training script was originally run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub device: DeviceChoice,
    pub batch_size: usize,
    /// Width of the two hidden fully-connected layers. Pretrained
    /// torchvision weights need 4096.
    pub classifier_width: i64,
    pub data: DataConfig,
    pub transform: TransformConfig,
    pub pretrain: PretrainConfig,
    pub phase1: PhaseConfig,
    pub phase2: FineTuneConfig,
    pub inference: InferenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            device: DeviceChoice::Auto,
            batch_size: 32,
            classifier_width: ALEXNET_WIDTH,
            data: DataConfig::default(),
            transform: TransformConfig::default(),
            pretrain: PretrainConfig::default(),
            phase1: PhaseConfig::default(),
            phase2: FineTuneConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        toml::from_str(&text).map_err(|source| PipelineError::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    Auto,
    Cpu,
    Cuda,
}

impl DeviceChoice {
    pub fn resolve(self) -> Device {
        match self {
            Self::Auto => Device::cuda_if_available(),
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::Cuda(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory-per-class tree used for phase 1 (and the sampler).
    pub simulation_dir: PathBuf,
    /// Directory-per-class tree used for phase 2.
    pub tem_dir: PathBuf,
    /// Flat directory of unlabeled images.
    pub predict_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            simulation_dir: PathBuf::from("../../simulation"),
            tem_dir: PathBuf::from("../../TEM"),
            predict_dir: PathBuf::from("../../predictTEM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub image_size: u32,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        // ImageNet statistics
        Self {
            image_size: 224,
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    /// Start phase 1 from pretrained weights. Off means random initialisation.
    pub enabled: bool,
    /// torchvision AlexNet weights converted to safetensors.
    pub weights: PathBuf,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: PathBuf::from("../weights/alexnet.safetensors"),
        }
    }
}

impl PretrainConfig {
    /// The weights file to load, if loading is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.enabled.then_some(self.weights.as_path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSettings {
    Sgd { momentum: f64 },
    Adam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerSettings,
    pub train_fraction: f64,
    pub checkpoint: PathBuf,
    pub metrics_csv: Option<PathBuf>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            epochs: 90,
            learning_rate: 0.001,
            optimizer: OptimizerSettings::Sgd { momentum: 0.9 },
            train_fraction: 0.8,
            checkpoint: PathBuf::from("alexnet_trained.safetensors"),
            metrics_csv: Some(PathBuf::from("training_results_v4.csv")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerSettings,
    pub train_fraction: f64,
    pub checkpoint: PathBuf,
    /// Size of the replacement head. `None` uses the fine-tune dataset's class count.
    pub num_classes: Option<i64>,
    /// Parameters whose names start with this prefix stay trainable.
    pub trainable_prefix: String,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            epochs: 90,
            learning_rate: 0.001,
            optimizer: OptimizerSettings::Adam,
            train_fraction: 1.0,
            checkpoint: PathBuf::from("fine_tuned_alexnet.safetensors"),
            num_classes: Some(6),
            trainable_prefix: HEAD_PREFIX.to_string(),
        }
    }
}

impl FineTuneConfig {
    /// The training-loop half of the fine-tune settings. Fine-tuning never
    /// writes a metrics file.
    pub fn phase(&self) -> PhaseConfig {
        PhaseConfig {
            epochs: self.epochs,
            learning_rate: self.learning_rate,
            optimizer: self.optimizer,
            train_fraction: self.train_fraction,
            checkpoint: self.checkpoint.clone(),
            metrics_csv: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// File inside `predict_dir` that gets the full probability report.
    pub probe_image: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            probe_image: Some("unknown02.png".to_string()),
        }
    }
}
