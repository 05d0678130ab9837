use std::path::PathBuf;

use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no class directories found under {0:?}")]
    NoClasses(PathBuf),

    #[error("no images found under {0:?}")]
    EmptyDataset(PathBuf),

    #[error("sample index {index} out of range for {len} samples")]
    SampleOutOfRange { index: usize, len: usize },

    #[error("no matching image files under {0:?}")]
    NoSampleImages(PathBuf),

    #[error("checkpoint {path:?} has no tensor named '{name}'")]
    MissingTensor { path: PathBuf, name: String },

    #[error("checkpoint {path:?}: tensor '{name}' has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("no tensors copied from pretrained weights {0:?}")]
    NothingCopied(PathBuf),

    #[error("dataset has {found} classes but the model head only has {head}")]
    TooManyClasses { found: usize, head: i64 },

    #[error("predicted class index {0} has no entry in the class map")]
    UnmappedClass(i64),

    #[error("unsupported channel count {0}, expected 1 or 3")]
    UnsupportedChannels(usize),

    #[error("invalid config {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
