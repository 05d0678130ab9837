//! Two-phase AlexNet fine-tuning for quantum-dot / DNA-origami TEM images.
//!
//! Phase 1 trains on simulated images, phase 2 swaps the head and trains it
//! alone on real TEM images, and the fine-tuned model then labels a folder
//! of unseen images.

pub mod config;
pub mod dataset;
pub mod error;
pub mod infer;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod train;
pub mod transform;
pub mod weights;

pub use config::PipelineConfig;
pub use dataset::{split_indices, ImageFolder};
pub use error::{PipelineError, PipelineResult};
pub use infer::{ClassIndexMap, Prediction, Predictor};
pub use metrics::{EpochMetrics, MetricsWriter};
pub use model::{Classifier, ModelShape, ParameterCounts, HEAD_PREFIX};
pub use train::{PhaseOutcome, TrainSettings};
pub use transform::Transform;
