use std::fmt;
use std::path::Path;

use log::info;
use tch::{nn, nn::ModuleT, Device, Tensor};

use crate::error::{PipelineError, PipelineResult};
use crate::weights;

/// Variable-name prefix of the final classification layer.
pub const HEAD_PREFIX: &str = "classifier.6.";

/// Hidden width of the torchvision AlexNet classifier.
pub const ALEXNET_WIDTH: i64 = 4096;

const FEATURE_CHANNELS: i64 = 256;
const POOLED: i64 = 6;

/// Explicit shape of one classifier instance. Checkpoints only load into a
/// model whose shape matches the one they were saved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub input_channels: i64,
    pub num_classes: i64,
    pub classifier_width: i64,
}

impl ModelShape {
    pub fn new(input_channels: i64, num_classes: i64) -> Self {
        Self {
            input_channels,
            num_classes,
            classifier_width: ALEXNET_WIDTH,
        }
    }

    pub fn with_num_classes(self, num_classes: i64) -> Self {
        Self { num_classes, ..self }
    }
}

fn max_pool(x: &Tensor) -> Tensor {
    x.max_pool2d([3, 3], [2, 2], [0, 0], [1, 1], false)
}

// names mirror torchvision: features.{0,3,6,8,10}
fn alexnet_features(vs: &nn::Path, in_c: i64) -> nn::SequentialT {
    let conv = |stride, padding| nn::ConvConfig { stride, padding, ..Default::default() };
    nn::seq_t()
        .add(nn::conv2d(vs / "0", in_c, 64, 11, conv(4, 2)))
        .add_fn(|x| x.relu())
        .add_fn(max_pool)
        .add(nn::conv2d(vs / "3", 64, 192, 5, conv(1, 2)))
        .add_fn(|x| x.relu())
        .add_fn(max_pool)
        .add(nn::conv2d(vs / "6", 192, 384, 3, conv(1, 1)))
        .add_fn(|x| x.relu())
        .add(nn::conv2d(vs / "8", 384, 256, 3, conv(1, 1)))
        .add_fn(|x| x.relu())
        .add(nn::conv2d(vs / "10", 256, FEATURE_CHANNELS, 3, conv(1, 1)))
        .add_fn(|x| x.relu())
        .add_fn(max_pool)
        .add_fn(|x| x.adaptive_avg_pool2d([POOLED, POOLED]))
        .add_fn(|x| x.flatten(1, -1))
}

// classifier.{1,4} are the hidden layers, classifier.6 is the head
fn alexnet_classifier(vs: &nn::Path, width: i64, num_classes: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn_t(|x, train| x.dropout(0.5, train))
        .add(nn::linear(vs / "1", FEATURE_CHANNELS * POOLED * POOLED, width, Default::default()))
        .add_fn(|x| x.relu())
        .add_fn_t(|x, train| x.dropout(0.5, train))
        .add(nn::linear(vs / "4", width, width, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(vs / "6", width, num_classes, Default::default()))
}

#[derive(Debug)]
struct AlexNet {
    features: nn::SequentialT,
    classifier: nn::SequentialT,
}

impl nn::ModuleT for AlexNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let f = self.features.forward_t(xs, train);
        self.classifier.forward_t(&f, train)
    }
}

/// AlexNet together with the variable store that owns its parameters.
pub struct Classifier {
    vs: nn::VarStore,
    net: AlexNet,
    shape: ModelShape,
}

impl Classifier {
    pub fn new(shape: ModelShape, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let features = alexnet_features(&root.sub("features"), shape.input_channels);
        let classifier = alexnet_classifier(&root.sub("classifier"), shape.classifier_width, shape.num_classes);
        Self {
            vs,
            net: AlexNet { features, classifier },
            shape,
        }
    }

    /// Builds a model of `shape` and fills it from a checkpoint written by
    /// [`Classifier::save`].
    pub fn from_checkpoint(shape: ModelShape, device: Device, path: &Path) -> PipelineResult<Self> {
        let mut model = Self::new(shape, device);
        weights::load_checkpoint(&mut model.vs, path)?;
        Ok(model)
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        weights::save_checkpoint(&self.vs, path)
    }

    pub fn load_pretrained(&mut self, path: &Path) -> PipelineResult<usize> {
        weights::load_pretrained(&mut self.vs, path)
    }

    /// Returns a new model with a freshly initialised head of `num_classes`
    /// outputs; every other parameter is copied from `self`.
    pub fn with_new_head(&self, num_classes: i64) -> PipelineResult<Self> {
        let shape = self.shape.with_num_classes(num_classes);
        let mut next = Self::new(shape, self.device());
        let copied = weights::copy_matching(&self.vs, &mut next.vs, |name| !name.starts_with(HEAD_PREFIX))?;
        info!("replaced head: {} -> {} classes ({} tensors carried over)", self.shape.num_classes, num_classes, copied);
        Ok(next)
    }

    /// Disables gradients for every parameter whose name does not start
    /// with `trainable_prefix`. Returns the number of frozen tensors.
    pub fn freeze_except(&self, trainable_prefix: &str) -> usize {
        let mut frozen = 0usize;
        for (name, var) in self.vs.variables().iter() {
            if !name.starts_with(trainable_prefix) {
                var.set_requires_grad(false);
                frozen += 1;
            }
        }
        frozen
    }

    pub fn parameter_counts(&self) -> ParameterCounts {
        let mut counts = ParameterCounts::default();
        for var in self.vs.variables().values() {
            let n = var.size().iter().product::<i64>();
            counts.total += n;
            if var.requires_grad() {
                counts.trainable += n;
            }
        }
        counts
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("shape", &self.shape)
            .field("device", &self.device())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterCounts {
    pub total: i64,
    pub trainable: i64,
}

impl ParameterCounts {
    /// Size assuming 32-bit floats.
    pub fn size_mb(&self) -> f64 {
        (self.total * 4) as f64 / (1024.0 * 1024.0)
    }
}

pub(crate) fn ensure_head_fits(num_classes: usize, head: i64) -> PipelineResult<()> {
    if num_classes as i64 > head {
        return Err(PipelineError::TooManyClasses { found: num_classes, head });
    }
    Ok(())
}
