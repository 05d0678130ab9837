use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use tch::Tensor;

use crate::error::{PipelineError, PipelineResult};
use crate::transform::Transform;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp"];

pub(crate) fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| e.eq_ignore_ascii_case(a)))
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(true)
}

/// Sorted names of the immediate subdirectories of `root`.
pub fn list_classes(root: &Path) -> PipelineResult<Vec<String>> {
    let mut classes: Vec<String> = fs::read_dir(root)
        .map_err(|e| PipelineError::io(root, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !is_hidden(p))
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .collect();
    classes.sort();
    Ok(classes)
}

/// Sorted regular files directly inside `dir`.
pub(crate) fn list_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Labeled images laid out as `<root>/<class>/<file>`. Labels are the
/// position of the class directory in sorted order. Nothing is decoded
/// until a sample is requested.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, i64)>,
}

impl ImageFolder {
    pub fn open(root: impl AsRef<Path>) -> PipelineResult<Self> {
        let root = root.as_ref().to_path_buf();
        let classes = list_classes(&root)?;
        if classes.is_empty() {
            return Err(PipelineError::NoClasses(root));
        }

        let mut samples = Vec::new();
        for (class_idx, class_name) in classes.iter().enumerate() {
            let class_dir = root.join(class_name);
            let img_paths: Vec<PathBuf> = list_files(&class_dir)?
                .into_iter()
                .filter(|p| !is_hidden(p) && has_extension(p, IMAGE_EXTENSIONS))
                .collect();
            debug!("class {}: {} ({} images)", class_idx, class_name, img_paths.len());
            // every class owns a label slot, so it must own images too
            if img_paths.is_empty() {
                return Err(PipelineError::EmptyDataset(class_dir));
            }
            samples.extend(img_paths.into_iter().map(|p| (p, class_idx as i64)));
        }

        info!(
            "dataset {:?}: {} images in {} classes {:?}",
            root,
            samples.len(),
            classes.len(),
            classes
        );
        Ok(Self { root, classes, samples })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Path and label of sample `index`, without decoding it.
    pub fn sample(&self, index: usize) -> Option<(&Path, i64)> {
        self.samples.get(index).map(|(p, l)| (p.as_path(), *l))
    }

    pub fn get(&self, index: usize, transform: &Transform) -> PipelineResult<(Tensor, i64)> {
        let (path, label) = self.sample(index).ok_or(PipelineError::SampleOutOfRange {
            index,
            len: self.samples.len(),
        })?;
        Ok((transform.load(path)?, label))
    }

    /// Decodes the listed samples and stacks them into `(N x C x H x W, N)`.
    /// The first failing file aborts the batch.
    pub fn load_batch(&self, indices: &[usize], transform: &Transform) -> PipelineResult<(Tensor, Tensor)> {
        let items: Vec<(Tensor, i64)> = indices
            .par_iter()
            .map(|&i| self.get(i, transform))
            .collect::<PipelineResult<_>>()?;
        let (xs, ys): (Vec<Tensor>, Vec<i64>) = items.into_iter().unzip();
        Ok((Tensor::stack(&xs, 0), Tensor::from_slice(&ys)))
    }
}

/// Shuffled, non-stratified split of `0..n`. The training side gets
/// `floor(train_fraction * n)` indices, validation gets the rest.
pub fn split_indices<R: Rng + ?Sized>(n: usize, train_fraction: f64, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let fraction = train_fraction.clamp(0.0, 1.0);
    let train_size = ((fraction * n as f64).floor() as usize).min(n);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let val = indices.split_off(train_size);
    (indices, val)
}
