use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::dataset::{has_extension, list_classes, list_files};
use crate::error::{PipelineError, PipelineResult};

const SAMPLE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledImage {
    pub category: String,
    pub path: PathBuf,
}

/// Picks a random category under `root`, then a random png/jpeg inside it.
pub fn random_image<R: Rng + ?Sized>(root: &Path, rng: &mut R) -> PipelineResult<SampledImage> {
    let categories = list_classes(root)?;
    let category = categories
        .choose(rng)
        .cloned()
        .ok_or_else(|| PipelineError::NoClasses(root.to_path_buf()))?;

    let category_path = root.join(&category);
    let images: Vec<PathBuf> = list_files(&category_path)?
        .into_iter()
        .filter(|p| has_extension(p, SAMPLE_EXTENSIONS))
        .collect();
    let path = images
        .choose(rng)
        .cloned()
        .ok_or(PipelineError::NoSampleImages(category_path))?;
    Ok(SampledImage { category, path })
}
