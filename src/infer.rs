use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use log::debug;
use tch::{Kind, Tensor};

use crate::dataset::list_files;
use crate::error::{PipelineError, PipelineResult};
use crate::model::Classifier;
use crate::transform::Transform;

/// Prediction index -> human readable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndexMap(BTreeMap<i64, String>);

impl ClassIndexMap {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|(i, s)| (i, s.into())).collect())
    }

    /// Labels of the quantum-dot / origami TEM checkpoints.
    pub fn origami() -> Self {
        Self::new((0..6).map(|i| (i, format!("1QD-{}origami", i + 1))))
    }

    pub fn label(&self, index: i64) -> PipelineResult<&str> {
        self.0
            .get(&index)
            .map(|s| s.as_str())
            .ok_or(PipelineError::UnmappedClass(index))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub probabilities: Vec<f32>,
    pub class_index: i64,
    pub probability: f32,
}

pub struct Predictor {
    model: Classifier,
    transform: Transform,
}

impl Predictor {
    pub fn new(model: Classifier, transform: Transform) -> Self {
        Self { model, transform }
    }

    /// `1 x C x H x W` input on the model's device.
    pub fn prepare_image(&self, path: &Path) -> PipelineResult<Tensor> {
        Ok(self.transform.load(path)?.unsqueeze(0).to(self.model.device()))
    }

    fn logits(&self, path: &Path) -> PipelineResult<Tensor> {
        let xs = self.prepare_image(path)?;
        Ok(tch::no_grad(|| self.model.forward_t(&xs, false)))
    }

    pub fn predict(&self, path: &Path) -> PipelineResult<i64> {
        let logits = self.logits(path)?;
        Ok(logits.argmax(-1, false).int64_value(&[0]))
    }

    pub fn predict_with_probabilities(&self, path: &Path) -> PipelineResult<Prediction> {
        let probs = self.logits(path)?.softmax(-1, Kind::Float).squeeze_dim(0).to_device(tch::Device::Cpu);
        let probabilities = Vec::<f32>::try_from(&probs)?;
        let (class_index, probability) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        Ok(Prediction {
            probabilities,
            class_index: class_index as i64,
            probability,
        })
    }

    /// Predicts every regular file in `dir` in name order and writes one
    /// `Image: <name>, Predicted class: <label>` line per file. Any file
    /// that fails to decode or maps to no label aborts the run.
    pub fn run_directory(
        &self,
        dir: &Path,
        classes: &ClassIndexMap,
        out: &mut impl Write,
    ) -> PipelineResult<Vec<(String, String)>> {
        let mut results = Vec::new();
        for path in list_files(dir)? {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let index = self.predict(&path)?;
            let label = classes.label(index)?;
            debug!("{} -> {}", name, index);
            writeln!(out, "Image: {name}, Predicted class: {label}").map_err(|e| PipelineError::io(&path, e))?;
            results.push((name, label.to_string()));
        }
        Ok(results)
    }

    pub fn report_probabilities(&self, path: &Path, out: &mut impl Write) -> PipelineResult<Prediction> {
        let p = self.predict_with_probabilities(path)?;
        writeln!(out, "Predicted class index: {}, with probability: {}", p.class_index, p.probability)
            .and_then(|_| writeln!(out, "Probabilities for all classes: {:?}", p.probabilities))
            .map_err(|e| PipelineError::io(path, e))?;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny;
    use image::RgbImage;
    use tch::Device;

    fn predictor(num_classes: i64) -> Predictor {
        let transform = Transform::new(96, vec![0.485, 0.456, 0.406], vec![0.229, 0.224, 0.225]).unwrap();
        Predictor::new(Classifier::new(tiny(num_classes), Device::Cpu), transform)
    }

    #[test]
    fn origami_map_covers_six_classes() {
        let map = ClassIndexMap::origami();
        assert_eq!(map.len(), 6);
        assert_eq!(map.label(0).unwrap(), "1QD-1origami");
        assert_eq!(map.label(5).unwrap(), "1QD-6origami");
        assert!(matches!(map.label(6), Err(PipelineError::UnmappedClass(6))));
    }

    #[test]
    fn probabilities_are_a_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.png");
        RgbImage::from_fn(50, 30, |x, y| image::Rgb([x as u8 * 5, y as u8 * 8, 128])).save(&path).unwrap();

        let p = predictor(6);
        let pred = p.predict_with_probabilities(&path).unwrap();
        assert_eq!(pred.probabilities.len(), 6);
        assert!(pred.probabilities.iter().all(|&v| v >= 0.0));
        let sum: f32 = pred.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        let max = pred.probabilities.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(pred.probability, max);
        assert_eq!(pred.probabilities[pred.class_index as usize], max);
        assert_eq!(p.predict(&path).unwrap(), pred.class_index);
    }

    #[test]
    fn prepared_image_has_batch_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        RgbImage::new(10, 10).save(&path).unwrap();
        assert_eq!(predictor(2).prepare_image(&path).unwrap().size(), vec![1, 3, 96, 96]);
    }

    #[test]
    fn non_image_in_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(10, 10).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello").unwrap();

        let mut out = Vec::new();
        let err = predictor(2)
            .run_directory(dir.path(), &ClassIndexMap::new([(0, "cat"), (1, "dog")]), &mut out)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Image { .. }));
        // the first file was still reported
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn unmapped_prediction_is_a_lookup_error() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(10, 10).save(dir.path().join("a.png")).unwrap();
        let mut out = Vec::new();
        let err = predictor(3)
            .run_directory(dir.path(), &ClassIndexMap::new(Vec::<(i64, String)>::new()), &mut out)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnmappedClass(_)));
    }
}
