use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use tch::nn::OptimizerConfig;
use tch::{nn, Device, Kind};

use crate::config::{FineTuneConfig, OptimizerSettings, PhaseConfig};
use crate::dataset::{split_indices, ImageFolder};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{EpochMetrics, MetricsWriter};
use crate::model::{ensure_head_fits, Classifier, ModelShape};
use crate::transform::Transform;

/// Knobs shared by both phases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSettings {
    pub batch_size: usize,
    pub device: Device,
    /// Hidden width of the fully-connected layers for a freshly built model.
    pub classifier_width: i64,
}

/// What a finished phase hands to the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub shape: ModelShape,
    pub checkpoint: PathBuf,
    pub history: Vec<EpochMetrics>,
}

pub fn build_optimizer(model: &Classifier, settings: OptimizerSettings, lr: f64) -> PipelineResult<nn::Optimizer> {
    let opt = match settings {
        OptimizerSettings::Sgd { momentum } => nn::Sgd {
            momentum,
            ..Default::default()
        }
        .build(model.var_store(), lr)?,
        OptimizerSettings::Adam => nn::Adam::default().build(model.var_store(), lr)?,
    };
    Ok(opt)
}

fn batch_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • {per_sec} • eta {eta_precise} • {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▓░")
}

fn epoch_style() -> ProgressStyle {
    ProgressStyle::with_template(" {spinner:.yellow} [Epoch {pos}/{len}] {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

/// Mean loss and accuracy (percent) over `indices`, gradients disabled and
/// the model in eval mode.
pub fn evaluate(
    model: &Classifier,
    dataset: &ImageFolder,
    indices: &[usize],
    transform: &Transform,
    batch_size: usize,
) -> PipelineResult<(f64, f64)> {
    let device = model.device();
    let mut tot_loss = 0.0;
    let mut tot_correct = 0i64;
    let mut tot_seen = 0i64;
    let mut batches = 0usize;

    for chunk in indices.chunks(batch_size.max(1)) {
        let (bxs, bys) = dataset.load_batch(chunk, transform)?;
        let (bxs, bys) = (bxs.to(device), bys.to(device));
        let (loss, correct) = tch::no_grad(|| {
            let logits = model.forward_t(&bxs, false);
            let loss = logits.cross_entropy_for_logits(&bys).double_value(&[]);
            let correct = logits.argmax(-1, false).eq_tensor(&bys).sum(Kind::Int64).int64_value(&[]);
            (loss, correct)
        });
        tot_loss += loss;
        tot_correct += correct;
        tot_seen += chunk.len() as i64;
        batches += 1;
    }

    if tot_seen == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((tot_loss / batches as f64, 100.0 * tot_correct as f64 / tot_seen as f64))
}

/// Runs `epochs` passes over `train_idx`, validating on `val_idx` after each
/// one when it is non-empty. Epoch lines go to `out`, every epoch is
/// reported to `metrics` if given.
#[allow(clippy::too_many_arguments)]
pub fn fit<R: Rng + ?Sized, W: Write>(
    model: &Classifier,
    opt: &mut nn::Optimizer,
    dataset: &ImageFolder,
    train_idx: &[usize],
    val_idx: &[usize],
    transform: &Transform,
    epochs: usize,
    batch_size: usize,
    rng: &mut R,
    mut metrics: Option<&mut MetricsWriter>,
    out: &mut W,
) -> PipelineResult<Vec<EpochMetrics>> {
    let io_err = |e| PipelineError::io("<stdout>", e);
    let device = model.device();
    let batch_size = batch_size.max(1);
    let mut history = Vec::with_capacity(epochs);

    let epoch_pb = ProgressBar::new(epochs as u64);
    epoch_pb.set_style(epoch_style());

    for epoch in 1..=epochs {
        let mut indices = train_idx.to_vec();
        indices.shuffle(rng);

        let batch_pb = ProgressBar::new(indices.len() as u64);
        batch_pb.set_style(batch_style());
        batch_pb.set_prefix(epoch.to_string());

        let mut train_loss_sum = 0.0;
        let mut train_correct = 0i64;
        let mut seen = 0i64;
        let mut batches = 0usize;

        for chunk in indices.chunks(batch_size) {
            let (bxs, bys) = dataset.load_batch(chunk, transform)?;
            let (bxs, bys) = (bxs.to(device), bys.to(device));

            let logits = model.forward_t(&bxs, true);
            let loss = logits.cross_entropy_for_logits(&bys);
            opt.backward_step(&loss);

            train_loss_sum += loss.double_value(&[]);
            train_correct += logits.argmax(-1, false).eq_tensor(&bys).sum(Kind::Int64).int64_value(&[]);
            seen += chunk.len() as i64;
            batches += 1;

            let running_acc = 100.0 * train_correct as f64 / seen as f64;
            let running_loss = train_loss_sum / batches as f64;
            batch_pb.set_message(format!("loss {running_loss:.4} • acc {running_acc:.2}%"));
            batch_pb.inc(chunk.len() as u64);
        }
        batch_pb.finish_and_clear();

        let train_loss = if batches > 0 { train_loss_sum / batches as f64 } else { 0.0 };
        let train_accuracy = if seen > 0 { 100.0 * train_correct as f64 / seen as f64 } else { 0.0 };
        // println on a hidden bar drops the line, suspend does not
        epoch_pb
            .suspend(|| writeln!(out, "Epoch {epoch}, Training Loss: {train_loss}, Training Accuracy: {train_accuracy}%"))
            .map_err(io_err)?;

        let (val_loss, val_accuracy) = if val_idx.is_empty() {
            (0.0, 0.0)
        } else {
            let (l, a) = evaluate(model, dataset, val_idx, transform, batch_size)?;
            epoch_pb
                .suspend(|| writeln!(out, "Epoch {epoch}, Validation Loss: {l}, Validation Accuracy: {a}%"))
                .map_err(io_err)?;
            (l, a)
        };

        let record = EpochMetrics {
            epoch,
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
        };
        if let Some(w) = metrics.as_deref_mut() {
            w.append(&record)?;
        }
        history.push(record);

        epoch_pb.set_message(format!("loss {train_loss:.4} • val_acc {val_accuracy:.2}%"));
        epoch_pb.inc(1);
    }
    epoch_pb.finish_with_message("done");
    Ok(history)
}

/// Phase 1: pretrained backbone, head sized to the dataset, every
/// parameter trainable.
pub fn train_initial<R: Rng + ?Sized>(
    dataset: &ImageFolder,
    transform: &Transform,
    cfg: &PhaseConfig,
    pretrained: Option<&Path>,
    settings: &TrainSettings,
    rng: &mut R,
) -> PipelineResult<PhaseOutcome> {
    let shape = ModelShape {
        input_channels: transform.channels() as i64,
        num_classes: dataset.num_classes() as i64,
        classifier_width: settings.classifier_width,
    };
    let mut model = Classifier::new(shape, settings.device);
    match pretrained {
        Some(path) => {
            model.load_pretrained(path)?;
        }
        None => warn!("pretrained weights disabled, training from random initialisation"),
    }

    let (train_idx, val_idx) = split_indices(dataset.len(), cfg.train_fraction, rng);
    info!(
        "phase 1: {} train / {} validation images, {} classes, {} epochs",
        train_idx.len(),
        val_idx.len(),
        shape.num_classes,
        cfg.epochs
    );

    let mut opt = build_optimizer(&model, cfg.optimizer, cfg.learning_rate)?;
    let mut writer = cfg.metrics_csv.as_deref().map(MetricsWriter::create).transpose()?;
    let history = fit(
        &model,
        &mut opt,
        dataset,
        &train_idx,
        &val_idx,
        transform,
        cfg.epochs,
        settings.batch_size,
        rng,
        writer.as_mut(),
        &mut std::io::stdout(),
    )?;
    if let Some(path) = &cfg.metrics_csv {
        println!("Training results have been written to {}", path.display());
    }

    model.save(&cfg.checkpoint)?;
    Ok(PhaseOutcome {
        shape,
        checkpoint: cfg.checkpoint.clone(),
        history,
    })
}

/// Phase 2: restore the phase-1 model, swap the head, freeze everything
/// outside `trainable_prefix` and keep training on a new dataset.
pub fn fine_tune<R: Rng + ?Sized>(
    previous: &PhaseOutcome,
    dataset: &ImageFolder,
    transform: &Transform,
    cfg: &FineTuneConfig,
    settings: &TrainSettings,
    rng: &mut R,
) -> PipelineResult<PhaseOutcome> {
    let base = Classifier::from_checkpoint(previous.shape, settings.device, &previous.checkpoint)?;
    let num_classes = cfg.num_classes.unwrap_or(dataset.num_classes() as i64);
    ensure_head_fits(dataset.num_classes(), num_classes)?;

    let model = base.with_new_head(num_classes)?;
    drop(base);
    let frozen = model.freeze_except(&cfg.trainable_prefix);
    let counts = model.parameter_counts();
    info!(
        "phase 2: froze {} tensors, {} of {} parameters trainable",
        frozen, counts.trainable, counts.total
    );

    let phase = cfg.phase();
    let (train_idx, val_idx) = split_indices(dataset.len(), phase.train_fraction, rng);
    let mut opt = build_optimizer(&model, phase.optimizer, phase.learning_rate)?;
    let history = fit(
        &model,
        &mut opt,
        dataset,
        &train_idx,
        &val_idx,
        transform,
        phase.epochs,
        settings.batch_size,
        rng,
        None,
        &mut std::io::stdout(),
    )?;

    model.save(&phase.checkpoint)?;
    Ok(PhaseOutcome {
        shape: model.shape(),
        checkpoint: phase.checkpoint,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseConfig;
    use crate::model::tests::tiny;
    use image::RgbImage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    const SETTINGS: TrainSettings = TrainSettings {
        batch_size: 4,
        device: Device::Cpu,
        classifier_width: 16,
    };

    fn small_transform() -> Transform {
        Transform::new(96, vec![0.485, 0.456, 0.406], vec![0.229, 0.224, 0.225]).unwrap()
    }

    fn folder(root: &Path, classes: &[(&str, [u8; 3])], per_class: usize) -> ImageFolder {
        for (name, rgb) in classes {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                RgbImage::from_pixel(20 + i as u32, 16, image::Rgb(*rgb))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        ImageFolder::open(root).unwrap()
    }

    #[test]
    fn evaluate_leaves_parameters_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ds = folder(dir.path(), &[("a", [255, 0, 0]), ("b", [0, 0, 255])], 3);
        let model = Classifier::new(tiny(2), Device::Cpu);
        let before = model.var_store().variables()["classifier.6.weight"].detach().copy();

        let all: Vec<usize> = (0..ds.len()).collect();
        let (loss, acc) = evaluate(&model, &ds, &all, &small_transform(), 4).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!((0.0..=100.0).contains(&acc));
        assert!(before.equal(&model.var_store().variables()["classifier.6.weight"]));
    }

    #[test]
    fn evaluate_on_nothing_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ds = folder(dir.path(), &[("a", [1, 2, 3])], 1);
        let model = Classifier::new(tiny(1), Device::Cpu);
        assert_eq!(evaluate(&model, &ds, &[], &small_transform(), 4).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn fit_records_every_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let ds = folder(dir.path(), &[("a", [255, 0, 0]), ("b", [0, 255, 0])], 3);
        let model = Classifier::new(tiny(2), Device::Cpu);
        let mut opt = build_optimizer(&model, OptimizerSettings::Sgd { momentum: 0.9 }, 1e-3).unwrap();
        let csv_path = dir.path().join("metrics.csv");
        let mut writer = MetricsWriter::create(&csv_path).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut out = Vec::new();

        let history = fit(
            &model,
            &mut opt,
            &ds,
            &[0, 1, 3, 4],
            &[2, 5],
            &small_transform(),
            2,
            3,
            &mut rng,
            Some(&mut writer),
            &mut out,
        )
        .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].epoch, 1);
        assert_eq!(history[1].epoch, 2);
        for m in &history {
            assert!(m.train_loss.is_finite());
            assert!((0.0..=100.0).contains(&m.train_accuracy));
            assert!((0.0..=100.0).contains(&m.val_accuracy));
        }
        assert_eq!(fs::read_to_string(&csv_path).unwrap().lines().count(), 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Epoch 1, Training Loss: "));
        assert!(lines[0].ends_with('%'));
        assert!(lines[1].starts_with("Epoch 1, Validation Loss: "));
        assert!(lines[1].contains(", Validation Accuracy: "));
        assert!(lines[2].starts_with("Epoch 2, Training Loss: "));
        assert!(lines[3].starts_with("Epoch 2, Validation Loss: "));
    }

    #[test]
    fn fit_without_validation_prints_training_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let ds = folder(dir.path(), &[("a", [255, 0, 0]), ("b", [0, 255, 0])], 2);
        let model = Classifier::new(tiny(2), Device::Cpu);
        let mut opt = build_optimizer(&model, OptimizerSettings::Adam, 1e-3).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut out = Vec::new();

        fit(&model, &mut opt, &ds, &[0, 1, 2, 3], &[], &small_transform(), 1, 4, &mut rng, None, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("Epoch 1, Training Loss: "));
        assert!(text.contains(", Training Accuracy: "));
    }

    #[test]
    fn two_phases_chain_through_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let sim = folder(&dir.path().join("sim"), &[("x", [200, 10, 10]), ("y", [10, 200, 10]), ("z", [10, 10, 200])], 2);
        let tem = folder(&dir.path().join("tem"), &[("p", [90, 90, 90]), ("q", [250, 250, 250])], 2);
        let transform = small_transform();
        let mut rng = StdRng::seed_from_u64(5);

        let phase1 = PhaseConfig {
            epochs: 1,
            checkpoint: dir.path().join("ckpt/phase1.safetensors"),
            metrics_csv: Some(dir.path().join("phase1.csv")),
            ..PhaseConfig::default()
        };
        let first = train_initial(&sim, &transform, &phase1, None, &SETTINGS, &mut rng).unwrap();
        assert_eq!(first.shape, tiny(3));
        assert!(first.checkpoint.exists());
        assert_eq!(first.history.len(), 1);

        let phase2 = FineTuneConfig {
            epochs: 1,
            checkpoint: dir.path().join("ckpt/phase2.safetensors"),
            num_classes: None,
            ..FineTuneConfig::default()
        };
        let second = fine_tune(&first, &tem, &transform, &phase2, &SETTINGS, &mut rng).unwrap();
        assert_eq!(second.shape, tiny(2));
        assert!(second.checkpoint.exists());

        let a = Classifier::from_checkpoint(first.shape, Device::Cpu, &first.checkpoint).unwrap();
        let b = Classifier::from_checkpoint(second.shape, Device::Cpu, &second.checkpoint).unwrap();
        let va = a.var_store().variables();
        let vb = b.var_store().variables();
        assert!(va["features.0.weight"].equal(&vb["features.0.weight"]));
        assert!(va["classifier.4.weight"].equal(&vb["classifier.4.weight"]));
    }

    #[test]
    fn fine_tune_rejects_head_smaller_than_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let tem = folder(&dir.path().join("tem"), &[("p", [1, 1, 1]), ("q", [2, 2, 2]), ("r", [3, 3, 3])], 1);
        let ckpt = dir.path().join("phase1.safetensors");
        Classifier::new(tiny(4), Device::Cpu).save(&ckpt).unwrap();
        let previous = PhaseOutcome {
            shape: tiny(4),
            checkpoint: ckpt,
            history: Vec::new(),
        };
        let cfg = FineTuneConfig {
            epochs: 1,
            num_classes: Some(2),
            checkpoint: dir.path().join("phase2.safetensors"),
            ..FineTuneConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = fine_tune(&previous, &tem, &small_transform(), &cfg, &SETTINGS, &mut rng).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::TooManyClasses { found: 3, head: 2 }));
        assert!(!dir.path().join("phase2.safetensors").exists());
    }
}
