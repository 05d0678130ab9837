use std::io::Write;
use std::path::Path;
use std::time::Instant;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Device;

use crate::config::PipelineConfig;
use crate::dataset::ImageFolder;
use crate::error::{PipelineError, PipelineResult};
use crate::infer::{ClassIndexMap, Predictor};
use crate::model::{Classifier, ModelShape};
use crate::sampler;
use crate::train::{self, PhaseOutcome, TrainSettings};
use crate::transform::Transform;

pub fn init_runtime(cfg: &PipelineConfig) -> Device {
    tch::set_num_threads(num_cpus::get() as i32);
    tch::set_num_interop_threads(1);
    tch::manual_seed(cfg.seed as i64);
    let device = cfg.device.resolve();
    info!("using device {:?} | threads: {}", device, num_cpus::get());
    device
}

fn settings(cfg: &PipelineConfig, device: Device) -> TrainSettings {
    TrainSettings {
        batch_size: cfg.batch_size,
        device,
        classifier_width: cfg.classifier_width,
    }
}

/// Decodes and logs a random image from the phase-1 tree.
pub fn show_sample(root: &Path, rng: &mut StdRng) -> PipelineResult<sampler::SampledImage> {
    let sample = sampler::random_image(root, rng)?;
    let img = image::open(&sample.path).map_err(|source| PipelineError::Image {
        path: sample.path.clone(),
        source,
    })?;
    info!(
        "sample image: {:?} (category {}, {}x{})",
        sample.path,
        sample.category,
        img.width(),
        img.height()
    );
    Ok(sample)
}

/// Restores the model from `checkpoint`, prints its parameter statistics,
/// labels every file in the predict directory and finishes with the
/// probability report for the probe image.
pub fn run_inference(
    cfg: &PipelineConfig,
    shape: ModelShape,
    checkpoint: &Path,
    device: Device,
    out: &mut impl Write,
) -> PipelineResult<Vec<(String, String)>> {
    let model = Classifier::from_checkpoint(shape, device, checkpoint)?;
    let counts = model.parameter_counts();
    let io_err = |e| PipelineError::io("<stdout>", e);
    writeln!(out, "Total Parameters: {}", counts.total).map_err(io_err)?;
    writeln!(out, "Trainable Parameters: {}", counts.trainable).map_err(io_err)?;
    writeln!(out, "Estimated Model Size (MB): {:.2}", counts.size_mb()).map_err(io_err)?;

    let predictor = Predictor::new(model, Transform::from_config(&cfg.transform)?);
    let results = predictor.run_directory(&cfg.data.predict_dir, &ClassIndexMap::origami(), out)?;

    if let Some(probe) = &cfg.inference.probe_image {
        predictor.report_probabilities(&cfg.data.predict_dir.join(probe), out)?;
    }
    Ok(results)
}

/// The whole run: sample, phase 1, phase 2, inference.
pub fn run(cfg: &PipelineConfig) -> PipelineResult<()> {
    let start_time = Instant::now();
    let device = init_runtime(cfg);
    let settings = settings(cfg, device);
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    show_sample(&cfg.data.simulation_dir, &mut rng)?;
    let transform = Transform::from_config(&cfg.transform)?;

    let simulation = ImageFolder::open(&cfg.data.simulation_dir)?;
    let first: PhaseOutcome = train::train_initial(
        &simulation,
        &transform,
        &cfg.phase1,
        cfg.pretrain.path(),
        &settings,
        &mut rng,
    )?;
    drop(simulation);

    let tem = ImageFolder::open(&cfg.data.tem_dir)?;
    let second = train::fine_tune(&first, &tem, &transform, &cfg.phase2, &settings, &mut rng)?;
    drop(tem);

    let stdout = std::io::stdout();
    run_inference(cfg, second.shape, &second.checkpoint, device, &mut stdout.lock())?;

    println!("Total runtime of the script: {} seconds", start_time.elapsed().as_secs_f64());
    Ok(())
}

/// Inference only, against an existing fine-tuned checkpoint.
pub fn predict(cfg: &PipelineConfig, checkpoint: &Path, num_classes: i64) -> PipelineResult<()> {
    let start_time = Instant::now();
    let device = init_runtime(cfg);
    let shape = ModelShape {
        input_channels: cfg.transform.mean.len() as i64,
        num_classes,
        classifier_width: cfg.classifier_width,
    };
    let stdout = std::io::stdout();
    run_inference(cfg, shape, checkpoint, device, &mut stdout.lock())?;
    println!("Total runtime of the script: {} seconds", start_time.elapsed().as_secs_f64());
    Ok(())
}
