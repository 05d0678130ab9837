use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use origami_classifier::{pipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Fine-tune AlexNet on simulated then TEM images and label a folder")]
struct Cli {
    /// TOML file overriding the built-in paths and hyperparameters.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sample, train, fine-tune and predict (default).
    Run,
    /// Only label the predict directory with an existing checkpoint.
    Predict {
        #[arg(long)]
        checkpoint: PathBuf,
        /// Overrides `data.predict_dir`.
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = 6)]
        num_classes: i64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("running full pipeline");
            pipeline::run(&cfg).context("pipeline failed")?;
        }
        Command::Predict { checkpoint, dir, num_classes } => {
            if let Some(dir) = dir {
                cfg.data.predict_dir = dir;
            }
            pipeline::predict(&cfg, &checkpoint, num_classes)
                .with_context(|| format!("prediction with {} failed", checkpoint.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs_the_pipeline() {
        let cli = Cli::try_parse_from(["origami-classifier"]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["origami-classifier", "run", "--config", "tem.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("tem.toml")));
        assert!(matches!(cli.command, Some(Command::Run)));
    }

    #[test]
    fn predict_defaults_to_six_classes() {
        let cli = Cli::try_parse_from(["origami-classifier", "predict", "--checkpoint", "ft.safetensors"]).unwrap();
        match cli.command {
            Some(Command::Predict { checkpoint, dir, num_classes }) => {
                assert_eq!(checkpoint, PathBuf::from("ft.safetensors"));
                assert_eq!(dir, None);
                assert_eq!(num_classes, 6);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn predict_requires_a_checkpoint() {
        assert!(Cli::try_parse_from(["origami-classifier", "predict"]).is_err());
    }
}
