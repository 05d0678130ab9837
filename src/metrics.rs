use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

pub const HEADER: [&str; 5] = [
    "Epoch",
    "Training Loss",
    "Training Accuracy",
    "Validation Loss",
    "Validation Accuracy",
];

/// Loss is the mean of per-batch mean losses; accuracy is a percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Append-only CSV of per-epoch metrics. Every row is flushed as soon as it
/// is written so a crashed run keeps the epochs it finished.
pub struct MetricsWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl MetricsWriter {
    pub fn create(path: &Path) -> PipelineResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(HEADER)?;
        writer.flush().map_err(|e| PipelineError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn append(&mut self, m: &EpochMetrics) -> PipelineResult<()> {
        self.writer.write_record([
            m.epoch.to_string(),
            m.train_loss.to_string(),
            m.train_accuracy.to_string(),
            m.val_loss.to_string(),
            m.val_accuracy.to_string(),
        ])?;
        self.writer.flush().map_err(|e| PipelineError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_one_row_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/training_results.csv");
        let mut w = MetricsWriter::create(&path).unwrap();
        for epoch in 1..=2 {
            w.append(&EpochMetrics {
                epoch,
                train_loss: 1.5 / epoch as f64,
                train_accuracy: 50.0,
                val_loss: 2.0,
                val_accuracy: 25.0,
            })
            .unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Epoch,Training Loss,Training Accuracy,Validation Loss,Validation Accuracy",
                "1,1.5,50,2,25",
                "2,0.75,50,2,25",
            ]
        );
    }

    #[test]
    fn rows_are_visible_before_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let mut w = MetricsWriter::create(&path).unwrap();
        w.append(&EpochMetrics {
            epoch: 1,
            train_loss: 0.1,
            train_accuracy: 99.5,
            val_loss: 0.2,
            val_accuracy: 98.0,
        })
        .unwrap();
        let rows = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(rows, 2);
        drop(w);
    }
}
