//! Experiment tracking: hyperparameters once, scalar metrics per step.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::error::{Result, SimsError};

pub trait ExperimentLogger {
    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<()>;

    fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()>;

    /// Flush buffered output. Called once when training ends.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct MetricRow<'a> {
    step: usize,
    name: &'a str,
    value: f64,
}

/// Writes `hparams.json` and a long-format `metrics.csv` under
/// `<root>/<project>/<run>/`.
pub struct CsvLogger {
    dir: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvLogger {
    pub fn new(root: impl AsRef<Path>, project: &str, run: &str) -> Result<Self> {
        let dir = root.as_ref().join(sanitize(project)).join(sanitize(run));
        fs::create_dir_all(&dir).map_err(|e| SimsError::io(&dir, e))?;
        let path = dir.join("metrics.csv");
        let file = File::create(&path).map_err(|e| SimsError::io(&path, e))?;
        info!("logging metrics to {}", path.display());
        Ok(Self {
            dir,
            writer: csv::Writer::from_writer(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Path separators would turn run names into nested directories.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

impl ExperimentLogger for CsvLogger {
    fn log_hyperparams(&mut self, params: &serde_json::Value) -> Result<()> {
        let path = self.dir.join("hparams.json");
        let file = File::create(&path).map_err(|e| SimsError::io(&path, e))?;
        serde_json::to_writer_pretty(file, params)?;
        Ok(())
    }

    fn log_metrics(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()> {
        for &(name, value) in metrics {
            self.writer.serialize(MetricRow { step, name, value })?;
        }
        self.writer.flush().map_err(|e| SimsError::io(&self.dir, e))?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| SimsError::io(&self.dir, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_metrics_and_hparams() {
        let root = tempfile::tempdir().unwrap();
        let mut logger = CsvLogger::new(root.path(), "Ablation Study", "Proportion=0.5").unwrap();
        logger
            .log_hyperparams(&serde_json::json!({ "max_epochs": 3 }))
            .unwrap();
        logger
            .log_metrics(0, &[("train_loss", 1.5), ("val_loss", 2.0)])
            .unwrap();
        logger.finalize().unwrap();

        let dir = root.path().join("Ablation Study").join("Proportion=0.5");
        let metrics = fs::read_to_string(dir.join("metrics.csv")).unwrap();
        assert_eq!(
            metrics.lines().collect::<Vec<_>>(),
            ["step,name,value", "0,train_loss,1.5", "0,val_loss,2.0"]
        );
        let hparams: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("hparams.json")).unwrap()).unwrap();
        assert_eq!(hparams["max_epochs"], 3);
    }

    #[test]
    fn run_names_stay_in_one_directory() {
        assert_eq!(sanitize("a/b:c"), "a_b_c");
    }
}
