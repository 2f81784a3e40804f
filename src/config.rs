//! Run configuration, loadable from JSON.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::DataModuleConfig;
use crate::error::{Result, SimsError};
use crate::model::ModelConfig;
use crate::train::TrainerConfig;

/// Everything `Sims` needs besides the datasets and the label key.
///
/// ```json
/// {
///   "data": { "batch_size": 128, "normalize": true },
///   "model": { "hidden_dims": [128] },
///   "trainer": { "max_epochs": 50, "gradient_clip_val": 0.5 },
///   "verbose": true
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimsConfig {
    pub data: DataModuleConfig,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
    /// Label files aligned with the datasets. Empty: labels come from each
    /// matrix's own metadata.
    pub label_files: Vec<PathBuf>,
    pub verbose: bool,
}

impl SimsConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SimsError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Trainer section with the top-level `verbose` flag applied.
    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            verbose: self.trainer.verbose || self.verbose,
            ..self.trainer.clone()
        }
    }
}
