//! Single-cell RNA classification with an attention classifier.
//!
//! - [`data`]: annotated matrices, Parquet/CSV/h5ad loading, the [`DataModule`]
//! - [`model`]: [`SimsClassifier`] and its optimiser
//! - [`train`]: [`Trainer`] and callbacks
//! - [`sims`]: the [`Sims`] facade
//! - [`ablation`]: the benchmark ablation driver behind the `scsims` binary

pub mod ablation;
pub mod config;
pub mod data;
pub mod error;
pub mod logger;
pub mod model;
pub mod networking;
pub mod sims;
pub mod train;

pub use config::SimsConfig;
pub use data::{
    AnnotatedMatrix, DataModule, DataModuleConfig, DatasetList, DatasetRef, LabelEncoder, MetadataValue,
};
pub use error::{Result, SimsError};
pub use model::{ModelConfig, SimsClassifier};
pub use sims::{DataReady, ModelReady, Sims, Trained, TrainerReady};
pub use train::{Trainer, TrainerConfig};
