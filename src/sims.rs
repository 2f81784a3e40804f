//! High-level entry point: data module, classifier and trainer behind one handle.
//!
//! The lifecycle is tracked in the type:
//!
//! ```text
//! Sims<DataReady> --setup_model--> Sims<ModelReady> --setup_trainer--> Sims<TrainerReady>
//!        |                               |                                   |
//!        +------------ train ------------+-------------- train --------------+--> Sims<Trained>
//! ```
//!
//! `predict` and `explain` only exist once a model does:
//!
//! ```
//! use scsims::{AnnotatedMatrix, MetadataValue, ModelConfig, Sims, SimsConfig};
//!
//! let x = ndarray::Array2::from_shape_fn((12, 2), |(i, j)| if i % 2 == j { 1.0 } else { 0.0 });
//! let labels = (0..12).map(|i| MetadataValue::String(["a", "b"][i % 2].into())).collect();
//! let data = AnnotatedMatrix::from_dense(x).with_obs_column("cell_type", labels)?;
//!
//! let sims = Sims::new(data.clone(), "cell_type", SimsConfig::default())?
//!     .setup_model(ModelConfig::default())?;
//! assert_eq!(sims.predict(data)?.len(), 12);
//! # Ok::<(), scsims::SimsError>(())
//! ```
//!
//! Without `setup_model` the same call is rejected at compile time:
//!
//! ```compile_fail
//! use scsims::{AnnotatedMatrix, MetadataValue, Sims, SimsConfig};
//!
//! let x = ndarray::Array2::from_shape_fn((12, 2), |(i, j)| if i % 2 == j { 1.0 } else { 0.0 });
//! let labels = (0..12).map(|i| MetadataValue::String(["a", "b"][i % 2].into())).collect();
//! let data = AnnotatedMatrix::from_dense(x).with_obs_column("cell_type", labels)?;
//!
//! let sims = Sims::new(data.clone(), "cell_type", SimsConfig::default())?;
//! assert_eq!(sims.predict(data)?.len(), 12);
//! # Ok::<(), scsims::SimsError>(())
//! ```

use log::{debug, info};
use ndarray::Array2;

use crate::config::SimsConfig;
use crate::data::{AnnotatedMatrix, DataModule, DatasetList, DatasetRef, LabelEncoder};
use crate::error::Result;
use crate::model::{ModelConfig, SimsClassifier};
use crate::train::{EvalReport, Trainer, TrainerConfig};

mod sealed {
    pub trait Sealed {}
}

/// Lifecycle stage of a [`Sims`] handle.
pub trait Stage: sealed::Sealed {
    const NAME: &'static str;
}

/// Stages that hold a model.
pub trait HasModel: Stage {
    fn model(&self) -> &SimsClassifier;
}

/// Data loaded and split; no model yet.
#[derive(Debug)]
pub struct DataReady;

#[derive(Debug)]
pub struct ModelReady {
    model: Box<SimsClassifier>,
}

#[derive(Debug)]
pub struct TrainerReady {
    model: Box<SimsClassifier>,
    trainer: Box<Trainer>,
}

/// At least one `fit` has completed.
#[derive(Debug)]
pub struct Trained {
    model: Box<SimsClassifier>,
    trainer: Box<Trainer>,
}

impl sealed::Sealed for DataReady {}
impl sealed::Sealed for ModelReady {}
impl sealed::Sealed for TrainerReady {}
impl sealed::Sealed for Trained {}

impl Stage for DataReady {
    const NAME: &'static str = "data-ready";
}
impl Stage for ModelReady {
    const NAME: &'static str = "model-ready";
}
impl Stage for TrainerReady {
    const NAME: &'static str = "trainer-ready";
}
impl Stage for Trained {
    const NAME: &'static str = "trained";
}

impl HasModel for ModelReady {
    fn model(&self) -> &SimsClassifier {
        &self.model
    }
}
impl HasModel for TrainerReady {
    fn model(&self) -> &SimsClassifier {
        &self.model
    }
}
impl HasModel for Trained {
    fn model(&self) -> &SimsClassifier {
        &self.model
    }
}

/// Single-cell classifier wrapper.
#[derive(Debug)]
pub struct Sims<S: Stage> {
    datamodule: DataModule,
    labels_key: String,
    config: SimsConfig,
    state: S,
}

impl Sims<DataReady> {
    /// Build the data module over `datasets` and run `prepare_data` +
    /// `setup`, so the label encoder is available right away.
    pub fn new(
        datasets: impl Into<DatasetList>,
        labels_key: impl Into<String>,
        mut config: SimsConfig,
    ) -> Result<Self> {
        let labels_key = labels_key.into();
        config.data.class_label = labels_key.clone();

        let mut datamodule =
            DataModule::new(datasets, config.label_files.clone(), config.data.clone());
        datamodule.prepare_data()?;
        datamodule.setup()?;
        if config.verbose {
            info!(
                "{} classes over {} features for '{labels_key}'",
                datamodule.num_labels()?,
                datamodule.num_features()?
            );
        }

        Ok(Self {
            datamodule,
            labels_key,
            config,
            state: DataReady,
        })
    }

    /// Build the classifier with the data module's dimensions and class weights.
    pub fn setup_model(self, config: ModelConfig) -> Result<Sims<ModelReady>> {
        let model = SimsClassifier::new(
            self.datamodule.num_features()?,
            self.datamodule.num_labels()?,
            Some(self.datamodule.weights()?.to_vec()),
            config,
        )?;
        debug!("model has {} parameters", model.num_parameters());
        Ok(self.with_state(ModelReady {
            model: Box::new(model),
        }))
    }

    /// Train with a model and trainer built from the construction-time config.
    pub fn train(self) -> Result<Sims<Trained>> {
        let config = self.config.model.clone();
        self.setup_model(config)?.train()
    }
}

impl Sims<ModelReady> {
    /// Configuration is validated when training starts.
    pub fn setup_trainer(self, config: TrainerConfig) -> Sims<TrainerReady> {
        let ModelReady { model } = self.state;
        Sims {
            datamodule: self.datamodule,
            labels_key: self.labels_key,
            config: self.config,
            state: TrainerReady {
                model,
                trainer: Box::new(Trainer::new(config)),
            },
        }
    }

    /// Train with a trainer built from the construction-time config.
    pub fn train(self) -> Result<Sims<Trained>> {
        let config = self.config.trainer_config();
        self.setup_trainer(config).train()
    }
}

impl Sims<TrainerReady> {
    pub fn train(self) -> Result<Sims<Trained>> {
        let TrainerReady { model, trainer } = self.state;
        Sims {
            datamodule: self.datamodule,
            labels_key: self.labels_key,
            config: self.config,
            state: Trained { model, trainer },
        }
        .fit()
    }

    pub fn trainer(&self) -> &Trainer {
        &self.state.trainer
    }
}

impl Sims<Trained> {
    /// Fit again, reusing the same model and trainer.
    pub fn train(self) -> Result<Sims<Trained>> {
        self.fit()
    }

    fn fit(mut self) -> Result<Self> {
        let Trained { model, trainer } = &mut self.state;
        trainer.fit(model, &self.datamodule)?;
        Ok(self)
    }

    /// Evaluate on the data module's test split.
    pub fn test(&mut self) -> Result<EvalReport> {
        let Trained { model, trainer } = &mut self.state;
        trainer.test(model, &self.datamodule)
    }

    pub fn trainer(&self) -> &Trainer {
        &self.state.trainer
    }
}

impl<S: Stage> Sims<S> {
    fn with_state<T: Stage>(self, state: T) -> Sims<T> {
        Sims {
            datamodule: self.datamodule,
            labels_key: self.labels_key,
            config: self.config,
            state,
        }
    }

    pub fn stage(&self) -> &'static str {
        S::NAME
    }

    pub fn datamodule(&self) -> &DataModule {
        &self.datamodule
    }

    pub fn label_encoder(&self) -> Result<&LabelEncoder> {
        self.datamodule.label_encoder()
    }

    pub fn labels_key(&self) -> &str {
        &self.labels_key
    }

    pub fn config(&self) -> &SimsConfig {
        &self.config
    }
}

impl<S: HasModel> Sims<S> {
    pub fn model(&self) -> &SimsClassifier {
        self.state.model()
    }

    fn features(&self, dataset: DatasetRef) -> Result<Array2<f32>> {
        let matrix: std::sync::Arc<AnnotatedMatrix> =
            dataset.resolve(&self.datamodule.matrix_options()?)?;
        self.datamodule.transform(&matrix)
    }

    /// Predicted label of every cell in `dataset`.
    pub fn predict(&self, dataset: impl Into<DatasetRef>) -> Result<Vec<String>> {
        let x = self.features(dataset.into())?;
        let classes = self.model().predict(&x)?;
        self.label_encoder()?.decode_all(&classes)
    }

    /// Class probabilities, columns ordered like `label_encoder().classes()`.
    pub fn predict_proba(&self, dataset: impl Into<DatasetRef>) -> Result<Array2<f32>> {
        let x = self.features(dataset.into())?;
        self.model().predict_proba(&x)
    }

    /// Per-cell feature attention, `[cells, features]`.
    pub fn explain(&self, dataset: impl Into<DatasetRef>) -> Result<Array2<f32>> {
        let x = self.features(dataset.into())?;
        self.model().explain(&x)
    }
}
