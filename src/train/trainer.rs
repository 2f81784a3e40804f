use log::{debug, info, log, Level};
use serde::{Deserialize, Serialize};

use super::callback::{CallbackAction, CallbackContext, CallbackManager, EpochMetrics, TrainerCallback};
use super::metrics::{accuracy, macro_f1};
use crate::data::{DataLoader, DataModule};
use crate::error::{Result, SimsError};
use crate::logger::ExperimentLogger;
use crate::model::optim::clip_grad_norm;
use crate::model::{Adam, ReduceLrOnPlateau, SimsClassifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    /// One accelerator when available, otherwise the CPU. This build only
    /// has CPU kernels.
    pub fn auto() -> Self {
        Device::Cpu
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Clip the global gradient norm to this value before each step.
    pub gradient_clip_val: Option<f32>,
    pub device: Device,
    /// Log per-epoch progress at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 500,
            gradient_clip_val: None,
            device: Device::auto(),
            verbose: false,
        }
    }
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub val_macro_f1: Option<f32>,
    pub lr: f32,
}

/// Loss and classification metrics over one split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalReport {
    pub loss: f32,
    pub accuracy: f32,
    pub macro_f1: f32,
    pub num_samples: usize,
}

/// Runs the optimisation loop of a [`SimsClassifier`] over a [`DataModule`].
pub struct Trainer {
    config: TrainerConfig,
    callbacks: CallbackManager,
    logger: Option<Box<dyn ExperimentLogger>>,
    history: Vec<EpochRecord>,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: CallbackManager::new(),
            logger: None,
            history: Vec::new(),
            global_step: 0,
        }
    }

    pub fn with_callback<C: TrainerCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.add(callback);
        self
    }

    pub fn add_callback<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.add(callback);
    }

    pub fn with_logger(mut self, logger: Box<dyn ExperimentLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &CallbackManager {
        &self.callbacks
    }

    /// Per-epoch metrics of the most recent `fit`.
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn validate_config(&self) -> Result<()> {
        if self.config.max_epochs == 0 {
            return Err(SimsError::InvalidConfig("max_epochs must be at least 1".into()));
        }
        if let Some(clip) = self.config.gradient_clip_val {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(SimsError::InvalidConfig(format!(
                    "gradient_clip_val must be positive, got {clip}"
                )));
            }
        }
        if let Device::Cuda(index) = self.config.device {
            return Err(SimsError::InvalidConfig(format!(
                "device cuda:{index} requested but this build runs on CPU only"
            )));
        }
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &EpochMetrics) -> Result<()> {
        if let Some(logger) = self.logger.as_mut() {
            let rows: Vec<(&str, f64)> = metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            logger.log_metrics(self.global_step, &rows)?;
        }
        Ok(())
    }

    /// Train `model` on the data module's train split, validating every epoch.
    pub fn fit(&mut self, model: &mut SimsClassifier, datamodule: &DataModule) -> Result<()> {
        self.validate_config()?;
        let (features, labels) = (datamodule.num_features()?, datamodule.num_labels()?);
        if model.input_dim() != features || model.output_dim() != labels {
            return Err(SimsError::ShapeMismatch(format!(
                "model is {}->{} but the data module provides {features}->{labels}",
                model.input_dim(),
                model.output_dim()
            )));
        }

        if let Some(logger) = self.logger.as_mut() {
            logger.log_hyperparams(&serde_json::json!({
                "trainer": &self.config,
                "model": model.config(),
                "input_dim": features,
                "output_dim": labels,
                "num_parameters": model.num_parameters(),
                "data": datamodule.config(),
            }))?;
        }

        let mut adam = Adam::new(&model.config().optim);
        let mut plateau = ReduceLrOnPlateau::new(&model.config().optim);
        let level = if self.config.verbose { Level::Info } else { Level::Debug };
        self.history.clear();

        info!(
            "fitting {} parameters for up to {} epochs on {:?}",
            model.num_parameters(),
            self.config.max_epochs,
            self.config.device
        );
        let begin = CallbackContext {
            epoch: 0,
            max_epochs: self.config.max_epochs,
            train_loss: f32::NAN,
            val_loss: None,
            val_accuracy: None,
            lr: adam.lr(),
            model: &*model,
        };
        if self.callbacks.on_train_begin(&begin)? == CallbackAction::Stop {
            info!("a callback stopped training before the first epoch");
            return Ok(());
        }

        for epoch in 0..self.config.max_epochs {
            let lr = adam.lr();
            let (train_loss, train_accuracy) = self.train_epoch(model, datamodule, epoch, &mut adam)?;
            let val = evaluate(model, datamodule.val_loader()?, labels)?;

            let record = EpochRecord {
                epoch,
                train_loss,
                train_accuracy,
                val_loss: val.map(|v| v.loss),
                val_accuracy: val.map(|v| v.accuracy),
                val_macro_f1: val.map(|v| v.macro_f1),
                lr,
            };

            let mut metrics = EpochMetrics::new();
            metrics.insert("epoch".into(), epoch as f64);
            metrics.insert("train_loss".into(), f64::from(train_loss));
            metrics.insert("train_accuracy".into(), f64::from(train_accuracy));
            if let Some(v) = val {
                metrics.insert("val_loss".into(), f64::from(v.loss));
                metrics.insert("val_accuracy".into(), f64::from(v.accuracy));
                metrics.insert("val_macro_f1".into(), f64::from(v.macro_f1));
            }

            let ctx = CallbackContext {
                epoch,
                max_epochs: self.config.max_epochs,
                train_loss,
                val_loss: record.val_loss,
                val_accuracy: record.val_accuracy,
                lr,
                model: &*model,
            };
            let action = self.callbacks.on_epoch_end(&ctx, &mut metrics)?;
            self.log_metrics(&metrics)?;

            log!(
                level,
                "epoch {epoch}: train_loss {train_loss:.4} acc {train_accuracy:.3} | val_loss {} acc {}",
                fmt_opt(record.val_loss),
                fmt_opt(record.val_accuracy)
            );

            if let Some(new_lr) = plateau.step(record.val_loss.unwrap_or(train_loss), lr) {
                info!("reducing learning rate to {new_lr:.3e}");
                adam.set_lr(new_lr);
            }
            self.history.push(record);

            if action == CallbackAction::Stop {
                break;
            }
        }

        if let Some(last) = self.history.last() {
            let end = CallbackContext {
                epoch: last.epoch,
                max_epochs: self.config.max_epochs,
                train_loss: last.train_loss,
                val_loss: last.val_loss,
                val_accuracy: last.val_accuracy,
                lr: adam.lr(),
                model: &*model,
            };
            self.callbacks.on_train_end(&end)?;
            info!("training finished after {} epochs", last.epoch + 1);
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.finalize()?;
        }
        Ok(())
    }

    fn train_epoch(
        &mut self,
        model: &mut SimsClassifier,
        datamodule: &DataModule,
        epoch: usize,
        adam: &mut Adam,
    ) -> Result<(f32, f32)> {
        let mut loss_sum = 0.0f32;
        let mut correct = 0;
        let mut seen = 0;

        for batch in datamodule.train_loader(epoch)? {
            model.zero_grad();
            let out = model.training_step(&batch.x, &batch.y)?;
            let mut params = model.parameters_mut();
            if let Some(clip) = self.config.gradient_clip_val {
                let norm = clip_grad_norm(&mut params, clip);
                if norm > clip {
                    debug!("clipped gradient norm {norm:.3} -> {clip}");
                }
            }
            adam.step(&mut params);
            self.global_step += 1;

            loss_sum += out.loss * out.total as f32;
            correct += out.correct;
            seen += out.total;
        }

        if seen == 0 {
            return Err(SimsError::EmptyDataset("training split has no cells".into()));
        }
        Ok((loss_sum / seen as f32, correct as f32 / seen as f32))
    }

    /// Evaluate `model` on the held-out test split.
    pub fn test(&mut self, model: &SimsClassifier, datamodule: &DataModule) -> Result<EvalReport> {
        let report = evaluate(model, datamodule.test_loader()?, datamodule.num_labels()?)?
            .ok_or_else(|| SimsError::EmptyDataset("test split has no cells".into()))?;
        info!(
            "test: loss {:.4} accuracy {:.3} macro_f1 {:.3} on {} cells",
            report.loss, report.accuracy, report.macro_f1, report.num_samples
        );

        let mut metrics = EpochMetrics::new();
        metrics.insert("test_loss".into(), f64::from(report.loss));
        metrics.insert("test_accuracy".into(), f64::from(report.accuracy));
        metrics.insert("test_macro_f1".into(), f64::from(report.macro_f1));
        self.log_metrics(&metrics)?;
        if let Some(logger) = self.logger.as_mut() {
            logger.finalize()?;
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("logger", &self.logger.is_some())
            .field("epochs_run", &self.history.len())
            .finish()
    }
}

/// Loss, accuracy and macro-F1 over a loader; `None` when it is empty.
pub fn evaluate(
    model: &SimsClassifier,
    loader: DataLoader<'_>,
    num_classes: usize,
) -> Result<Option<EvalReport>> {
    let mut loss_sum = 0.0f32;
    let mut predictions = Vec::with_capacity(loader.num_samples());
    let mut targets = Vec::with_capacity(loader.num_samples());

    for batch in loader {
        let (out, preds) = model.evaluate(&batch.x, &batch.y)?;
        loss_sum += out.loss * out.total as f32;
        predictions.extend(preds);
        targets.extend(batch.y);
    }
    if targets.is_empty() {
        return Ok(None);
    }
    Ok(Some(EvalReport {
        loss: loss_sum / targets.len() as f32,
        accuracy: accuracy(&predictions, &targets),
        macro_f1: macro_f1(&predictions, &targets, num_classes),
        num_samples: targets.len(),
    }))
}

fn fmt_opt(v: Option<f32>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}
