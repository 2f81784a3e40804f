use log::info;

use super::callback::{CallbackAction, CallbackContext, EpochMetrics, TrainerCallback};
use crate::error::Result;

/// Stops training when the monitored loss has not improved for `patience`
/// consecutive epochs.
///
/// ```
/// use scsims::train::EarlyStopping;
///
/// let early_stop = EarlyStopping::new("val_loss", 50);
/// assert_eq!(early_stop.patience(), 50);
/// ```
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    /// Minimum decrease that counts as an improvement
    min_delta: f32,
    best: f32,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    /// `monitor` is `"val_loss"` or `"train_loss"`.
    pub fn new(monitor: impl Into<String>, patience: usize) -> Self {
        Self {
            monitor: monitor.into(),
            patience,
            min_delta: 0.0,
            best: f32::INFINITY,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f32) -> Self {
        self.min_delta = min_delta;
        self
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    fn monitored(&self, ctx: &CallbackContext<'_>) -> f32 {
        match self.monitor.as_str() {
            "train_loss" => ctx.train_loss,
            // An empty validation split leaves only the training loss.
            _ => ctx.val_loss.unwrap_or(ctx.train_loss),
        }
    }
}

impl TrainerCallback for EarlyStopping {
    fn on_train_begin(&mut self, _ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        self.best = f32::INFINITY;
        self.wait = 0;
        self.stopped_epoch = None;
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_end(
        &mut self,
        ctx: &CallbackContext<'_>,
        _metrics: &mut EpochMetrics,
    ) -> Result<CallbackAction> {
        let current = self.monitored(ctx);
        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }
        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                "{} did not improve for {} epochs (best {:.4}), stopping",
                self.monitor, self.patience, self.best
            );
            self.stopped_epoch = Some(ctx.epoch);
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::callback::tests::{context, tiny_model};

    fn run(es: &mut EarlyStopping, losses: &[f32]) -> Option<usize> {
        let model = tiny_model();
        es.on_train_begin(&context(&model, 0, 0.0)).unwrap();
        for (epoch, &loss) in losses.iter().enumerate() {
            let action = es
                .on_epoch_end(&context(&model, epoch, loss), &mut EpochMetrics::new())
                .unwrap();
            if action == CallbackAction::Stop {
                return Some(epoch);
            }
        }
        None
    }

    #[test]
    fn stops_after_patience_epochs_without_improvement() {
        let mut es = EarlyStopping::new("val_loss", 3);
        assert_eq!(run(&mut es, &[1.0, 0.9, 0.95, 0.91, 0.92, 0.5]), Some(4));
        assert_eq!(es.best(), 0.9);
        assert_eq!(es.stopped_epoch(), Some(4));
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut es = EarlyStopping::new("val_loss", 2);
        assert_eq!(run(&mut es, &[1.0, 1.1, 0.8, 0.9, 0.7, 0.75]), None);
    }

    #[test]
    fn min_delta_ignores_tiny_gains() {
        let mut es = EarlyStopping::new("val_loss", 2).with_min_delta(0.1);
        assert_eq!(run(&mut es, &[1.0, 0.95, 0.92]), Some(2));
    }

    #[test]
    fn state_resets_between_fits() {
        let mut es = EarlyStopping::new("val_loss", 1);
        assert_eq!(run(&mut es, &[1.0, 1.0]), Some(1));
        assert_eq!(run(&mut es, &[2.0, 1.5]), None);
    }
}
