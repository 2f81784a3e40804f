use super::callback::{CallbackAction, CallbackContext, EpochMetrics, TrainerCallback};
use crate::error::Result;

/// Records the optimiser learning rate once per epoch as `lr-Adam`.
#[derive(Clone, Debug, Default)]
pub struct LearningRateMonitor {
    history: Vec<(usize, f32)>,
}

impl LearningRateMonitor {
    pub const METRIC: &'static str = "lr-Adam";

    pub fn new() -> Self {
        Self::default()
    }

    /// `(epoch, lr)` pairs seen so far.
    pub fn history(&self) -> &[(usize, f32)] {
        &self.history
    }
}

impl TrainerCallback for LearningRateMonitor {
    fn on_epoch_end(
        &mut self,
        ctx: &CallbackContext<'_>,
        metrics: &mut EpochMetrics,
    ) -> Result<CallbackAction> {
        self.history.push((ctx.epoch, ctx.lr));
        metrics.insert(Self::METRIC.to_string(), f64::from(ctx.lr));
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "LearningRateMonitor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::callback::tests::{context, tiny_model};

    #[test]
    fn records_lr_every_epoch() {
        let model = tiny_model();
        let mut monitor = LearningRateMonitor::new();
        let mut metrics = EpochMetrics::new();
        for epoch in 0..3 {
            monitor
                .on_epoch_end(&context(&model, epoch, 1.0), &mut metrics)
                .unwrap();
        }
        assert_eq!(monitor.history().len(), 3);
        assert!((metrics[LearningRateMonitor::METRIC] - 1e-3).abs() < 1e-9);
    }
}
