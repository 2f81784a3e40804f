//! Callback hooks for the training loop.
//!
//! - `CallbackContext` - state handed to every hook
//! - `CallbackAction` - what a hook asks the trainer to do next
//! - `TrainerCallback` - the trait callbacks implement
//! - `CallbackManager` - dispatches one event to every callback

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::SimsClassifier;

/// Scalar metrics collected for one epoch, keyed by name.
pub type EpochMetrics = BTreeMap<String, f64>;

/// Training state passed to callbacks.
#[derive(Clone, Debug)]
pub struct CallbackContext<'a> {
    /// Current epoch (0-indexed)
    pub epoch: usize,
    pub max_epochs: usize,
    /// Mean training loss of the epoch
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    /// Learning rate used during the epoch
    pub lr: f32,
    pub model: &'a SimsClassifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hooks into training events. Every method defaults to a no-op.
pub trait TrainerCallback {
    fn on_train_begin(&mut self, _ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    /// Called after validation. Callbacks may add entries to `metrics`; the
    /// trainer logs them once every callback has run.
    fn on_epoch_end(
        &mut self,
        _ctx: &CallbackContext<'_>,
        _metrics: &mut EpochMetrics,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Owns the callbacks of a trainer and fires events in registration order.
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainerCallback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: TrainerCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn add_boxed(&mut self, callback: Box<dyn TrainerCallback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|cb| cb.name()).collect()
    }

    pub fn on_train_begin(&mut self, ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        for cb in &mut self.callbacks {
            if cb.on_train_begin(ctx)? == CallbackAction::Stop {
                return Ok(CallbackAction::Stop);
            }
        }
        Ok(CallbackAction::Continue)
    }

    /// Every callback sees the epoch even if an earlier one asked to stop.
    pub fn on_epoch_end(
        &mut self,
        ctx: &CallbackContext<'_>,
        metrics: &mut EpochMetrics,
    ) -> Result<CallbackAction> {
        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            if cb.on_epoch_end(ctx, metrics)? == CallbackAction::Stop {
                log::info!("{} requested stop at epoch {}", cb.name(), ctx.epoch);
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }

    pub fn on_train_end(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        for cb in &mut self.callbacks {
            cb.on_train_end(ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::ModelConfig;

    pub(crate) fn tiny_model() -> SimsClassifier {
        let config = ModelConfig {
            attention_dim: 2,
            hidden_dims: vec![3],
            ..Default::default()
        };
        SimsClassifier::new(2, 2, None, config).unwrap()
    }

    pub(crate) fn context(model: &SimsClassifier, epoch: usize, val_loss: f32) -> CallbackContext<'_> {
        CallbackContext {
            epoch,
            max_epochs: 10,
            train_loss: 1.0,
            val_loss: Some(val_loss),
            val_accuracy: None,
            lr: 1e-3,
            model,
        }
    }

    struct Counter {
        seen: std::rc::Rc<std::cell::Cell<usize>>,
        stop: bool,
    }

    impl TrainerCallback for Counter {
        fn on_epoch_end(
            &mut self,
            _ctx: &CallbackContext<'_>,
            _metrics: &mut EpochMetrics,
        ) -> Result<CallbackAction> {
            self.seen.set(self.seen.get() + 1);
            Ok(if self.stop {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            })
        }

        fn name(&self) -> &'static str {
            "Counter"
        }
    }

    #[test]
    fn stop_still_reaches_later_callbacks() {
        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut manager = CallbackManager::new();
        manager.add(Counter { seen: seen.clone(), stop: true });
        manager.add(Counter { seen: seen.clone(), stop: false });
        assert_eq!(manager.len(), 2);

        let model = tiny_model();
        let action = manager
            .on_epoch_end(&context(&model, 0, 1.0), &mut EpochMetrics::new())
            .unwrap();
        assert_eq!(action, CallbackAction::Stop);
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn default_hooks_continue() {
        struct Minimal;
        impl TrainerCallback for Minimal {
            fn name(&self) -> &'static str {
                "Minimal"
            }
        }
        let model = tiny_model();
        let ctx = context(&model, 0, 1.0);
        let mut cb = Minimal;
        assert_eq!(cb.on_train_begin(&ctx).unwrap(), CallbackAction::Continue);
        assert_eq!(
            cb.on_epoch_end(&ctx, &mut EpochMetrics::new()).unwrap(),
            CallbackAction::Continue
        );
        cb.on_train_end(&ctx).unwrap();
    }
}
