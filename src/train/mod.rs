//! Training loop, callbacks and evaluation metrics.

pub mod callback;
mod early_stopping;
mod lr_monitor;
pub mod metrics;
mod trainer;
mod upload;

pub use callback::{CallbackAction, CallbackContext, CallbackManager, EpochMetrics, TrainerCallback};
pub use early_stopping::EarlyStopping;
pub use lr_monitor::LearningRateMonitor;
pub use trainer::{evaluate, Device, EpochRecord, EvalReport, Trainer, TrainerConfig};
pub use upload::UploadCallback;
