use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::callback::{CallbackAction, CallbackContext, EpochMetrics, TrainerCallback};
use crate::error::{Result, SimsError};
use crate::networking::RemoteStore;

/// Checkpoints the model every epoch to `<path>/<desc>-epoch=<n>.json` and
/// mirrors each checkpoint to `model_checkpoints/<desc>/<file>` when a
/// remote store is attached.
pub struct UploadCallback {
    path: PathBuf,
    desc: String,
    store: Option<Box<dyn RemoteStore>>,
    last: Option<PathBuf>,
}

impl UploadCallback {
    pub fn new(path: impl Into<PathBuf>, desc: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            desc: desc.into(),
            store: None,
            last: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.path.join(format!("{}-epoch={epoch}.json", self.desc))
    }

    pub fn remote_name(&self, checkpoint: &Path) -> String {
        let file = checkpoint
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("model_checkpoints/{}/{file}", self.desc)
    }

    /// Most recent checkpoint written.
    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last.as_deref()
    }
}

impl TrainerCallback for UploadCallback {
    fn on_train_begin(&mut self, _ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        if self.store.is_none() {
            warn!("no remote store attached; checkpoints stay in {}", self.path.display());
        }
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_end(
        &mut self,
        ctx: &CallbackContext<'_>,
        _metrics: &mut EpochMetrics,
    ) -> Result<CallbackAction> {
        fs::create_dir_all(&self.path).map_err(|e| SimsError::io(&self.path, e))?;
        let checkpoint = self.checkpoint_path(ctx.epoch);
        ctx.model.save(&checkpoint)?;
        debug!("saved {}", checkpoint.display());

        if let Some(store) = &self.store {
            store.upload(&checkpoint, &self.remote_name(&checkpoint))?;
        }
        self.last = Some(checkpoint);
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &'static str {
        "UploadCallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::LocalStore;
    use crate::train::callback::tests::{context, tiny_model};

    #[test]
    fn saves_and_uploads_each_epoch() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let mut cb = UploadCallback::new(local.path().join("checkpoints"), "human_cortical")
            .with_store(Box::new(LocalStore::new(remote.path())));

        let model = tiny_model();
        for epoch in 0..2 {
            cb.on_epoch_end(&context(&model, epoch, 1.0), &mut EpochMetrics::new())
                .unwrap();
        }

        let last = cb.last_checkpoint().unwrap();
        assert!(last.ends_with("human_cortical-epoch=1.json"));
        assert!(remote
            .path()
            .join("model_checkpoints/human_cortical/human_cortical-epoch=0.json")
            .is_file());
        assert!(crate::model::SimsClassifier::load(last).is_ok());
    }

    #[test]
    fn works_without_a_store() {
        let local = tempfile::tempdir().unwrap();
        let mut cb = UploadCallback::new(local.path(), "run");
        let model = tiny_model();
        cb.on_epoch_end(&context(&model, 3, 1.0), &mut EpochMetrics::new())
            .unwrap();
        assert!(local.path().join("run-epoch=3.json").is_file());
    }
}
