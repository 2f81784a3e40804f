//! Ablation study driver: train on a random proportion of the human cortical
//! benchmark and report test metrics.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SimsConfig;
use crate::data::loader::count_rows;
use crate::data::{subsample, DataModule, DataModuleConfig, DatasetRef};
use crate::error::{Result, SimsError};
use crate::logger::CsvLogger;
use crate::model::{ModelConfig, SimsClassifier};
use crate::networking::{ensure_files, HttpStore, LocalStore, RemoteStore};
use crate::train::{
    Device, EarlyStopping, EvalReport, LearningRateMonitor, Trainer, TrainerConfig, UploadCallback,
};

pub const LABELS_FILE: &str = "human_labels_clean.csv";
pub const MATRIX_FILE: &str = "human.h5ad";
/// Name `generate_benchmark` writes; pass it as `--matrix-file` for offline runs.
pub const PARQUET_MATRIX_FILE: &str = "human.parquet";
pub const REMOTE_PREFIX: &str = "jlehrer/human_benchmark";
pub const PROJECT: &str = "Ablation Study, Unstratified";
pub const CHECKPOINT_DESC: &str = "human_cortical";

/// Train the classifier on a subsample of the human cortical benchmark.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "scsims", version)]
pub struct AblationArgs {
    /// Run name shown by the experiment logger (default: "Proportion=<prop>")
    #[arg(long)]
    pub name: Option<String>,

    /// Evaluate downloaded checkpoints instead of training
    #[arg(long)]
    pub test: bool,

    /// Proportion of dataset to use in ablation
    #[arg(long, default_value_t = 0.5)]
    pub prop: f64,

    /// Directory holding the benchmark files
    #[arg(long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/data/benchmark"))]
    pub data_dir: PathBuf,

    /// Expression matrix inside the data directory and under the remote prefix
    /// (.h5ad needs the `h5ad` feature; .parquet and .csv always load)
    #[arg(long, default_value = MATRIX_FILE)]
    pub matrix_file: String,

    /// Base URL of the object store (http(s):// or file://)
    #[arg(long, env = "SCSIMS_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Seed for subsampling, splits and weight initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Experiment logger root directory
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Where per-epoch checkpoints are written
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Epoch budget [default: 500, or the --config trainer section]
    #[arg(long)]
    pub max_epochs: Option<usize>,

    /// JSON file whose "model" and "trainer" sections replace the defaults
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// What a finished ablation run produced.
#[derive(Debug, Clone)]
pub struct AblationOutcome {
    pub run_name: String,
    pub train_cells: usize,
    pub epochs_run: usize,
    pub test: EvalReport,
    pub log_dir: PathBuf,
}

impl AblationArgs {
    pub fn run_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Proportion={}", self.prop))
    }
}

/// `file://` URLs map to a local mirror, everything else to HTTP.
pub fn open_store(url: &str) -> Result<Box<dyn RemoteStore>> {
    match url.strip_prefix("file://") {
        Some(root) => Ok(Box::new(LocalStore::new(root))),
        None => Ok(Box::new(HttpStore::new(url)?)),
    }
}

fn data_module_config(seed: Option<u64>, subset: Vec<usize>) -> DataModuleConfig {
    let defaults = DataModuleConfig::default();
    DataModuleConfig {
        class_label: "subclass_label".into(),
        sep: ',',
        batch_size: 64,
        index_col: Some("cell".into()),
        num_workers: 32,
        deterministic: true,
        normalize: true,
        assume_numeric_label: false,
        subset: Some(subset),
        stratify: false,
        seed: seed.unwrap_or(defaults.seed),
        ..defaults
    }
}

fn driver_sections(args: &AblationArgs) -> Result<(ModelConfig, TrainerConfig)> {
    let (mut model, mut trainer) = match &args.config {
        Some(path) => {
            let file = SimsConfig::from_json_file(path)?;
            let trainer = file.trainer_config();
            (file.model, trainer)
        }
        None => (
            ModelConfig::default(),
            TrainerConfig {
                max_epochs: 500,
                gradient_clip_val: Some(0.5),
                device: Device::auto(),
                verbose: true,
            },
        ),
    };
    if let Some(max_epochs) = args.max_epochs {
        trainer.max_epochs = max_epochs;
    }
    if let Some(seed) = args.seed {
        model.seed = seed;
    }
    Ok((model, trainer))
}

/// Download what is missing, subsample, train and test.
pub fn run(args: &AblationArgs) -> Result<AblationOutcome> {
    if args.test {
        return Err(SimsError::NotImplemented("No checkpoints downloaded yet"));
    }
    if !(args.prop > 0.0 && args.prop <= 1.0) {
        return Err(SimsError::InvalidConfig(format!(
            "--prop must be in (0, 1], got {}",
            args.prop
        )));
    }
    let (model_config, trainer_config) = driver_sections(args)?;

    let data_dir = args.data_dir.as_path();
    info!("making data folder {}", data_dir.display());
    fs::create_dir_all(data_dir).map_err(|e| SimsError::io(data_dir, e))?;

    let store = args.remote_url.as_deref().map(open_store).transpose()?;
    ensure_files(
        store.as_deref(),
        data_dir,
        REMOTE_PREFIX,
        &[LABELS_FILE, args.matrix_file.as_str()],
    )?;

    let labels_path = data_dir.join(LABELS_FILE);
    let size = count_rows(&labels_path, b',')?;
    if size == 0 {
        return Err(SimsError::EmptyDataset(format!("{} has no rows", labels_path.display())));
    }
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let sample = subsample(size, args.prop, &mut rng)?;
    info!("training on {} of {size} cells (prop {})", sample.len(), args.prop);

    let mut module = DataModule::new(
        DatasetRef::from(data_dir.join(&args.matrix_file)),
        vec![labels_path],
        data_module_config(args.seed, sample),
    );

    let run_name = args.run_name();
    let logger = CsvLogger::new(&args.log_dir, PROJECT, &run_name)?;
    let log_dir = logger.dir().to_path_buf();

    let mut upload = UploadCallback::new(&args.checkpoint_dir, CHECKPOINT_DESC);
    if let Some(store) = store {
        upload = upload.with_store(store);
    }
    let mut trainer = Trainer::new(trainer_config)
        .with_logger(Box::new(logger))
        .with_callback(LearningRateMonitor::new())
        .with_callback(upload)
        .with_callback(EarlyStopping::new("val_loss", 50));

    module.prepare_data()?;
    module.setup()?;
    let mut model = SimsClassifier::new(
        module.num_features()?,
        module.num_labels()?,
        Some(module.weights()?.to_vec()),
        model_config,
    )?;

    trainer.fit(&mut model, &module)?;
    let test = trainer.test(&model, &module)?;

    Ok(AblationOutcome {
        run_name,
        train_cells: module.splits()?.train.len(),
        epochs_run: trainer.history().len(),
        test,
        log_dir,
    })
}

/// Default benchmark directory relative to the crate root.
pub fn default_data_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/data/benchmark"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> AblationArgs {
        let mut argv = vec!["scsims"];
        argv.extend_from_slice(extra);
        AblationArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_the_benchmark_setup() {
        let args = parse(&[]);
        assert_eq!(args.prop, 0.5);
        assert!(!args.test);
        assert_eq!(args.data_dir, default_data_dir());
        assert_eq!(args.matrix_file, "human.h5ad");
        assert_eq!(args.run_name(), "Proportion=0.5");

        let (_, trainer) = driver_sections(&args).unwrap();
        assert_eq!(trainer.max_epochs, 500);
        assert_eq!(trainer.gradient_clip_val, Some(0.5));
    }

    #[test]
    fn name_overrides_run_name() {
        assert_eq!(parse(&["--name", "r1", "--prop", "0.25"]).run_name(), "r1");
    }

    #[test]
    fn test_flag_fails_before_touching_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("never-created");
        let args = parse(&["--test", "--data-dir", data_dir.to_str().unwrap()]);
        let err = run(&args).unwrap_err();
        assert!(matches!(err, SimsError::NotImplemented("No checkpoints downloaded yet")));
        assert!(!data_dir.exists());
    }

    #[test]
    fn proportion_out_of_range_is_rejected() {
        for prop in ["0", "1.5", "-0.1"] {
            let args = parse(&[format!("--prop={prop}").as_str()]);
            assert!(matches!(run(&args), Err(SimsError::InvalidConfig(_))));
        }
    }

    #[test]
    fn missing_files_without_store_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = parse(&["--data-dir", dir.path().to_str().unwrap()]);
        args.remote_url = None;
        assert!(matches!(run(&args), Err(SimsError::NoRemoteStore(_))));
    }

    #[test]
    fn matrix_is_requested_under_the_benchmark_prefix() {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote");
        let mirror = remote.join(REMOTE_PREFIX);
        fs::create_dir_all(&mirror).unwrap();
        fs::write(mirror.join(LABELS_FILE), "cell,subclass_label\nc0,Sst\n").unwrap();

        let url = format!("file://{}", remote.display());
        let data_dir = root.path().join("data");
        let args = parse(&[
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--remote-url",
            url.as_str(),
        ]);
        match run(&args) {
            Err(SimsError::MissingFile(path)) => {
                assert!(path.ends_with("jlehrer/human_benchmark/human.h5ad"))
            }
            other => panic!("expected the h5ad download to be attempted, got {other:?}"),
        }
        assert!(data_dir.join(LABELS_FILE).is_file());
    }

    #[test]
    fn config_file_sections_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, r#"{ "model": { "hidden_dims": [16] }, "trainer": { "max_epochs": 9 } }"#)
            .unwrap();
        let args = parse(&["--config", path.to_str().unwrap(), "--seed", "3"]);
        let (model, trainer) = driver_sections(&args).unwrap();
        assert_eq!(model.hidden_dims, vec![16]);
        assert_eq!(model.seed, 3);
        assert_eq!(trainer.max_epochs, 9);
    }
}
