use ndarray::Array2;
use scsims::data::MetadataValue;
use scsims::{AnnotatedMatrix, DatasetRef, Sims, SimsConfig};

const TYPES: [&str; 3] = ["B cell", "NK cell", "T cell"];

/// Three cell types, each with two marker genes out of eight.
fn atlas(n: usize, offset: usize) -> AnnotatedMatrix {
    let x = Array2::from_shape_fn((n, 8), |(i, j)| {
        let class = (i + offset) % 3;
        let jitter = ((i * 7 + j * 3) % 5) as f32 * 0.05;
        if j / 2 == class {
            3.0 + jitter
        } else {
            jitter
        }
    });
    let labels = (0..n)
        .map(|i| MetadataValue::String(TYPES[(i + offset) % 3].to_string()))
        .collect();
    AnnotatedMatrix::from_dense(x)
        .with_obs_column("cell_type", labels)
        .unwrap()
}

fn config(max_epochs: usize) -> SimsConfig {
    let mut config = SimsConfig::default();
    config.data.batch_size = 16;
    config.data.normalize = true;
    config.model.attention_dim = 4;
    config.model.hidden_dims = vec![16];
    config.model.optim.lr = 0.01;
    config.trainer.max_epochs = max_epochs;
    config.trainer.gradient_clip_val = Some(0.5);
    config
}

#[test]
fn lazy_train_then_predict_known_labels() {
    let datasets = vec![DatasetRef::from(atlas(60, 0)), DatasetRef::from(atlas(30, 1))];
    let sims = Sims::new(datasets, "cell_type", config(40)).unwrap();
    let sims = sims.train().unwrap();
    assert_eq!(sims.stage(), "trained");

    let predictions = sims.predict(atlas(12, 2)).unwrap();
    assert_eq!(predictions.len(), 12);
    let classes = sims.label_encoder().unwrap().classes();
    assert!(predictions.iter().all(|p| classes.contains(p)));

    let expected: Vec<&str> = (0..12).map(|i| TYPES[(i + 2) % 3]).collect();
    let correct = predictions
        .iter()
        .zip(&expected)
        .filter(|(p, e)| p.as_str() == **e)
        .count();
    assert!(correct >= 10, "{correct}/12 correct: {predictions:?}");
}

#[test]
fn retraining_reuses_model_and_trainer() {
    let sims = Sims::new(atlas(45, 0), "cell_type", config(2))
        .unwrap()
        .setup_model(config(2).model)
        .unwrap()
        .setup_trainer(config(2).trainer)
        .train()
        .unwrap();
    let model = sims.model() as *const _;
    let trainer = sims.trainer() as *const _;

    let mut sims = sims.train().unwrap();
    assert_eq!(model, sims.model() as *const _);
    assert_eq!(trainer, sims.trainer() as *const _);

    let report = sims.test().unwrap();
    assert_eq!(report.num_samples, sims.datamodule().splits().unwrap().test.len());
}

#[test]
fn encoder_round_trips_training_labels() {
    let sims = Sims::new(atlas(30, 0), "cell_type", config(1)).unwrap();
    let encoder = sims.label_encoder().unwrap();
    for label in TYPES {
        let class = encoder.encode(label).unwrap();
        assert_eq!(encoder.decode(class).unwrap(), label);
    }
}

#[test]
fn predict_rejects_a_different_feature_layout() {
    let sims = Sims::new(atlas(30, 0), "cell_type", config(1))
        .unwrap()
        .setup_model(config(1).model)
        .unwrap();
    let other = AnnotatedMatrix::from_dense(Array2::zeros((2, 5)));
    assert!(matches!(
        sims.predict(other),
        Err(scsims::SimsError::ShapeMismatch(_))
    ));
}
