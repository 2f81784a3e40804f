use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::encoder::LabelEncoder;
use super::loader::{read_label_column, MatrixOptions};
use super::model::{AnnotatedMatrix, DatasetList, DatasetRef, MetadataValue};
use super::split::{class_weights, split_indices, Splits};
use crate::error::{Result, SimsError};

/// Everything the data module needs besides the dataset references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModuleConfig {
    /// Metadata column holding the classification target.
    pub class_label: String,
    /// Delimiter of label files and CSV matrices.
    pub sep: char,
    pub batch_size: usize,
    /// Column with cell names, in both matrices and label files.
    pub index_col: Option<String>,
    /// Loader parallelism hint. Batches are assembled on the calling thread.
    pub num_workers: usize,
    /// Seed splits and shuffling from `seed` instead of OS entropy.
    pub deterministic: bool,
    /// Scale every cell to unit L2 norm.
    pub normalize: bool,
    /// Labels are numbers; order classes numerically.
    pub assume_numeric_label: bool,
    /// Restrict the pooled dataset to these rows before splitting.
    pub subset: Option<Vec<usize>>,
    /// Keep class proportions in every split.
    pub stratify: bool,
    pub val_prop: f64,
    pub test_prop: f64,
    pub seed: u64,
    pub shuffle: bool,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            class_label: String::new(),
            sep: ',',
            batch_size: 64,
            index_col: None,
            num_workers: 0,
            deterministic: true,
            normalize: false,
            assume_numeric_label: false,
            subset: None,
            stratify: true,
            val_prop: 0.1,
            test_prop: 0.1,
            seed: 42,
            shuffle: true,
        }
    }
}

impl DataModuleConfig {
    pub fn sep_byte(&self) -> Result<u8> {
        u8::try_from(self.sep).map_err(|_| {
            SimsError::InvalidConfig(format!("separator {:?} is not a single-byte character", self.sep))
        })
    }

    fn matrix_options(&self) -> Result<MatrixOptions> {
        Ok(MatrixOptions {
            index_col: self.index_col.clone(),
            sep: self.sep_byte()?,
            metadata_columns: vec![self.class_label.clone()],
        })
    }
}

/// Pooled cells after `prepare_data`.
#[derive(Debug)]
struct Pooled {
    x: Array2<f32>,
    labels: Vec<String>,
    obs_names: Vec<String>,
    var_names: Vec<String>,
}

/// Derived state after `setup`.
#[derive(Debug)]
struct Prepared {
    encoder: LabelEncoder,
    y: Vec<usize>,
    splits: Splits,
    weights: Vec<f32>,
}

/// Loads, normalises, splits and batches the training data.
///
/// ```text
///  datasets (+ label files)
///        │ prepare_data: load, pool, subset, normalise
///        ▼
///   pooled matrix + label strings
///        │ setup: encode labels, split, class weights
///        ▼
///   train / val / test DataLoaders
/// ```
#[derive(Debug)]
pub struct DataModule {
    datafiles: Vec<DatasetRef>,
    labelfiles: Vec<PathBuf>,
    config: DataModuleConfig,
    pooled: Option<Pooled>,
    prepared: Option<Prepared>,
}

impl DataModule {
    pub fn new(
        datafiles: impl Into<DatasetList>,
        labelfiles: Vec<PathBuf>,
        config: DataModuleConfig,
    ) -> Self {
        Self {
            datafiles: datafiles.into().into_vec(),
            labelfiles,
            config,
            pooled: None,
            prepared: None,
        }
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn datafiles(&self) -> &[DatasetRef] {
        &self.datafiles
    }

    /// Load every dataset, pool the rows and apply subset + normalisation.
    /// Calling it again is a no-op.
    pub fn prepare_data(&mut self) -> Result<()> {
        if self.pooled.is_some() {
            return Ok(());
        }
        if self.config.class_label.is_empty() {
            return Err(SimsError::InvalidConfig("class_label must be set".into()));
        }
        if self.datafiles.is_empty() {
            return Err(SimsError::EmptyDataset("no datafiles given".into()));
        }
        if !self.labelfiles.is_empty() && self.labelfiles.len() != self.datafiles.len() {
            return Err(SimsError::InvalidConfig(format!(
                "{} label files for {} datafiles",
                self.labelfiles.len(),
                self.datafiles.len()
            )));
        }

        let options = self.config.matrix_options()?;
        let mut matrices: Vec<Arc<AnnotatedMatrix>> = Vec::with_capacity(self.datafiles.len());
        let mut labels: Vec<MetadataValue> = Vec::new();

        for (i, dataset) in self.datafiles.iter().enumerate() {
            let matrix = dataset.resolve(&options)?;
            let column = match self.labelfiles.get(i) {
                Some(path) => self.labels_from_file(path, &matrix, &options)?,
                None => matrix
                    .obs_column(&self.config.class_label)
                    .ok_or_else(|| SimsError::MissingColumn {
                        column: self.config.class_label.clone(),
                        source_name: dataset.describe(),
                    })?
                    .to_vec(),
            };
            if column.len() != matrix.n_obs() || matrix.obs_names.len() != matrix.n_obs() {
                return Err(SimsError::ShapeMismatch(format!(
                    "{} has {} cells but {} '{}' labels and {} cell names",
                    dataset.describe(),
                    matrix.n_obs(),
                    column.len(),
                    self.config.class_label,
                    matrix.obs_names.len()
                )));
            }
            if let Some(first) = matrices.first() {
                if first.var_names != matrix.var_names {
                    return Err(SimsError::ShapeMismatch(format!(
                        "{} does not share the feature layout of {}",
                        dataset.describe(),
                        self.datafiles[0].describe()
                    )));
                }
            }
            labels.extend(column);
            matrices.push(matrix);
        }

        let views: Vec<ArrayView2<f32>> = matrices.iter().map(|m| m.x.view()).collect();
        let x = concatenate(Axis(0), &views).map_err(|e| SimsError::ShapeMismatch(e.to_string()))?;
        let obs_names: Vec<String> = matrices
            .iter()
            .flat_map(|m| m.obs_names.iter().cloned())
            .collect();
        let var_names = matrices[0].var_names.clone();

        let mut rows: Vec<usize> = match &self.config.subset {
            Some(subset) => {
                if let Some(&bad) = subset.iter().find(|&&r| r >= x.nrows()) {
                    return Err(SimsError::InvalidConfig(format!(
                        "subset index {bad} out of range for {} cells",
                        x.nrows()
                    )));
                }
                subset.clone()
            }
            None => (0..x.nrows()).collect(),
        };

        let before = rows.len();
        rows.retain(|&r| labels[r] != MetadataValue::Null);
        if rows.len() < before {
            warn!("dropped {} cells without a '{}' label", before - rows.len(), self.config.class_label);
        }
        if rows.is_empty() {
            return Err(SimsError::EmptyDataset("no labelled cells left after subsetting".into()));
        }

        let mut x = x.select(Axis(0), &rows);
        if self.config.normalize {
            normalize_rows(&mut x);
        }
        let labels = rows
            .iter()
            .filter_map(|&r| labels[r].as_label())
            .collect::<Vec<_>>();
        let obs_names = rows.iter().map(|&r| obs_names[r].clone()).collect();

        info!(
            "prepared {} cells x {} features from {} dataset(s)",
            x.nrows(),
            x.ncols(),
            self.datafiles.len()
        );
        self.pooled = Some(Pooled {
            x,
            labels,
            obs_names,
            var_names,
        });
        Ok(())
    }

    fn labels_from_file(
        &self,
        path: &Path,
        matrix: &AnnotatedMatrix,
        options: &MatrixOptions,
    ) -> Result<Vec<MetadataValue>> {
        let column = read_label_column(
            path,
            options.sep,
            options.index_col.as_deref(),
            &self.config.class_label,
        )?;
        if column.len() != matrix.n_obs() {
            return Err(SimsError::ShapeMismatch(format!(
                "{} has {} rows but its matrix has {} cells",
                path.display(),
                column.len(),
                matrix.n_obs()
            )));
        }
        if let Some(index) = &column.index {
            if let Some(row) = index.iter().zip(&matrix.obs_names).position(|(a, b)| a != b) {
                return Err(SimsError::ShapeMismatch(format!(
                    "{} row {row} is '{}' but the matrix has '{}'",
                    path.display(),
                    index[row],
                    matrix.obs_names[row]
                )));
            }
        }
        Ok(column.values)
    }

    /// Encode labels, split rows and compute class weights.
    /// Requires `prepare_data`; calling it again is a no-op.
    pub fn setup(&mut self) -> Result<()> {
        if self.prepared.is_some() {
            return Ok(());
        }
        let pooled = self.pooled.as_ref().ok_or(SimsError::NotPrepared("setup"))?;

        let encoder = LabelEncoder::fit(&pooled.labels, self.config.assume_numeric_label)?;
        let y = encoder.encode_all(&pooled.labels)?;

        let mut rng = self.rng(0);
        let splits = split_indices(
            &y,
            self.config.val_prop,
            self.config.test_prop,
            self.config.stratify,
            &mut rng,
        )?;
        let train_labels: Vec<usize> = splits.train.iter().map(|&r| y[r]).collect();
        let weights = class_weights(&train_labels, encoder.num_classes());

        if self.config.num_workers > 0 {
            debug!(
                "num_workers = {} recorded; batches are assembled on the calling thread",
                self.config.num_workers
            );
        }
        info!(
            "setup: {} classes, {} train / {} val / {} test cells",
            encoder.num_classes(),
            splits.train.len(),
            splits.val.len(),
            splits.test.len()
        );

        self.prepared = Some(Prepared {
            encoder,
            y,
            splits,
            weights,
        });
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.prepared.is_some()
    }

    fn rng(&self, stream: u64) -> StdRng {
        if self.config.deterministic {
            StdRng::seed_from_u64(self.config.seed.wrapping_add(stream))
        } else {
            StdRng::from_entropy()
        }
    }

    fn pooled(&self) -> Result<&Pooled> {
        self.pooled.as_ref().ok_or(SimsError::NotPrepared("prepare_data"))
    }

    fn prepared(&self) -> Result<&Prepared> {
        self.prepared.as_ref().ok_or(SimsError::NotPrepared("setup"))
    }

    /// Input dimensionality of the model.
    pub fn num_features(&self) -> Result<usize> {
        Ok(self.pooled()?.x.ncols())
    }

    /// Output dimensionality of the model.
    pub fn num_labels(&self) -> Result<usize> {
        Ok(self.prepared()?.encoder.num_classes())
    }

    /// Balanced class weights computed on the training split.
    pub fn weights(&self) -> Result<&[f32]> {
        Ok(&self.prepared()?.weights)
    }

    pub fn label_encoder(&self) -> Result<&LabelEncoder> {
        Ok(&self.prepared()?.encoder)
    }

    pub fn splits(&self) -> Result<&Splits> {
        Ok(&self.prepared()?.splits)
    }

    pub fn var_names(&self) -> Result<&[String]> {
        Ok(&self.pooled()?.var_names)
    }

    pub fn obs_names(&self) -> Result<&[String]> {
        Ok(&self.pooled()?.obs_names)
    }

    /// Encoded labels of every pooled cell.
    pub fn targets(&self) -> Result<&[usize]> {
        Ok(&self.prepared()?.y)
    }

    /// Shuffled training batches for one epoch.
    pub fn train_loader(&self, epoch: usize) -> Result<DataLoader<'_>> {
        let prepared = self.prepared()?;
        let mut loader = DataLoader::new(
            &self.pooled()?.x,
            &prepared.y,
            prepared.splits.train.clone(),
            self.config.batch_size,
        )?;
        if self.config.shuffle {
            loader.shuffle(&mut self.rng(1 + epoch as u64));
        }
        Ok(loader)
    }

    pub fn val_loader(&self) -> Result<DataLoader<'_>> {
        let prepared = self.prepared()?;
        DataLoader::new(
            &self.pooled()?.x,
            &prepared.y,
            prepared.splits.val.clone(),
            self.config.batch_size,
        )
    }

    pub fn test_loader(&self) -> Result<DataLoader<'_>> {
        let prepared = self.prepared()?;
        DataLoader::new(
            &self.pooled()?.x,
            &prepared.y,
            prepared.splits.test.clone(),
            self.config.batch_size,
        )
    }

    /// Bring an unseen matrix into the layout the model was trained on.
    pub fn transform(&self, matrix: &AnnotatedMatrix) -> Result<Array2<f32>> {
        let var_names = self.var_names()?;
        if matrix.var_names != var_names {
            return Err(SimsError::ShapeMismatch(format!(
                "expected {} features in training order, got {}",
                var_names.len(),
                matrix.n_vars()
            )));
        }
        let mut x = matrix.x.clone();
        if self.config.normalize {
            normalize_rows(&mut x);
        }
        Ok(x)
    }

    /// Matrix options used when resolving datasets passed to `transform`.
    pub fn matrix_options(&self) -> Result<MatrixOptions> {
        self.config.matrix_options()
    }
}

/// Scale each row to unit L2 norm. All-zero rows are left untouched.
pub fn normalize_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

/// One mini-batch: features and encoded targets.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Iterates over a set of rows in batches.
pub struct DataLoader<'a> {
    x: &'a Array2<f32>,
    y: &'a [usize],
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        x: &'a Array2<f32>,
        y: &'a [usize],
        indices: Vec<usize>,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(SimsError::InvalidConfig("batch_size must be positive".into()));
        }
        Ok(Self {
            x,
            y,
            indices,
            batch_size,
            position: 0,
        })
    }

    pub fn shuffle(&mut self, rng: &mut StdRng) {
        self.indices.shuffle(rng);
    }

    /// Number of rows this loader yields in total.
    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Reset the iterator to the beginning.
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let rows = &self.indices[self.position..end];
        self.position = end;

        Some(Batch {
            x: self.x.select(Axis(0), rows),
            y: rows.iter().map(|&r| self.y[r]).collect(),
        })
    }
}
