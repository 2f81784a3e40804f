use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array2, Axis};

use super::loader::MatrixOptions;
use crate::error::{Result, SimsError};

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a per-cell metadata column
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value mirroring common `obs` dtypes.
/// Used in `BTreeSet`s downstream, so it must be `Ord`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

// -- Manual Eq/Ord so we can put MetadataValue in BTreeSet --

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use MetadataValue::*;
        fn discriminant(v: &MetadataValue) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Guess the type of a raw text cell (CSV / label files).
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return MetadataValue::Null;
        }
        if let Ok(i) = s.parse::<i64>() {
            return MetadataValue::Integer(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return MetadataValue::Float(f);
        }
        if s == "true" || s == "false" {
            return MetadataValue::Bool(s == "true");
        }
        MetadataValue::String(s.to_string())
    }

    /// Text form used as a class label. `Null` has no label.
    pub fn as_label(&self) -> Option<String> {
        match self {
            MetadataValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// AnnotatedMatrix – cells × features with per-cell metadata
// ---------------------------------------------------------------------------

/// An annotated expression matrix: `x` is cells × features, `obs` holds
/// per-cell metadata columns (each with one value per row).
#[derive(Debug, Clone)]
pub struct AnnotatedMatrix {
    pub x: Array2<f32>,
    pub obs_names: Vec<String>,
    pub var_names: Vec<String>,
    pub obs: BTreeMap<String, Vec<MetadataValue>>,
}

impl AnnotatedMatrix {
    /// Build a matrix, checking names against the shape of `x`.
    pub fn new(x: Array2<f32>, obs_names: Vec<String>, var_names: Vec<String>) -> Result<Self> {
        if obs_names.len() != x.nrows() {
            return Err(SimsError::ShapeMismatch(format!(
                "{} obs names for {} rows",
                obs_names.len(),
                x.nrows()
            )));
        }
        if var_names.len() != x.ncols() {
            return Err(SimsError::ShapeMismatch(format!(
                "{} var names for {} columns",
                var_names.len(),
                x.ncols()
            )));
        }
        Ok(Self {
            x,
            obs_names,
            var_names,
            obs: BTreeMap::new(),
        })
    }

    /// Build a matrix with positional names (`"0"`, `"1"`, ... and `"f0"`, `"f1"`, ...).
    pub fn from_dense(x: Array2<f32>) -> Self {
        let obs_names = (0..x.nrows()).map(|i| i.to_string()).collect();
        let var_names = (0..x.ncols()).map(|j| format!("f{j}")).collect();
        Self {
            x,
            obs_names,
            var_names,
            obs: BTreeMap::new(),
        }
    }

    /// Attach a metadata column. Its length must match the number of cells.
    pub fn with_obs_column(
        mut self,
        name: impl Into<String>,
        values: Vec<MetadataValue>,
    ) -> Result<Self> {
        let name = name.into();
        if values.len() != self.n_obs() {
            return Err(SimsError::ShapeMismatch(format!(
                "obs column '{name}' has {} values for {} cells",
                values.len(),
                self.n_obs()
            )));
        }
        self.obs.insert(name, values);
        Ok(self)
    }

    /// Number of cells.
    pub fn n_obs(&self) -> usize {
        self.x.nrows()
    }

    /// Number of features.
    pub fn n_vars(&self) -> usize {
        self.x.ncols()
    }

    /// Whether the matrix has no cells.
    pub fn is_empty(&self) -> bool {
        self.n_obs() == 0
    }

    pub fn obs_column(&self, name: &str) -> Option<&[MetadataValue]> {
        self.obs.get(name).map(|v| v.as_slice())
    }

    /// Ordered list of metadata column names.
    pub fn column_names(&self) -> Vec<String> {
        self.obs.keys().cloned().collect()
    }

    /// Sorted set of unique values of one metadata column.
    pub fn unique_values(&self, column: &str) -> BTreeSet<MetadataValue> {
        self.obs
            .get(column)
            .map(|vals| vals.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A new matrix restricted to `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let obs = self
            .obs
            .iter()
            .map(|(col, vals)| (col.clone(), rows.iter().map(|&r| vals[r].clone()).collect()))
            .collect();
        Self {
            x: self.x.select(Axis(0), rows),
            obs_names: rows.iter().map(|&r| self.obs_names[r].clone()).collect(),
            var_names: self.var_names.clone(),
            obs,
        }
    }
}

// ---------------------------------------------------------------------------
// DatasetRef – in-memory matrix or a path to one
// ---------------------------------------------------------------------------

/// A dataset handed to the data module or to `predict`/`explain`.
#[derive(Debug, Clone)]
pub enum DatasetRef {
    Matrix(Arc<AnnotatedMatrix>),
    Path(PathBuf),
}

impl DatasetRef {
    /// Load (or share) the underlying matrix.
    pub fn resolve(&self, options: &MatrixOptions) -> Result<Arc<AnnotatedMatrix>> {
        match self {
            DatasetRef::Matrix(m) => Ok(Arc::clone(m)),
            DatasetRef::Path(p) => super::loader::load_matrix(p, options).map(Arc::new),
        }
    }

    /// Short human-readable description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            DatasetRef::Matrix(m) => format!("<in-memory {}x{}>", m.n_obs(), m.n_vars()),
            DatasetRef::Path(p) => p.display().to_string(),
        }
    }
}

impl From<AnnotatedMatrix> for DatasetRef {
    fn from(m: AnnotatedMatrix) -> Self {
        DatasetRef::Matrix(Arc::new(m))
    }
}

impl From<Arc<AnnotatedMatrix>> for DatasetRef {
    fn from(m: Arc<AnnotatedMatrix>) -> Self {
        DatasetRef::Matrix(m)
    }
}

impl From<PathBuf> for DatasetRef {
    fn from(p: PathBuf) -> Self {
        DatasetRef::Path(p)
    }
}

impl From<&Path> for DatasetRef {
    fn from(p: &Path) -> Self {
        DatasetRef::Path(p.to_path_buf())
    }
}

impl From<&str> for DatasetRef {
    fn from(p: &str) -> Self {
        DatasetRef::Path(PathBuf::from(p))
    }
}

/// One or more datasets to pool. Built from a single reference, matrix or
/// path, or from a `Vec` of any of them.
#[derive(Debug, Clone, Default)]
pub struct DatasetList(pub Vec<DatasetRef>);

impl DatasetList {
    pub fn into_vec(self) -> Vec<DatasetRef> {
        self.0
    }
}

impl From<DatasetRef> for DatasetList {
    fn from(d: DatasetRef) -> Self {
        DatasetList(vec![d])
    }
}

impl From<AnnotatedMatrix> for DatasetList {
    fn from(m: AnnotatedMatrix) -> Self {
        DatasetList(vec![m.into()])
    }
}

impl From<Arc<AnnotatedMatrix>> for DatasetList {
    fn from(m: Arc<AnnotatedMatrix>) -> Self {
        DatasetList(vec![m.into()])
    }
}

impl From<PathBuf> for DatasetList {
    fn from(p: PathBuf) -> Self {
        DatasetList(vec![p.into()])
    }
}

impl From<&Path> for DatasetList {
    fn from(p: &Path) -> Self {
        DatasetList(vec![p.into()])
    }
}

impl From<&str> for DatasetList {
    fn from(p: &str) -> Self {
        DatasetList(vec![p.into()])
    }
}

impl<T: Into<DatasetRef>> From<Vec<T>> for DatasetList {
    fn from(items: Vec<T>) -> Self {
        DatasetList(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn parse_guesses_types() {
        assert_eq!(MetadataValue::parse(""), MetadataValue::Null);
        assert_eq!(MetadataValue::parse("3"), MetadataValue::Integer(3));
        assert_eq!(MetadataValue::parse("2.5"), MetadataValue::Float(2.5));
        assert_eq!(MetadataValue::parse("true"), MetadataValue::Bool(true));
        assert_eq!(
            MetadataValue::parse("L2/3 IT"),
            MetadataValue::String("L2/3 IT".into())
        );
    }

    #[test]
    fn null_has_no_label() {
        assert_eq!(MetadataValue::Null.as_label(), None);
        assert_eq!(MetadataValue::Integer(7).as_label().as_deref(), Some("7"));
    }

    #[test]
    fn new_rejects_mismatched_names() {
        let x = array![[1.0f32, 2.0], [3.0, 4.0]];
        let err = AnnotatedMatrix::new(x, vec!["a".into()], vec!["g1".into(), "g2".into()]);
        assert!(matches!(err, Err(SimsError::ShapeMismatch(_))));
    }

    #[test]
    fn dataset_list_accepts_one_or_many() {
        let single = DatasetList::from(AnnotatedMatrix::from_dense(array![[1.0f32]]));
        assert_eq!(single.0.len(), 1);
        assert!(matches!(single.0[0], DatasetRef::Matrix(_)));

        let path = DatasetList::from(Path::new("cells.parquet"));
        assert!(matches!(&path.0[0], DatasetRef::Path(p) if p == Path::new("cells.parquet")));

        let many = DatasetList::from(vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")]);
        let described: Vec<String> = many.into_vec().iter().map(DatasetRef::describe).collect();
        assert_eq!(described, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn select_rows_keeps_metadata_aligned() {
        let x = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let m = AnnotatedMatrix::from_dense(x)
            .with_obs_column(
                "cell_type",
                vec![
                    MetadataValue::String("a".into()),
                    MetadataValue::String("b".into()),
                    MetadataValue::String("c".into()),
                ],
            )
            .unwrap();

        let sub = m.select_rows(&[2, 0]);
        assert_eq!(sub.n_obs(), 2);
        assert_eq!(sub.obs_names, vec!["2".to_string(), "0".to_string()]);
        assert_eq!(sub.x.row(0).to_vec(), vec![1.0, 1.0]);
        assert_eq!(
            sub.obs_column("cell_type").unwrap()[1],
            MetadataValue::String("a".into())
        );
        assert_eq!(sub.unique_values("cell_type").len(), 2);
    }
}
