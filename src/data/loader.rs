use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float32Type, Float64Type, Int64Type};
use log::debug;
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::model::{AnnotatedMatrix, MetadataValue};
use crate::error::{Result, SimsError};

/// How to interpret the columns of a matrix file.
#[derive(Debug, Clone)]
pub struct MatrixOptions {
    /// Column holding cell names. `None` means positional names.
    pub index_col: Option<String>,
    /// Field delimiter for CSV matrices.
    pub sep: u8,
    /// Columns read as metadata even when they are numeric (e.g. integer labels).
    pub metadata_columns: Vec<String>,
}

impl Default for MatrixOptions {
    fn default() -> Self {
        Self {
            index_col: None,
            sep: b',',
            metadata_columns: Vec::new(),
        }
    }
}

impl MatrixOptions {
    fn is_metadata(&self, column: &str) -> bool {
        self.metadata_columns.iter().any(|c| c == column)
    }
}

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load an annotated matrix from a file. Dispatch by extension.
///
/// Supported formats (wide layout, one row per cell):
/// * `.parquet` – numeric columns are features, string/bool/dictionary columns are metadata
/// * `.csv`     – columns whose every cell parses as a number are features, the rest metadata
/// * `.h5ad`    – AnnData files, with the `h5ad` feature
pub fn load_matrix(path: &Path, options: &MatrixOptions) -> Result<AnnotatedMatrix> {
    if !path.is_file() {
        return Err(SimsError::MissingFile(path.to_path_buf()));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let matrix = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path, options)?,
        "csv" | "tsv" | "txt" => load_csv(path, options)?,
        #[cfg(feature = "h5ad")]
        "h5ad" => super::h5ad::load_h5ad(path, options)?,
        #[cfg(not(feature = "h5ad"))]
        "h5ad" => {
            return Err(SimsError::UnsupportedFormat(
                ".h5ad (rebuild with `--features h5ad`)".into(),
            ))
        }
        other => return Err(SimsError::UnsupportedFormat(format!(".{other}"))),
    };
    debug!(
        "loaded {} ({} cells x {} features, obs columns {:?})",
        path.display(),
        matrix.n_obs(),
        matrix.n_vars(),
        matrix.column_names()
    );
    Ok(matrix)
}

/// One column of a label file, optionally with its index column.
#[derive(Debug, Clone)]
pub struct LabelColumn {
    pub index: Option<Vec<String>>,
    pub values: Vec<MetadataValue>,
}

impl LabelColumn {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Read `class_label` (and `index_col`, when given) from a delimited label file.
pub fn read_label_column(
    path: &Path,
    sep: u8,
    index_col: Option<&str>,
    class_label: &str,
) -> Result<LabelColumn> {
    let mut reader = csv_reader(path, sep)?;
    let headers = reader.headers()?.clone();
    let source_name = path.display().to_string();

    let label_idx = headers
        .iter()
        .position(|h| h == class_label)
        .ok_or_else(|| SimsError::MissingColumn {
            column: class_label.to_string(),
            source_name: source_name.clone(),
        })?;
    let index_idx = match index_col {
        Some(col) => Some(headers.iter().position(|h| h == col).ok_or_else(|| {
            SimsError::MissingColumn {
                column: col.to_string(),
                source_name: source_name.clone(),
            }
        })?),
        None => None,
    };

    let mut index = index_idx.map(|_| Vec::new());
    let mut values = Vec::new();
    for result in reader.records() {
        let record = result?;
        values.push(MetadataValue::parse(record.get(label_idx).unwrap_or("")));
        if let (Some(idx), Some(names)) = (index_idx, index.as_mut()) {
            names.push(record.get(idx).unwrap_or("").to_string());
        }
    }

    Ok(LabelColumn { index, values })
}

/// Number of data rows (header excluded) of a delimited file.
pub fn count_rows(path: &Path, sep: u8) -> Result<usize> {
    let mut reader = csv_reader(path, sep)?;
    let mut n = 0;
    for result in reader.records() {
        result?;
        n += 1;
    }
    Ok(n)
}

fn csv_reader(path: &Path, sep: u8) -> Result<csv::Reader<File>> {
    let file = File::open(path).map_err(|e| SimsError::io(path, e))?;
    Ok(csv::ReaderBuilder::new().delimiter(sep).from_reader(file))
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

fn load_csv(path: &Path, options: &MatrixOptions) -> Result<AnnotatedMatrix> {
    let mut reader = csv_reader(path, options.sep)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let index_idx = match &options.index_col {
        Some(col) => Some(headers.iter().position(|h| h == col).ok_or_else(|| {
            SimsError::MissingColumn {
                column: col.clone(),
                source_name: path.display().to_string(),
            }
        })?),
        None => None,
    };

    let records = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;

    // A column is a feature when every non-empty cell parses as a number.
    let feature_cols: Vec<usize> = (0..headers.len())
        .filter(|&c| Some(c) != index_idx && !options.is_metadata(&headers[c]))
        .filter(|&c| {
            records.iter().all(|r| {
                let cell = r.get(c).unwrap_or("").trim();
                cell.is_empty() || cell.parse::<f32>().is_ok()
            })
        })
        .collect();

    let n_rows = records.len();
    let x = Array2::from_shape_fn((n_rows, feature_cols.len()), |(i, j)| {
        records[i]
            .get(feature_cols[j])
            .and_then(|cell| cell.trim().parse::<f32>().ok())
            .unwrap_or(0.0)
    });

    let obs_names = match index_idx {
        Some(idx) => records
            .iter()
            .map(|r| r.get(idx).unwrap_or("").to_string())
            .collect(),
        None => (0..n_rows).map(|i| i.to_string()).collect(),
    };
    let var_names = feature_cols.iter().map(|&c| headers[c].clone()).collect();

    let mut obs = BTreeMap::new();
    for (col_idx, name) in headers.iter().enumerate() {
        if Some(col_idx) == index_idx || feature_cols.contains(&col_idx) {
            continue;
        }
        let values = records
            .iter()
            .map(|r| MetadataValue::parse(r.get(col_idx).unwrap_or("")))
            .collect();
        obs.insert(name.clone(), values);
    }

    let mut matrix = AnnotatedMatrix::new(x, obs_names, var_names)?;
    matrix.obs = obs;
    Ok(matrix)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file in wide layout.
///
/// Works with files written by **Pandas** (`df.to_parquet()`, categoricals become
/// dictionary columns) and **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path, options: &MatrixOptions) -> Result<AnnotatedMatrix> {
    let file = File::open(path).map_err(|e| SimsError::io(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut var_names: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<f32>> = Vec::new();
    let mut obs_names: Vec<String> = Vec::new();
    let mut obs: BTreeMap<String, Vec<MetadataValue>> = BTreeMap::new();
    let mut n_rows = 0;
    let mut first_batch = true;

    for batch_result in reader {
        let batch = batch_result?;
        let schema = batch.schema();

        let index_idx = match &options.index_col {
            Some(col) => Some(schema.index_of(col).map_err(|_| SimsError::MissingColumn {
                column: col.clone(),
                source_name: path.display().to_string(),
            })?),
            None => None,
        };

        let mut feature = 0;
        for (col_idx, field) in schema.fields().iter().enumerate() {
            let col = batch.column(col_idx);
            if Some(col_idx) == index_idx {
                obs_names.extend(extract_strings(col)?);
            } else if is_numeric(field.data_type()) && !options.is_metadata(field.name()) {
                if first_batch {
                    var_names.push(field.name().clone());
                    columns.push(Vec::new());
                }
                let values = columns.get_mut(feature).ok_or_else(|| {
                    SimsError::ShapeMismatch(format!(
                        "record batch has more feature columns than the first one ({})",
                        field.name()
                    ))
                })?;
                values.extend(extract_f32(col)?);
                feature += 1;
            } else {
                let values = obs.entry(field.name().clone()).or_default();
                values.extend((0..col.len()).map(|row| extract_metadata_value(col, row)));
            }
        }
        if index_idx.is_none() {
            obs_names.extend((n_rows..n_rows + batch.num_rows()).map(|i| i.to_string()));
        }
        n_rows += batch.num_rows();
        first_batch = false;
    }

    if columns.iter().any(|c| c.len() != n_rows) {
        return Err(SimsError::ShapeMismatch(format!(
            "{}: feature columns differ in length across record batches",
            path.display()
        )));
    }
    let x = Array2::from_shape_fn((n_rows, columns.len()), |(i, j)| columns[j][i]);

    let mut matrix = AnnotatedMatrix::new(x, obs_names, var_names)?;
    for (name, values) in obs {
        matrix = matrix.with_obs_column(name, values)?;
    }
    Ok(matrix)
}

// -- Parquet / Arrow helpers --

fn is_numeric(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float16
            | DataType::Float32
            | DataType::Float64
    )
}

/// Cast a numeric column to `f32`; nulls become zero counts.
fn extract_f32(col: &ArrayRef) -> Result<Vec<f32>> {
    let casted = cast(col, &DataType::Float32)?;
    Ok(casted
        .as_primitive::<Float32Type>()
        .iter()
        .map(|v| v.unwrap_or(0.0))
        .collect())
}

fn extract_strings(col: &ArrayRef) -> Result<Vec<String>> {
    let casted = cast(col, &DataType::Utf8)?;
    Ok(casted
        .as_string::<i32>()
        .iter()
        .map(|v| v.unwrap_or("").to_string())
        .collect())
}

/// Extract a single metadata value from an Arrow column at a given row.
fn extract_metadata_value(col: &ArrayRef, row: usize) -> MetadataValue {
    if col.is_null(row) {
        return MetadataValue::Null;
    }
    match col.data_type() {
        DataType::Boolean => match col.as_any().downcast_ref::<BooleanArray>() {
            Some(arr) => MetadataValue::Bool(arr.value(row)),
            None => MetadataValue::Null,
        },
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            match cast(&col.slice(row, 1), &DataType::Int64) {
                Ok(a) => MetadataValue::Integer(a.as_primitive::<Int64Type>().value(0)),
                Err(_) => MetadataValue::Null,
            }
        }
        dt if is_numeric(dt) => match cast(&col.slice(row, 1), &DataType::Float64) {
            Ok(a) => MetadataValue::Float(a.as_primitive::<Float64Type>().value(0)),
            Err(_) => MetadataValue::Null,
        },
        _ => match cast(&col.slice(row, 1), &DataType::Utf8) {
            Ok(a) => MetadataValue::String(a.as_string::<i32>().value(0).to_string()),
            Err(_) => MetadataValue::String(format!("{:?}", col.data_type())),
        },
    }
}
