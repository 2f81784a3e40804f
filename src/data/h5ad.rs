//! AnnData `.h5ad` reader.
//!
//! Layout read here (anndata >= 0.8 encoding):
//! ```text
//! /X                      dense [cells, genes] dataset, or a group with
//!                         encoding-type csr_matrix/csc_matrix, data, indices,
//!                         indptr and a `shape` attribute
//! /obs/_index             cell names (the group's `_index` attribute names it)
//! /obs/<column>           plain dataset, or categorical group: categories + codes
//! /var/_index             gene names
//! ```

use std::path::Path;

use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, Group};
use log::debug;
use ndarray::Array2;

use super::loader::MatrixOptions;
use super::model::{AnnotatedMatrix, MetadataValue};
use crate::error::{Result, SimsError};

/// Load `X`, the obs/var names and the obs columns named in
/// `options.metadata_columns`. `index_col` is ignored: cell names come from
/// the obs index.
pub fn load_h5ad(path: &Path, options: &MatrixOptions) -> Result<AnnotatedMatrix> {
    let file = hdf5::File::open(path)?;
    let x = read_x(&file)?;
    let obs = file.group("obs")?;
    let obs_names = read_index(&obs)?;
    let var_names = read_index(&file.group("var")?)?;

    let mut matrix = AnnotatedMatrix::new(x, obs_names, var_names)?;
    for column in &options.metadata_columns {
        if !obs.link_exists(column) {
            debug!("{} has no obs column '{column}'", path.display());
            continue;
        }
        let values = read_obs_column(&obs, column)?;
        matrix = matrix.with_obs_column(column.clone(), values)?;
    }
    Ok(matrix)
}

fn read_x(file: &hdf5::File) -> Result<Array2<f32>> {
    if let Ok(dataset) = file.dataset("X") {
        let (rows, cols) = match dataset.shape().as_slice() {
            &[rows, cols] => (rows, cols),
            other => {
                return Err(SimsError::ShapeMismatch(format!("X has shape {other:?}, expected 2-D")))
            }
        };
        let values = dataset.read_raw::<f32>()?;
        return Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| SimsError::ShapeMismatch(e.to_string()));
    }

    let group = file.group("X")?;
    let encoding = read_string_attr(&group, "encoding-type")?;
    let shape = group.attr("shape")?.read_raw::<u64>()?;
    let (rows, cols) = match shape.as_slice() {
        &[rows, cols] => (to_usize(rows)?, to_usize(cols)?),
        other => return Err(SimsError::ShapeMismatch(format!("X shape attribute {other:?}"))),
    };
    let data = group.dataset("data")?.read_raw::<f32>()?;
    let indices = read_offsets(&group.dataset("indices")?)?;
    let indptr = read_offsets(&group.dataset("indptr")?)?;

    let (major, minor) = match encoding.as_str() {
        "csr_matrix" => (rows, cols),
        "csc_matrix" => (cols, rows),
        other => return Err(SimsError::UnsupportedFormat(format!("X encoding '{other}'"))),
    };
    check_compressed(&data, &indices, &indptr, major, minor)?;

    let mut x = Array2::zeros((rows, cols));
    for (outer, bounds) in indptr.windows(2).enumerate() {
        for k in bounds[0]..bounds[1] {
            let inner = indices[k];
            let cell = if encoding == "csr_matrix" {
                [outer, inner]
            } else {
                [inner, outer]
            };
            x[cell] = data[k];
        }
    }
    Ok(x)
}

/// Reject compressed-sparse arrays whose offsets would index out of bounds.
fn check_compressed(
    data: &[f32],
    indices: &[usize],
    indptr: &[usize],
    major: usize,
    minor: usize,
) -> Result<()> {
    let bad = |what: &str| Err(SimsError::ShapeMismatch(format!("sparse X: {what}")));
    if indptr.len() != major + 1 {
        return bad(&format!("indptr has {} entries for {major} rows", indptr.len()));
    }
    if indices.len() != data.len() || indptr.last() != Some(&data.len()) {
        return bad("indices, data and indptr disagree on the number of values");
    }
    if indptr.windows(2).any(|w| w[0] > w[1]) {
        return bad("indptr is not monotone");
    }
    if indices.iter().any(|&i| i >= minor) {
        return bad("index out of range");
    }
    Ok(())
}

fn read_index(group: &Group) -> Result<Vec<String>> {
    let key = if group.attr_names()?.iter().any(|a| a == "_index") {
        read_string_attr(group, "_index")?
    } else {
        "_index".to_string()
    };
    read_strings(&group.dataset(&key)?)
}

fn read_obs_column(obs: &Group, name: &str) -> Result<Vec<MetadataValue>> {
    if let Ok(group) = obs.group(name) {
        let categories = read_values(&group.dataset("categories")?)?;
        let codes = group.dataset("codes")?.read_raw::<i64>()?;
        // Code -1 marks a missing value.
        return Ok(codes
            .into_iter()
            .map(|code| {
                usize::try_from(code)
                    .ok()
                    .and_then(|c| categories.get(c).cloned())
                    .unwrap_or(MetadataValue::Null)
            })
            .collect());
    }
    read_values(&obs.dataset(name)?)
}

fn read_values(dataset: &Dataset) -> Result<Vec<MetadataValue>> {
    let values = match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => dataset
            .read_raw::<i64>()?
            .into_iter()
            .map(MetadataValue::Integer)
            .collect(),
        TypeDescriptor::Float(_) => dataset
            .read_raw::<f64>()?
            .into_iter()
            .map(|v| if v.is_nan() { MetadataValue::Null } else { MetadataValue::Float(v) })
            .collect(),
        TypeDescriptor::Boolean => dataset
            .read_raw::<bool>()?
            .into_iter()
            .map(MetadataValue::Bool)
            .collect(),
        _ => read_strings(dataset)?
            .into_iter()
            .map(|s| if s.is_empty() { MetadataValue::Null } else { MetadataValue::String(s) })
            .collect(),
    };
    Ok(values)
}

fn read_strings(dataset: &Dataset) -> Result<Vec<String>> {
    let strings = match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenAscii => dataset
            .read_raw::<VarLenAscii>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        _ => dataset
            .read_raw::<VarLenUnicode>()?
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
    };
    Ok(strings)
}

fn read_string_attr(group: &Group, name: &str) -> Result<String> {
    Ok(group.attr(name)?.read_scalar::<VarLenUnicode>()?.as_str().to_string())
}

fn read_offsets(dataset: &Dataset) -> Result<Vec<usize>> {
    dataset.read_raw::<u64>()?.into_iter().map(to_usize).collect()
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| SimsError::ShapeMismatch(format!("offset {v} overflows usize")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::load_matrix;

    fn unicode(values: &[&str]) -> Vec<VarLenUnicode> {
        values.iter().map(|v| v.parse().unwrap()).collect()
    }

    fn write_index(group: &Group, names: &[&str]) {
        group
            .new_dataset_builder()
            .with_data(unicode(names).as_slice())
            .create("_index")
            .unwrap();
        group
            .new_attr::<VarLenUnicode>()
            .shape(())
            .create("_index")
            .unwrap()
            .write_scalar(&"_index".parse::<VarLenUnicode>().unwrap())
            .unwrap();
    }

    /// 3 cells x 4 genes, CSR `X`, categorical `subclass_label` with one missing value.
    fn write_sparse(path: &Path) {
        let file = hdf5::File::create(path).unwrap();
        let x = file.create_group("X").unwrap();
        x.new_attr::<VarLenUnicode>()
            .shape(())
            .create("encoding-type")
            .unwrap()
            .write_scalar(&"csr_matrix".parse::<VarLenUnicode>().unwrap())
            .unwrap();
        x.new_attr_builder()
            .with_data([3u64, 4].as_slice())
            .create("shape")
            .unwrap();
        x.new_dataset_builder()
            .with_data([1.0f32, 2.0, 3.0].as_slice())
            .create("data")
            .unwrap();
        x.new_dataset_builder()
            .with_data([0i32, 3, 1].as_slice())
            .create("indices")
            .unwrap();
        x.new_dataset_builder()
            .with_data([0i32, 2, 2, 3].as_slice())
            .create("indptr")
            .unwrap();

        let obs = file.create_group("obs").unwrap();
        write_index(&obs, &["c0", "c1", "c2"]);
        let labels = obs.create_group("subclass_label").unwrap();
        labels
            .new_dataset_builder()
            .with_data(unicode(&["Sst", "Vip"]).as_slice())
            .create("categories")
            .unwrap();
        labels
            .new_dataset_builder()
            .with_data([1i8, -1, 0].as_slice())
            .create("codes")
            .unwrap();
        obs.new_dataset_builder()
            .with_data([0.5f64, 1.5, 2.5].as_slice())
            .create("n_counts")
            .unwrap();

        let var = file.create_group("var").unwrap();
        write_index(&var, &["GAD1", "SST", "VIP", "PVALB"]);
    }

    #[test]
    fn sparse_x_and_categorical_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("human.h5ad");
        write_sparse(&path);

        let options = MatrixOptions {
            metadata_columns: vec!["subclass_label".into(), "n_counts".into(), "absent".into()],
            ..Default::default()
        };
        let m = load_matrix(&path, &options).unwrap();
        assert_eq!(m.obs_names, vec!["c0", "c1", "c2"]);
        assert_eq!(m.var_names, vec!["GAD1", "SST", "VIP", "PVALB"]);
        assert_eq!(m.x.row(0).to_vec(), vec![1.0, 0.0, 0.0, 2.0]);
        assert_eq!(m.x.row(1).to_vec(), vec![0.0; 4]);
        assert_eq!(m.x[[2, 1]], 3.0);

        let labels = m.obs_column("subclass_label").unwrap();
        assert_eq!(labels[0], MetadataValue::String("Vip".into()));
        assert_eq!(labels[1], MetadataValue::Null);
        assert_eq!(m.obs_column("n_counts").unwrap()[2], MetadataValue::Float(2.5));
        assert!(m.obs_column("absent").is_none());
    }

    #[test]
    fn dense_x_is_read_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dense.h5ad");
        {
            let file = hdf5::File::create(&path).unwrap();
            file.new_dataset::<f32>()
                .shape([2, 3])
                .create("X")
                .unwrap()
                .write_raw([1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0].as_slice())
                .unwrap();
            write_index(&file.create_group("obs").unwrap(), &["a", "b"]);
            write_index(&file.create_group("var").unwrap(), &["g0", "g1", "g2"]);
        }

        let m = load_matrix(&path, &MatrixOptions::default()).unwrap();
        assert_eq!(m.x.dim(), (2, 3));
        assert_eq!(m.x[[1, 0]], 4.0);
    }

    #[test]
    fn out_of_range_sparse_indices_are_rejected() {
        let err = check_compressed(&[1.0], &[7], &[0, 1], 1, 4).unwrap_err();
        assert!(matches!(err, SimsError::ShapeMismatch(_)));
    }
}
