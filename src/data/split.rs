use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimsError};

/// Draw `floor(prop * total)` unique row indices uniformly, without replacement.
pub fn subsample<R: Rng + ?Sized>(total: usize, prop: f64, rng: &mut R) -> Result<Vec<usize>> {
    if !(prop > 0.0 && prop <= 1.0) {
        return Err(SimsError::InvalidConfig(format!(
            "proportion must be in (0, 1], got {prop}"
        )));
    }
    let amount = (prop * total as f64).floor() as usize;
    Ok(rand::seq::index::sample(rng, total, amount.min(total)).into_vec())
}

/// Row indices of the train / validation / test partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splits {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl Splits {
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition `0..labels.len()` into train/val/test.
///
/// With `stratify`, each class is shuffled and cut separately so every
/// partition keeps the class proportions (up to rounding).
pub fn split_indices<R: Rng + ?Sized>(
    labels: &[usize],
    val_prop: f64,
    test_prop: f64,
    stratify: bool,
    rng: &mut R,
) -> Result<Splits> {
    if val_prop < 0.0 || test_prop < 0.0 || val_prop + test_prop >= 1.0 {
        return Err(SimsError::InvalidConfig(format!(
            "val_prop ({val_prop}) and test_prop ({test_prop}) must be non-negative and sum below 1"
        )));
    }

    let groups: Vec<Vec<usize>> = if stratify {
        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (row, &class) in labels.iter().enumerate() {
            by_class.entry(class).or_default().push(row);
        }
        by_class.into_values().collect()
    } else {
        vec![(0..labels.len()).collect()]
    };

    let mut splits = Splits::default();
    for mut rows in groups {
        rows.shuffle(rng);
        let n = rows.len();
        let n_test = (n as f64 * test_prop).round() as usize;
        let n_val = ((n as f64 * val_prop).round() as usize).min(n - n_test);
        splits.test.extend_from_slice(&rows[..n_test]);
        splits.val.extend_from_slice(&rows[n_test..n_test + n_val]);
        splits.train.extend_from_slice(&rows[n_test + n_val..]);
    }
    Ok(splits)
}

/// "Balanced" class weights: `n / (k * count_c)`. Classes without samples get 0.
pub fn class_weights(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; num_classes];
    for &c in labels {
        if c < num_classes {
            counts[c] += 1;
        }
    }
    let n = labels.len() as f32;
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                n / (num_classes as f32 * count as f32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn subsample_rejects_out_of_range_props() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(subsample(10, 0.0, &mut rng).is_err());
        assert!(subsample(10, 1.5, &mut rng).is_err());
        assert!(subsample(10, f64::NAN, &mut rng).is_err());
        assert_eq!(subsample(10, 1.0, &mut rng).unwrap().len(), 10);
    }

    #[test]
    fn split_covers_every_row_once() {
        let labels: Vec<usize> = (0..100).map(|i| i % 3).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let s = split_indices(&labels, 0.1, 0.2, false, &mut rng).unwrap();

        assert_eq!(s.len(), 100);
        assert_eq!(s.test.len(), 20);
        assert_eq!(s.val.len(), 10);
        let all: HashSet<usize> = s.train.iter().chain(&s.val).chain(&s.test).copied().collect();
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn stratified_split_keeps_every_class_in_train() {
        let mut labels = vec![0usize; 90];
        labels.extend(vec![1usize; 10]);
        let mut rng = StdRng::seed_from_u64(1);
        let s = split_indices(&labels, 0.1, 0.1, true, &mut rng).unwrap();

        let minority_in_test = s.test.iter().filter(|&&r| labels[r] == 1).count();
        let minority_in_train = s.train.iter().filter(|&&r| labels[r] == 1).count();
        assert_eq!(minority_in_test, 1);
        assert_eq!(minority_in_train, 8);
    }

    #[test]
    fn split_rejects_props_summing_to_one() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(split_indices(&[0, 1], 0.5, 0.5, false, &mut rng).is_err());
    }

    #[test]
    fn balanced_weights() {
        let w = class_weights(&[0, 0, 0, 1], 3);
        assert!((w[0] - 4.0 / 9.0).abs() < 1e-6);
        assert!((w[1] - 4.0 / 3.0).abs() < 1e-6);
        assert_eq!(w[2], 0.0);
    }
}
