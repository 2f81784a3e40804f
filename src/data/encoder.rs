use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimsError};

/// Bidirectional mapping between label strings and class indices.
///
/// Classes are ordered lexicographically, or numerically when every label
/// parses as a number and the encoder was built with `numeric = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelEncoder {
    classes: Vec<String>,
    index: HashMap<String, usize>,
}

impl From<Vec<String>> for LabelEncoder {
    fn from(classes: Vec<String>) -> Self {
        Self::from_classes(classes)
    }
}

impl From<LabelEncoder> for Vec<String> {
    fn from(encoder: LabelEncoder) -> Self {
        encoder.classes
    }
}

impl LabelEncoder {
    /// Fit an encoder on the labels it should know about.
    pub fn fit<I, S>(labels: I, numeric: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = labels.into_iter().map(|l| l.as_ref().to_string()).collect();
        let mut classes: Vec<String> = unique.into_iter().collect();

        if numeric {
            let mut keyed = classes
                .iter()
                .map(|c| {
                    c.parse::<f64>().map(|v| (v, c.clone())).map_err(|_| {
                        SimsError::InvalidConfig(format!(
                            "assume_numeric_label is set but label '{c}' is not numeric"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            classes = keyed.into_iter().map(|(_, c)| c).collect();
        }

        Ok(Self::from_classes(classes))
    }

    /// Rebuild an encoder from an ordered class list (e.g. a checkpoint).
    pub fn from_classes(classes: Vec<String>) -> Self {
        let index = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { classes, index }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn encode(&self, label: &str) -> Result<usize> {
        self.index
            .get(label)
            .copied()
            .ok_or_else(|| SimsError::UnknownLabel(label.to_string()))
    }

    pub fn decode(&self, class: usize) -> Result<&str> {
        self.classes
            .get(class)
            .map(String::as_str)
            .ok_or(SimsError::UnknownClass(class))
    }

    pub fn encode_all<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>> {
        labels.iter().map(|l| self.encode(l.as_ref())).collect()
    }

    pub fn decode_all(&self, classes: &[usize]) -> Result<Vec<String>> {
        classes
            .iter()
            .map(|&c| self.decode(c).map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let labels = ["Vip", "Sst", "L2/3 IT", "Sst", "Vip"];
        let enc = LabelEncoder::fit(labels, false).unwrap();
        assert_eq!(enc.classes(), &["L2/3 IT", "Sst", "Vip"]);

        let encoded = enc.encode_all(&labels).unwrap();
        assert_eq!(encoded, vec![2, 1, 0, 1, 2]);
        assert_eq!(enc.decode_all(&encoded).unwrap(), labels.to_vec());
    }

    #[test]
    fn numeric_labels_sort_by_value() {
        let enc = LabelEncoder::fit(["10", "2", "1"], true).unwrap();
        assert_eq!(enc.classes(), &["1", "2", "10"]);
        assert!(LabelEncoder::fit(["1", "x"], true).is_err());
    }

    #[test]
    fn unknown_values_are_errors() {
        let enc = LabelEncoder::fit(["a", "b"], false).unwrap();
        assert!(matches!(enc.encode("c"), Err(SimsError::UnknownLabel(_))));
        assert!(matches!(enc.decode(2), Err(SimsError::UnknownClass(2))));
    }

    #[test]
    fn serializes_as_class_list() {
        let enc = LabelEncoder::fit(["a", "b"], false).unwrap();
        let json = serde_json::to_string(&enc).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: LabelEncoder = serde_json::from_str(&json).unwrap();
        assert_eq!(back.encode("b").unwrap(), 1);
    }
}
