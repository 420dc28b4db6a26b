use crate::combat::matrix::Matrix;
use crate::utils::error::{HarmonizeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalColumn {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// 每位受試者一列：站點標籤、類別型與連續型共變數
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateTable {
    pub index_name: String,
    pub subject_ids: Vec<String>,
    pub batch_col: String,
    pub batches: Vec<String>,
    pub categorical: Vec<CategoricalColumn>,
    pub continuous: Vec<ContinuousColumn>,
}

/// A single subject's covariates, in the column order of its table.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateRow<'a> {
    pub batch: &'a str,
    pub categorical: Vec<&'a str>,
    pub continuous: Vec<f64>,
}

impl CovariateTable {
    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn row(&self, i: usize) -> CovariateRow<'_> {
        CovariateRow {
            batch: &self.batches[i],
            categorical: self.categorical.iter().map(|c| c.values[i].as_str()).collect(),
            continuous: self.continuous.iter().map(|c| c.values[i]).collect(),
        }
    }

    /// Returns a new table whose rows are `indices` of this one, in that order.
    pub fn select(&self, indices: &[usize]) -> CovariateTable {
        CovariateTable {
            index_name: self.index_name.clone(),
            subject_ids: indices.iter().map(|&i| self.subject_ids[i].clone()).collect(),
            batch_col: self.batch_col.clone(),
            batches: indices.iter().map(|&i| self.batches[i].clone()).collect(),
            categorical: self
                .categorical
                .iter()
                .map(|c| CategoricalColumn {
                    name: c.name.clone(),
                    values: indices.iter().map(|&i| c.values[i].clone()).collect(),
                })
                .collect(),
            continuous: self
                .continuous
                .iter()
                .map(|c| ContinuousColumn {
                    name: c.name.clone(),
                    values: indices.iter().map(|&i| c.values[i]).collect(),
                })
                .collect(),
        }
    }

    /// 依受試者編號重新排序，使其與 `ids` 的順序一致
    pub fn aligned_to(&self, ids: &[String]) -> Result<CovariateTable> {
        let positions = self.positions_by_id()?;
        let mut indices = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match positions.get(id.as_str()) {
                Some(&i) => indices.push(i),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(HarmonizeError::SubjectMismatchError {
                message: format!(
                    "{} subject(s) have no covariate row: {}",
                    missing.len(),
                    preview(&missing)
                ),
            });
        }
        Ok(self.select(&indices))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.subject_ids.iter().any(|s| s == id)
    }

    fn positions_by_id(&self) -> Result<HashMap<&str, usize>> {
        let mut positions = HashMap::with_capacity(self.len());
        for (i, id) in self.subject_ids.iter().enumerate() {
            if positions.insert(id.as_str(), i).is_some() {
                return Err(HarmonizeError::SubjectMismatchError {
                    message: format!("subject '{}' appears more than once in covariates", id),
                });
            }
        }
        Ok(positions)
    }

    /// Number of subjects per batch label, sorted by label.
    pub fn batch_counts(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for b in &self.batches {
            *counts.entry(b.as_str()).or_insert(0) += 1;
        }
        let mut counts: Vec<(String, usize)> =
            counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        counts.sort();
        counts
    }
}

/// Subjects × features measurements with their identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementTable {
    pub index_name: String,
    pub subject_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub values: Matrix,
}

impl MeasurementTable {
    pub fn n_subjects(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn select(&self, indices: &[usize]) -> Result<MeasurementTable> {
        let mut data = Vec::with_capacity(indices.len() * self.n_features());
        for &i in indices {
            data.extend_from_slice(self.values.row(i));
        }
        Ok(MeasurementTable {
            index_name: self.index_name.clone(),
            subject_ids: indices.iter().map(|&i| self.subject_ids[i].clone()).collect(),
            feature_names: self.feature_names.clone(),
            values: Matrix::from_vec(indices.len(), self.n_features(), data)?,
        })
    }

    pub fn with_values(&self, values: Matrix) -> MeasurementTable {
        MeasurementTable {
            index_name: self.index_name.clone(),
            subject_ids: self.subject_ids.clone(),
            feature_names: self.feature_names.clone(),
            values,
        }
    }
}

/// 一位受試者的影像檔
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub label: String,
    pub subjects: usize,
    pub mean_gamma_star: f64,
    pub mean_delta_star: f64,
}

/// Written next to the outputs after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonizationReport {
    pub mode: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub subjects: usize,
    pub features: usize,
    pub constant_features: usize,
    pub batch_col: String,
    pub categorical_cols: Vec<String>,
    pub continuous_cols: Vec<String>,
    pub empirical_bayes: bool,
    pub parametric: bool,
    pub mean_only: bool,
    pub reference_batch: Option<String>,
    pub batches: Vec<BatchSummary>,
    pub mask_voxels: Option<usize>,
    pub outputs: Vec<String>,
}

pub(crate) fn preview(ids: &[String]) -> String {
    const SHOWN: usize = 5;
    let mut text = ids.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if ids.len() > SHOWN {
        text.push_str(&format!(", ... (+{} more)", ids.len() - SHOWN));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CovariateTable {
        CovariateTable {
            index_name: "subj".to_string(),
            subject_ids: vec!["s1".into(), "s2".into(), "s3".into()],
            batch_col: "site".to_string(),
            batches: vec!["A".into(), "B".into(), "A".into()],
            categorical: vec![CategoricalColumn {
                name: "sex".into(),
                values: vec!["F".into(), "M".into(), "M".into()],
            }],
            continuous: vec![ContinuousColumn {
                name: "age".into(),
                values: vec![30.0, 41.0, 52.0],
            }],
        }
    }

    #[test]
    fn test_aligned_to_reorders_rows() {
        let aligned = table()
            .aligned_to(&["s3".to_string(), "s1".to_string(), "s2".to_string()])
            .unwrap();
        assert_eq!(aligned.subject_ids, vec!["s3", "s1", "s2"]);
        assert_eq!(aligned.continuous[0].values, vec![52.0, 30.0, 41.0]);
        assert_eq!(aligned.row(0).categorical, vec!["M"]);
    }

    #[test]
    fn test_aligned_to_reports_missing_subjects() {
        let err = table().aligned_to(&["s1".to_string(), "s9".to_string()]).unwrap_err();
        assert!(matches!(err, HarmonizeError::SubjectMismatchError { .. }));
        assert!(err.to_string().contains("s9"));
    }

    #[test]
    fn test_batch_counts() {
        assert_eq!(
            table().batch_counts(),
            vec![("A".to_string(), 2), ("B".to_string(), 1)]
        );
    }
}
