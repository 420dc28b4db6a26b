//! Design matrix construction.
//!
//! Column layout: one indicator per batch level (no intercept), then for
//! every categorical covariate one indicator per level except the first,
//! then continuous covariates verbatim. Levels are sorted numerically when
//! every label parses as a number, lexically otherwise.

use crate::combat::matrix::Matrix;
use crate::domain::model::{CovariateRow, CovariateTable};
use crate::utils::error::{HarmonizeError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalEncoding {
    pub name: String,
    pub levels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateEncoding {
    pub batch_col: String,
    pub batch_levels: Vec<String>,
    pub categorical: Vec<CategoricalEncoding>,
    pub continuous: Vec<String>,
}

impl CovariateEncoding {
    pub fn from_table(table: &CovariateTable) -> Result<Self> {
        let batch_levels = sorted_levels(&table.batches);
        if batch_levels.len() < 2 {
            return Err(HarmonizeError::CovariateError {
                column: table.batch_col.clone(),
                message: format!(
                    "found {} batch level(s); at least two sites are needed",
                    batch_levels.len()
                ),
            });
        }

        let categorical = table
            .categorical
            .iter()
            .map(|c| CategoricalEncoding {
                name: c.name.clone(),
                levels: sorted_levels(&c.values),
            })
            .collect();

        Ok(Self {
            batch_col: table.batch_col.clone(),
            batch_levels,
            categorical,
            continuous: table.continuous.iter().map(|c| c.name.clone()).collect(),
        })
    }

    pub fn n_batches(&self) -> usize {
        self.batch_levels.len()
    }

    pub fn n_columns(&self) -> usize {
        self.n_batches()
            + self
                .categorical
                .iter()
                .map(|c| c.levels.len().saturating_sub(1))
                .sum::<usize>()
            + self.continuous.len()
    }

    pub fn batch_index(&self, label: &str) -> Result<usize> {
        self.batch_levels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| HarmonizeError::CovariateError {
                column: self.batch_col.clone(),
                message: format!("batch '{}' was not seen when the model was fitted", label),
            })
    }

    /// Encodes one subject; the first `n_batches()` entries are the batch indicators.
    pub fn encode_row(&self, row: &CovariateRow<'_>) -> Result<Vec<f64>> {
        if row.categorical.len() != self.categorical.len()
            || row.continuous.len() != self.continuous.len()
        {
            return Err(HarmonizeError::ValidationError {
                message: format!(
                    "covariate row has {} categorical and {} continuous values, expected {} and {}",
                    row.categorical.len(),
                    row.continuous.len(),
                    self.categorical.len(),
                    self.continuous.len()
                ),
            });
        }

        let mut encoded = vec![0.0; self.n_columns()];
        encoded[self.batch_index(row.batch)?] = 1.0;

        let mut offset = self.n_batches();
        for (encoding, value) in self.categorical.iter().zip(&row.categorical) {
            let level = encoding
                .levels
                .iter()
                .position(|l| l == value)
                .ok_or_else(|| HarmonizeError::CovariateError {
                    column: encoding.name.clone(),
                    message: format!("level '{}' was not seen when the model was fitted", value),
                })?;
            // 第一個水準為參考組，不產生欄位
            if level > 0 {
                encoded[offset + level - 1] = 1.0;
            }
            offset += encoding.levels.len().saturating_sub(1);
        }

        for (i, value) in row.continuous.iter().enumerate() {
            encoded[offset + i] = *value;
        }

        Ok(encoded)
    }
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub encoding: CovariateEncoding,
    pub matrix: Matrix,
    /// Batch level index of each subject.
    pub batch_of: Vec<usize>,
}

impl DesignMatrix {
    pub fn n_subjects(&self) -> usize {
        self.matrix.rows()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.encoding.n_batches()];
        for &b in &self.batch_of {
            sizes[b] += 1;
        }
        sizes
    }

    /// Subject indices belonging to each batch level.
    pub fn batch_members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.encoding.n_batches()];
        for (i, &b) in self.batch_of.iter().enumerate() {
            members[b].push(i);
        }
        members
    }
}

pub fn build_design(table: &CovariateTable) -> Result<DesignMatrix> {
    let encoding = CovariateEncoding::from_table(table)?;
    let mut matrix = Matrix::zeros(table.len(), encoding.n_columns());
    let mut batch_of = Vec::with_capacity(table.len());

    for i in 0..table.len() {
        let row = table.row(i);
        let encoded = encoding.encode_row(&row)?;
        batch_of.push(encoding.batch_index(row.batch)?);
        matrix.row_mut(i).copy_from_slice(&encoded);
    }

    tracing::debug!(
        "Design matrix: {} subjects x {} columns ({} batches)",
        matrix.rows(),
        matrix.cols(),
        encoding.n_batches()
    );

    Ok(DesignMatrix {
        encoding,
        matrix,
        batch_of,
    })
}

fn sorted_levels(values: &[String]) -> Vec<String> {
    let mut levels: Vec<String> = values.to_vec();
    levels.sort_by(|a, b| compare_labels(a, b));
    levels.dedup();
    levels
}

fn compare_labels(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CategoricalColumn, ContinuousColumn};

    fn covariates() -> CovariateTable {
        CovariateTable {
            index_name: "subj".into(),
            subject_ids: (1..=4).map(|i| format!("sub-{}", i)).collect(),
            batch_col: "site".into(),
            batches: vec!["10".into(), "2".into(), "10".into(), "2".into()],
            categorical: vec![CategoricalColumn {
                name: "diagnosis".into(),
                values: vec!["OCD".into(), "HC".into(), "HC".into(), "OCD".into()],
            }],
            continuous: vec![ContinuousColumn {
                name: "age".into(),
                values: vec![21.0, 35.5, 40.0, 28.0],
            }],
        }
    }

    #[test]
    fn test_numeric_levels_sort_numerically() {
        let design = build_design(&covariates()).unwrap();
        assert_eq!(design.encoding.batch_levels, vec!["2", "10"]);
        assert_eq!(design.batch_of, vec![1, 0, 1, 0]);
        assert_eq!(design.batch_sizes(), vec![2, 2]);
    }

    #[test]
    fn test_design_layout() {
        let design = build_design(&covariates()).unwrap();
        // 2 batches + (2 diagnosis levels - 1) + age
        assert_eq!(design.matrix.cols(), 4);
        assert_eq!(design.matrix.row(0), &[0.0, 1.0, 1.0, 21.0]);
        assert_eq!(design.matrix.row(1), &[1.0, 0.0, 0.0, 35.5]);
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        let design = build_design(&covariates()).unwrap();
        let row = CovariateRow {
            batch: "2",
            categorical: vec!["MDD"],
            continuous: vec![30.0],
        };
        assert!(matches!(
            design.encoding.encode_row(&row),
            Err(HarmonizeError::CovariateError { .. })
        ));
    }

    #[test]
    fn test_single_batch_is_rejected() {
        let mut table = covariates();
        table.batches = vec!["A".into(); 4];
        assert!(build_design(&table).is_err());
    }
}
