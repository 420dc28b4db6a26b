//! Delimited covariate and measurement tables.

use crate::combat::matrix::Matrix;
use crate::domain::model::{
    CategoricalColumn, ContinuousColumn, CovariateTable, MeasurementTable,
};
use crate::utils::error::{HarmonizeError, Result};
use crate::utils::validation::validate_delimiter;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which covariate columns to read and how to treat them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateColumns {
    pub index_col: String,
    pub batch_col: String,
    #[serde(default)]
    pub categorical_cols: Vec<String>,
    #[serde(default)]
    pub continuous_cols: Vec<String>,
}

/// `.tsv` and `.txt` are tab separated, everything else comma separated,
/// unless a delimiter is given explicitly.
pub fn delimiter_for(path: &Path, forced: Option<char>) -> Result<u8> {
    if let Some(c) = forced {
        validate_delimiter("delimiter", Some(c))?;
        return Ok(c as u8);
    }
    let delimiter = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("tsv") | Some("txt") | Some("tab") => b'\t',
        _ => b',',
    };
    Ok(delimiter)
}

fn open_reader(path: &Path, delimiter: u8) -> Result<csv::Reader<std::fs::File>> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    Ok(reader)
}

fn column_position(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| HarmonizeError::CovariateError {
            column: name.to_string(),
            message: format!(
                "not found in {} (available: {})",
                path.display(),
                headers.iter().collect::<Vec<_>>().join(", ")
            ),
        })
}

fn is_missing(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "na" | "nan" | "n/a" | "null" | "none"
    )
}

pub fn read_covariates(
    path: &Path,
    columns: &CovariateColumns,
    delimiter: Option<char>,
) -> Result<CovariateTable> {
    let mut reader = open_reader(path, delimiter_for(path, delimiter)?)?;
    let headers = reader.headers()?.clone();

    let index_pos = column_position(&headers, &columns.index_col, path)?;
    let batch_pos = column_position(&headers, &columns.batch_col, path)?;
    let categorical_pos = columns
        .categorical_cols
        .iter()
        .map(|c| column_position(&headers, c, path))
        .collect::<Result<Vec<_>>>()?;
    let continuous_pos = columns
        .continuous_cols
        .iter()
        .map(|c| column_position(&headers, c, path))
        .collect::<Result<Vec<_>>>()?;

    let mut subject_ids = Vec::new();
    let mut batches = Vec::new();
    let mut categorical: Vec<Vec<String>> = vec![Vec::new(); categorical_pos.len()];
    let mut continuous: Vec<Vec<f64>> = vec![Vec::new(); continuous_pos.len()];

    for record in reader.records() {
        let record = record?;
        let subject = record.get(index_pos).unwrap_or_default().to_string();

        let required = |pos: usize, column: &str| -> Result<String> {
            let value = record.get(pos).unwrap_or_default();
            if is_missing(value) {
                return Err(HarmonizeError::CovariateError {
                    column: column.to_string(),
                    message: format!("missing value for subject '{}'", subject),
                });
            }
            Ok(value.to_string())
        };

        batches.push(required(batch_pos, &columns.batch_col)?);
        for (values, (&pos, name)) in categorical
            .iter_mut()
            .zip(categorical_pos.iter().zip(&columns.categorical_cols))
        {
            values.push(required(pos, name)?);
        }
        for (values, (&pos, name)) in continuous
            .iter_mut()
            .zip(continuous_pos.iter().zip(&columns.continuous_cols))
        {
            let raw = required(pos, name)?;
            let parsed = raw.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(|| {
                HarmonizeError::CovariateError {
                    column: name.clone(),
                    message: format!("'{}' for subject '{}' is not a number", raw, subject),
                }
            })?;
            values.push(parsed);
        }
        subject_ids.push(subject);
    }

    tracing::debug!(
        "Read {} covariate rows from {}",
        subject_ids.len(),
        path.display()
    );

    Ok(CovariateTable {
        index_name: columns.index_col.clone(),
        subject_ids,
        batch_col: columns.batch_col.clone(),
        batches,
        categorical: columns
            .categorical_cols
            .iter()
            .zip(categorical)
            .map(|(name, values)| CategoricalColumn {
                name: name.clone(),
                values,
            })
            .collect(),
        continuous: columns
            .continuous_cols
            .iter()
            .zip(continuous)
            .map(|(name, values)| ContinuousColumn {
                name: name.clone(),
                values,
            })
            .collect(),
    })
}

/// Every column other than `index_col` is a numeric feature.
pub fn read_measurements(
    path: &Path,
    index_col: &str,
    delimiter: Option<char>,
) -> Result<MeasurementTable> {
    let mut reader = open_reader(path, delimiter_for(path, delimiter)?)?;
    let headers = reader.headers()?.clone();
    let index_pos = column_position(&headers, index_col, path)?;

    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index_pos)
        .map(|(_, h)| h.to_string())
        .collect();

    let mut subject_ids = Vec::new();
    let mut data = Vec::new();

    for record in reader.records() {
        let record = record?;
        let subject = record.get(index_pos).unwrap_or_default().to_string();
        for (i, raw) in record.iter().enumerate() {
            if i == index_pos {
                continue;
            }
            let value = raw.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(|| {
                HarmonizeError::ValidationError {
                    message: format!(
                        "{}: value '{}' in column '{}' for subject '{}' is not a finite number",
                        path.display(),
                        raw,
                        headers.get(i).unwrap_or_default(),
                        subject
                    ),
                }
            })?;
            data.push(value);
        }
        subject_ids.push(subject);
    }

    let values = Matrix::from_vec(subject_ids.len(), feature_names.len(), data)?;

    tracing::debug!(
        "Read {} subjects x {} features from {}",
        values.rows(),
        values.cols(),
        path.display()
    );

    Ok(MeasurementTable {
        index_name: index_col.to_string(),
        subject_ids,
        feature_names,
        values,
    })
}

/// Serializes harmonized measurements as comma separated text, optionally
/// followed by the covariate columns of each subject.
pub fn write_measurements(
    table: &MeasurementTable,
    covariates: Option<&CovariateTable>,
) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());

    let mut header: Vec<String> = Vec::with_capacity(table.n_features() + 1);
    header.push(table.index_name.clone());
    header.extend(table.feature_names.iter().cloned());
    if let Some(cov) = covariates {
        header.push(cov.batch_col.clone());
        header.extend(cov.categorical.iter().map(|c| c.name.clone()));
        header.extend(cov.continuous.iter().map(|c| c.name.clone()));
    }
    writer.write_record(&header)?;

    for (i, subject) in table.subject_ids.iter().enumerate() {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        record.push(subject.clone());
        record.extend(table.values.row(i).iter().map(|v| v.to_string()));
        if let Some(cov) = covariates {
            record.push(cov.batches[i].clone());
            record.extend(cov.categorical.iter().map(|c| c.values[i].clone()));
            record.extend(cov.continuous.iter().map(|c| c.values[i].to_string()));
        }
        writer.write_record(&record)?;
    }

    writer.into_inner().map_err(|e| HarmonizeError::ProcessingError {
        message: format!("failed to flush CSV output: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn columns() -> CovariateColumns {
        CovariateColumns {
            index_col: "subj".into(),
            batch_col: "site".into(),
            categorical_cols: vec!["sex".into()],
            continuous_cols: vec!["age".into()],
        }
    }

    #[test]
    fn test_delimiter_from_extension() {
        assert_eq!(delimiter_for(Path::new("demo_clin_vars.tsv"), None).unwrap(), b'\t');
        assert_eq!(delimiter_for(Path::new("imagingmeasures.csv"), None).unwrap(), b',');
        assert_eq!(delimiter_for(Path::new("demo.tsv"), Some(';')).unwrap(), b';');
        assert!(delimiter_for(Path::new("demo.tsv"), Some('§')).is_err());
    }

    #[test]
    fn test_read_covariates_tsv() {
        let file = write_temp(
            ".tsv",
            "subj\tsite\tsex\tage\tunused\n1001\tAMS\tF\t31\tx\n1002\tGRO\tM\t45.5\ty\n",
        );
        let table = read_covariates(file.path(), &columns(), None).unwrap();
        assert_eq!(table.subject_ids, vec!["1001", "1002"]);
        assert_eq!(table.batches, vec!["AMS", "GRO"]);
        assert_eq!(table.categorical[0].values, vec!["F", "M"]);
        assert_eq!(table.continuous[0].values, vec![31.0, 45.5]);
    }

    #[test]
    fn test_missing_covariate_column() {
        let file = write_temp(".csv", "subj,site,sex\n1,A,F\n");
        let err = read_covariates(file.path(), &columns(), None).unwrap_err();
        assert!(matches!(err, HarmonizeError::CovariateError { ref column, .. } if column == "age"));
    }

    #[test]
    fn test_non_numeric_continuous_covariate() {
        let file = write_temp(".csv", "subj,site,sex,age\n1,A,F,thirty\n");
        let err = read_covariates(file.path(), &columns(), None).unwrap_err();
        assert!(err.to_string().contains("thirty"));
    }

    #[test]
    fn test_missing_value_is_rejected() {
        let file = write_temp(".csv", "subj,site,sex,age\n1,A,NA,30\n");
        assert!(read_covariates(file.path(), &columns(), None).is_err());
    }

    #[test]
    fn test_read_measurements_keeps_ids_and_features() {
        let file = write_temp(
            ".csv",
            "roi_a,subj,roi_b\n1.5,s1,2.0\n2.5,s2,3.0\n",
        );
        let table = read_measurements(file.path(), "subj", None).unwrap();
        assert_eq!(table.feature_names, vec!["roi_a", "roi_b"]);
        assert_eq!(table.subject_ids, vec!["s1", "s2"]);
        assert_eq!(table.values.row(1), &[2.5, 3.0]);
    }

    #[test]
    fn test_write_measurements_round_trips_identifiers() {
        let table = MeasurementTable {
            index_name: "subj".into(),
            subject_ids: vec!["s1".into(), "s2".into()],
            feature_names: vec!["thick_L".into(), "thick_R".into()],
            values: Matrix::from_rows(&[vec![2.5, 2.25], vec![3.0, 1.0]]).unwrap(),
        };
        let bytes = write_measurements(&table, None).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "subj,thick_L,thick_R\ns1,2.5,2.25\ns2,3,1\n");
    }
}
