use crate::combat::design::{build_design, CovariateEncoding};
use crate::combat::estimate::{
    self, fit_priors, location_scale, no_shrinkage, standardize, standardize_row, BatchEffects,
    Standardization,
};
use crate::combat::matrix::Matrix;
use crate::domain::model::{BatchSummary, CovariateRow, CovariateTable};
use crate::utils::error::{HarmonizeError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComBatOptions {
    /// Shrink batch effects with empirical Bayes; off means raw per-batch estimates.
    pub empirical_bayes: bool,
    pub parametric: bool,
    /// Only remove additive batch effects.
    pub mean_only: bool,
    /// Batch whose data stays unchanged and defines the target scale.
    pub reference_batch: Option<String>,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for ComBatOptions {
    fn default() -> Self {
        Self {
            empirical_bayes: true,
            parametric: true,
            mean_only: false,
            reference_batch: None,
            tolerance: 1e-4,
            max_iterations: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComBat {
    options: ComBatOptions,
}

/// Result of fitting: the model plus the harmonized training data.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub model: HarmonizationModel,
    pub adjusted: Matrix,
}

/// Everything needed to harmonize a subject given its covariates.
#[derive(Debug, Clone)]
pub struct HarmonizationModel {
    pub encoding: CovariateEncoding,
    pub batch_sizes: Vec<usize>,
    pub reference_batch: Option<usize>,
    pub standardization: Standardization,
    pub gamma_star: Matrix,
    pub delta_star: Matrix,
    pub options: ComBatOptions,
}

impl ComBat {
    pub fn new(options: ComBatOptions) -> Self {
        Self { options }
    }

    /// Fits the model on subjects × features `data` whose rows line up with
    /// `covariates`, and returns the adjusted data alongside it.
    pub fn fit(&self, data: &Matrix, covariates: &CovariateTable) -> Result<FitOutcome> {
        let model = self.learn(data, covariates)?;

        let rows: Vec<Vec<f64>> = (0..data.rows())
            .into_par_iter()
            .map(|i| model.apply_sample(data.row(i), &covariates.row(i)))
            .collect::<Result<Vec<_>>>()?;

        let mut adjusted = Matrix::zeros(data.rows(), data.cols());
        for (i, row) in rows.into_iter().enumerate() {
            adjusted.row_mut(i).copy_from_slice(&row);
        }

        Ok(FitOutcome { model, adjusted })
    }

    /// Estimates the model without adjusting the training data, for callers
    /// that apply it subject by subject afterwards.
    pub fn learn(&self, data: &Matrix, covariates: &CovariateTable) -> Result<HarmonizationModel> {
        if data.rows() != covariates.len() {
            return Err(HarmonizeError::CountMismatchError {
                source_kind: "measurement rows".to_string(),
                measurements: data.rows(),
                covariates: covariates.len(),
            });
        }
        if data.cols() == 0 {
            return Err(HarmonizeError::ValidationError {
                message: "no features to harmonize".to_string(),
            });
        }
        if let Some(pos) = data.as_slice().iter().position(|v| !v.is_finite()) {
            return Err(HarmonizeError::ValidationError {
                message: format!(
                    "non-finite measurement for subject '{}' in feature {}",
                    covariates.subject_ids[pos / data.cols()],
                    pos % data.cols()
                ),
            });
        }

        let design = build_design(covariates)?;
        let reference = match &self.options.reference_batch {
            Some(label) => Some(design.encoding.batch_index(label)?),
            None => None,
        };
        let n_batches = design.encoding.n_batches();

        tracing::info!(
            "Fitting ComBat: {} subjects, {} features, {} batches",
            data.rows(),
            data.cols(),
            n_batches
        );

        let standardization = standardize(&design, data, reference)?;

        let z_rows: Vec<Vec<f64>> = (0..design.n_subjects())
            .into_par_iter()
            .map(|i| {
                let mean = standardization.stand_mean(design.matrix.row(i), n_batches);
                standardize_row(data.row(i), &mean, &standardization)
            })
            .collect();
        let mut z = Matrix::zeros(data.rows(), data.cols());
        for (i, row) in z_rows.into_iter().enumerate() {
            z.row_mut(i).copy_from_slice(&row);
        }

        let members = design.batch_members();
        let ls = location_scale(&z, &members, self.options.mean_only)?;
        drop(z);

        let mut effects = if self.options.empirical_bayes {
            if self.options.parametric {
                let priors = fit_priors(&ls, &standardization.constant);
                estimate::parametric_adjustments(
                    &ls,
                    &priors,
                    &standardization.constant,
                    self.options.mean_only,
                    self.options.tolerance,
                    self.options.max_iterations,
                )
            } else {
                estimate::nonparametric_adjustments(
                    &ls,
                    &standardization.constant,
                    self.options.mean_only,
                )
            }
        } else {
            no_shrinkage(&ls)
        };

        // 參考站點不做調整
        if let Some(r) = reference {
            neutralize_batch(&mut effects, r);
        }

        Ok(HarmonizationModel {
            encoding: design.encoding,
            batch_sizes: ls.sizes,
            reference_batch: reference,
            standardization,
            gamma_star: effects.gamma_star,
            delta_star: effects.delta_star,
            options: self.options.clone(),
        })
    }
}

fn neutralize_batch(effects: &mut BatchEffects, batch: usize) {
    effects.gamma_star.row_mut(batch).iter_mut().for_each(|g| *g = 0.0);
    effects.delta_star.row_mut(batch).iter_mut().for_each(|d| *d = 1.0);
}

impl HarmonizationModel {
    pub fn n_features(&self) -> usize {
        self.standardization.n_features()
    }

    pub fn n_constant_features(&self) -> usize {
        self.standardization.constant.iter().filter(|&&c| c).count()
    }

    /// Harmonizes one subject. For a training subject this reproduces the
    /// corresponding row of [`FitOutcome::adjusted`].
    pub fn apply_sample(&self, values: &[f64], covariates: &CovariateRow<'_>) -> Result<Vec<f64>> {
        if values.len() != self.n_features() {
            return Err(HarmonizeError::ValidationError {
                message: format!(
                    "sample has {} features, model was fitted on {}",
                    values.len(),
                    self.n_features()
                ),
            });
        }
        let encoded = self.encoding.encode_row(covariates)?;
        let batch = self.encoding.batch_index(covariates.batch)?;
        let stand_mean = self
            .standardization
            .stand_mean(&encoded, self.encoding.n_batches());
        let z = standardize_row(values, &stand_mean, &self.standardization);
        Ok(self.adjust_standardized(values, &z, &stand_mean, batch))
    }

    fn adjust_standardized(
        &self,
        values: &[f64],
        z: &[f64],
        stand_mean: &[f64],
        batch: usize,
    ) -> Vec<f64> {
        if self.reference_batch == Some(batch) {
            return values.to_vec();
        }
        let gamma = self.gamma_star.row(batch);
        let delta = self.delta_star.row(batch);
        let st = &self.standardization;

        (0..values.len())
            .map(|f| {
                if st.constant[f] {
                    values[f]
                } else {
                    (z[f] - gamma[f]) / delta[f].sqrt() * st.var_pooled[f].sqrt() + stand_mean[f]
                }
            })
            .collect()
    }

    pub fn batch_summaries(&self) -> Vec<BatchSummary> {
        let informative: Vec<usize> = (0..self.n_features())
            .filter(|&f| !self.standardization.constant[f])
            .collect();
        let mean_over = |row: &[f64]| {
            if informative.is_empty() {
                0.0
            } else {
                informative.iter().map(|&f| row[f]).sum::<f64>() / informative.len() as f64
            }
        };

        self.encoding
            .batch_levels
            .iter()
            .enumerate()
            .map(|(b, label)| BatchSummary {
                label: label.clone(),
                subjects: self.batch_sizes[b],
                mean_gamma_star: mean_over(self.gamma_star.row(b)),
                mean_delta_star: mean_over(self.delta_star.row(b)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CategoricalColumn, ContinuousColumn};

    /// Two sites, three features; site B is shifted by +5 and scaled by 2.
    fn site_shift_data() -> (Matrix, CovariateTable) {
        let base = [
            [1.0, 10.0, -2.0],
            [2.0, 12.0, -1.0],
            [3.0, 11.0, 0.0],
            [4.0, 13.0, 1.5],
            [2.5, 9.0, -0.5],
            [3.5, 10.5, 0.5],
        ];
        let mut rows = Vec::new();
        let mut batches = Vec::new();
        let mut ids = Vec::new();
        for (i, r) in base.iter().enumerate() {
            rows.push(r.to_vec());
            batches.push("A".to_string());
            ids.push(format!("a{}", i));
        }
        for (i, r) in base.iter().enumerate() {
            rows.push(r.iter().map(|v| v * 2.0 + 5.0).collect());
            batches.push("B".to_string());
            ids.push(format!("b{}", i));
        }
        let ages: Vec<f64> = (0..ids.len()).map(|i| 20.0 + (i % 4) as f64 * 3.0).collect();
        let covariates = CovariateTable {
            index_name: "subj".into(),
            subject_ids: ids,
            batch_col: "site".into(),
            batches,
            categorical: vec![],
            continuous: vec![ContinuousColumn {
                name: "age".into(),
                values: ages,
            }],
        };
        (Matrix::from_rows(&rows).unwrap(), covariates)
    }

    fn batch_means(m: &Matrix, rows: std::ops::Range<usize>, f: usize) -> f64 {
        let n = rows.len() as f64;
        rows.map(|i| m.get(i, f)).sum::<f64>() / n
    }

    /// 兩站點各四人，含性別與年齡
    fn thickness_data() -> (Matrix, CovariateTable) {
        let data = Matrix::from_rows(&[
            vec![2.1, 10.2, 0.51],
            vec![2.4, 9.8, 0.48],
            vec![1.9, 10.5, 0.55],
            vec![2.2, 10.1, 0.50],
            vec![5.3, 12.9, 0.82],
            vec![4.9, 13.4, 0.79],
            vec![5.6, 12.7, 0.85],
            vec![5.0, 13.1, 0.80],
        ])
        .unwrap();
        let covariates = CovariateTable {
            index_name: "subj".into(),
            subject_ids: (1..=8).map(|i| format!("s0{}", i)).collect(),
            batch_col: "site".into(),
            batches: ["AMS", "AMS", "AMS", "AMS", "GRO", "GRO", "GRO", "GRO"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            categorical: vec![CategoricalColumn {
                name: "sex".into(),
                values: (0..8)
                    .map(|i| if i % 2 == 0 { "F" } else { "M" }.to_string())
                    .collect(),
            }],
            continuous: vec![ContinuousColumn {
                name: "age".into(),
                values: vec![25.0, 31.0, 44.0, 52.0, 28.0, 36.0, 47.0, 58.0],
            }],
        };
        (data, covariates)
    }

    fn assert_adjusted(options: ComBatOptions, expected: &[[f64; 3]; 8]) {
        let (data, covariates) = thickness_data();
        let outcome = ComBat::new(options).fit(&data, &covariates).unwrap();
        for (i, row) in expected.iter().enumerate() {
            for (f, &want) in row.iter().enumerate() {
                let got = outcome.adjusted.get(i, f);
                assert!(
                    (got - want).abs() < 1e-6,
                    "subject {} feature {}: {} != {}",
                    i,
                    f,
                    got,
                    want
                );
            }
        }
    }

    // 參考值以 neuroCombat 的矩陣公式獨立計算，EB 迭代至完全收斂

    #[test]
    fn test_parametric_eb_matches_neurocombat() {
        let options = ComBatOptions {
            tolerance: 1e-10,
            ..ComBatOptions::default()
        };
        assert_adjusted(
            options,
            &[
                [3.6440716095, 11.6275562314, 0.6608654944],
                [3.8975301622, 11.2767839270, 0.6293776329],
                [3.4646814801, 11.8974062621, 0.6988286891],
                [3.7178423150, 11.5471622204, 0.6499670291],
                [3.7633122668, 11.4759641756, 0.6706849012],
                [3.4080517627, 11.9051312050, 0.6391518576],
                [4.0150246990, 11.3121295548, 0.6995892590],
                [3.4889912957, 11.6571979092, 0.6515657822],
            ],
        );
    }

    #[test]
    fn test_nonparametric_eb_matches_neurocombat() {
        let options = ComBatOptions {
            parametric: false,
            ..ComBatOptions::default()
        };
        assert_adjusted(
            options,
            &[
                [3.4199609559, 11.8740575939, 0.5647949279],
                [3.6756804538, 11.5160707634, 0.5335262119],
                [3.2395696160, 12.1483262296, 0.6030581214],
                [3.4950058589, 11.7907902426, 0.5540287965],
                [3.9759598381, 11.2502564616, 0.7597646490],
                [3.6224572475, 11.6721059048, 0.7280723685],
                [4.2257749454, 11.0901580003, 0.7885552027],
                [3.7026478527, 11.4295514968, 0.7407370269],
            ],
        );
    }

    #[test]
    fn test_without_eb_matches_neurocombat() {
        let options = ComBatOptions {
            empirical_bayes: false,
            ..ComBatOptions::default()
        };
        assert_adjusted(
            options,
            &[
                [3.6388318866, 11.6235138841, 0.6612893117],
                [3.8990986540, 11.2703352504, 0.6295112706],
                [3.4564268870, 11.8948376939, 0.6988552655],
                [3.7164394876, 11.5421615006, 0.6502156175],
                [3.7661976275, 11.4811739265, 0.6704066541],
                [3.4155495960, 11.9075436633, 0.6390926490],
                [4.0129317944, 11.3187675269, 0.6994675553],
                [3.4945240670, 11.6616665542, 0.6511616764],
            ],
        );
    }

    #[test]
    fn test_fit_with_intracranial_volume_covariate() {
        let n = 100;
        let site_b: Vec<f64> = (0..n).map(|k| if k < 50 { 0.0 } else { 1.0 }).collect();
        let icv: Vec<f64> = (0..n).map(|k| 1.4e6 + k as f64 * 2000.0).collect();
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|k| {
                vec![
                    2.5 + 0.1 * (k % 7) as f64 + 0.4 * site_b[k] + 1e-7 * icv[k],
                    0.5 + 0.01 * (k % 5) as f64 * (1.0 + site_b[k]) + 0.05 * site_b[k],
                ]
            })
            .collect();
        let data = Matrix::from_rows(&rows).unwrap();
        let covariates = CovariateTable {
            index_name: "subj".into(),
            subject_ids: (0..n).map(|k| format!("sub{:03}", k)).collect(),
            batch_col: "site".into(),
            batches: site_b
                .iter()
                .map(|&b| if b == 0.0 { "A" } else { "B" }.to_string())
                .collect(),
            categorical: vec![CategoricalColumn {
                name: "sex".into(),
                values: (0..n)
                    .map(|k| if k % 2 == 0 { "F" } else { "M" }.to_string())
                    .collect(),
            }],
            continuous: vec![ContinuousColumn {
                name: "icv".into(),
                values: icv,
            }],
        };

        let outcome = ComBat::default().fit(&data, &covariates).unwrap();
        for f in 0..2 {
            let before = (batch_means(&data, 0..50, f) - batch_means(&data, 50..100, f)).abs();
            let after = (batch_means(&outcome.adjusted, 0..50, f)
                - batch_means(&outcome.adjusted, 50..100, f))
            .abs();
            assert!(after < before * 0.25, "feature {}: {} -> {}", f, before, after);
        }
    }

    #[test]
    fn test_fit_reduces_site_difference() {
        let (data, covariates) = site_shift_data();
        let outcome = ComBat::default().fit(&data, &covariates).unwrap();
        for f in 0..3 {
            let before = (batch_means(&data, 0..6, f) - batch_means(&data, 6..12, f)).abs();
            let after =
                (batch_means(&outcome.adjusted, 0..6, f) - batch_means(&outcome.adjusted, 6..12, f))
                    .abs();
            assert!(after < before * 0.25, "feature {}: {} -> {}", f, before, after);
        }
    }

    #[test]
    fn test_apply_sample_matches_fit_output() {
        let (data, covariates) = site_shift_data();
        let outcome = ComBat::default().fit(&data, &covariates).unwrap();
        for i in 0..data.rows() {
            let applied = outcome
                .model
                .apply_sample(data.row(i), &covariates.row(i))
                .unwrap();
            for (a, b) in applied.iter().zip(outcome.adjusted.row(i)) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (data, covariates) = site_shift_data();
        let first = ComBat::default().fit(&data, &covariates).unwrap();
        let second = ComBat::default().fit(&data, &covariates).unwrap();
        assert_eq!(first.adjusted, second.adjusted);
    }

    #[test]
    fn test_reference_batch_is_unchanged() {
        let (data, covariates) = site_shift_data();
        let options = ComBatOptions {
            reference_batch: Some("A".to_string()),
            ..ComBatOptions::default()
        };
        let outcome = ComBat::new(options).fit(&data, &covariates).unwrap();
        for i in 0..6 {
            assert_eq!(outcome.adjusted.row(i), data.row(i));
        }
        let diff = (batch_means(&data, 0..6, 0) - batch_means(&outcome.adjusted, 6..12, 0)).abs();
        assert!(diff < 1.0);
    }

    #[test]
    fn test_constant_feature_passes_through() {
        let (data, covariates) = site_shift_data();
        let mut rows: Vec<Vec<f64>> = (0..data.rows())
            .map(|i| {
                let mut r = data.row(i).to_vec();
                r.push(7.0);
                r
            })
            .collect();
        rows[0][3] = 7.0;
        let data = Matrix::from_rows(&rows).unwrap();
        let outcome = ComBat::default().fit(&data, &covariates).unwrap();
        assert_eq!(outcome.model.n_constant_features(), 1);
        for i in 0..data.rows() {
            assert_eq!(outcome.adjusted.get(i, 3), 7.0);
        }
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let (mut data, covariates) = site_shift_data();
        data.set(3, 1, f64::NAN);
        let err = ComBat::default().fit(&data, &covariates).unwrap_err();
        assert!(err.to_string().contains("a3"));
    }

    #[test]
    fn test_unknown_reference_batch() {
        let (data, covariates) = site_shift_data();
        let options = ComBatOptions {
            reference_batch: Some("Z".to_string()),
            ..ComBatOptions::default()
        };
        assert!(ComBat::new(options).fit(&data, &covariates).is_err());
    }

    #[test]
    fn test_nonparametric_and_no_eb_variants_run() {
        let (data, covariates) = site_shift_data();
        for options in [
            ComBatOptions {
                parametric: false,
                ..ComBatOptions::default()
            },
            ComBatOptions {
                empirical_bayes: false,
                ..ComBatOptions::default()
            },
            ComBatOptions {
                mean_only: true,
                ..ComBatOptions::default()
            },
        ] {
            let outcome = ComBat::new(options).fit(&data, &covariates).unwrap();
            assert!(outcome.adjusted.as_slice().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_batch_summaries_follow_levels() {
        let (data, covariates) = site_shift_data();
        let outcome = ComBat::default().fit(&data, &covariates).unwrap();
        let summaries = outcome.model.batch_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].label, "A");
        assert_eq!(summaries[1].subjects, 6);
    }
}
