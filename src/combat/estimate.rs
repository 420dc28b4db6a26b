//! Location/scale model fitting and empirical Bayes shrinkage.
//!
//! Follows the usual ComBat recipe:
//! 1. regress every feature on the design and standardize it with the
//!    batch-weighted grand mean and the pooled residual variance;
//! 2. estimate per-batch additive (`gamma_hat`) and multiplicative
//!    (`delta_hat`) effects on the standardized data;
//! 3. shrink them towards normal / inverse-gamma priors fitted across
//!    features.

use crate::combat::design::DesignMatrix;
use crate::combat::matrix::Matrix;
use crate::utils::error::{HarmonizeError, Result};
use rayon::prelude::*;

/// Regression fit and pooled statistics shared by every subject.
#[derive(Debug, Clone)]
pub struct Standardization {
    /// Coefficients, one row per design column.
    pub b_hat: Matrix,
    pub grand_mean: Vec<f64>,
    pub var_pooled: Vec<f64>,
    /// Features with (numerically) zero pooled variance; passed through untouched.
    pub constant: Vec<bool>,
}

impl Standardization {
    pub fn n_features(&self) -> usize {
        self.grand_mean.len()
    }

    /// Grand mean plus the covariate effects of one encoded design row, with
    /// the batch columns left out.
    pub fn stand_mean(&self, encoded: &[f64], n_batches: usize) -> Vec<f64> {
        let mut mean = self.grand_mean.clone();
        for (c, &x) in encoded.iter().enumerate().skip(n_batches) {
            if x == 0.0 {
                continue;
            }
            for (m, &b) in mean.iter_mut().zip(self.b_hat.row(c)) {
                *m += x * b;
            }
        }
        mean
    }
}

pub fn standardize(
    design: &DesignMatrix,
    data: &Matrix,
    reference: Option<usize>,
) -> Result<Standardization> {
    let x = &design.matrix;
    if x.rows() != data.rows() {
        return Err(HarmonizeError::CountMismatchError {
            source_kind: "measurement rows".to_string(),
            measurements: data.rows(),
            covariates: x.rows(),
        });
    }

    let xtx = x.t_mul(x)?;
    let xty = x.t_mul(data)?;
    let b_hat = xtx.solve(&xty)?;

    let n_batches = design.encoding.n_batches();
    let g = data.cols();
    let sizes = design.batch_sizes();
    let n = design.n_subjects() as f64;

    let grand_mean = match reference {
        Some(r) => b_hat.row(r).to_vec(),
        None => {
            let mut mean = vec![0.0; g];
            for (b, &size) in sizes.iter().enumerate() {
                let w = size as f64 / n;
                for (m, &coef) in mean.iter_mut().zip(b_hat.row(b)) {
                    *m += w * coef;
                }
            }
            mean
        }
    };

    // 殘差平方平均（除以 n），有參考站點時只用參考站點的受試者
    let mut var_pooled = vec![0.0; g];
    let mut used = 0usize;
    let mut fitted = vec![0.0; g];
    for i in 0..x.rows() {
        if let Some(r) = reference {
            if design.batch_of[i] != r {
                continue;
            }
        }
        fitted.iter_mut().for_each(|v| *v = 0.0);
        for (c, &xv) in x.row(i).iter().enumerate() {
            if xv == 0.0 {
                continue;
            }
            for (f, &b) in fitted.iter_mut().zip(b_hat.row(c)) {
                *f += xv * b;
            }
        }
        for ((v, &y), &f) in var_pooled.iter_mut().zip(data.row(i)).zip(&fitted) {
            let r = y - f;
            *v += r * r;
        }
        used += 1;
    }
    if used == 0 {
        return Err(HarmonizeError::NumericError {
            message: "no subjects available to pool the residual variance".to_string(),
        });
    }
    var_pooled.iter_mut().for_each(|v| *v /= used as f64);

    let constant: Vec<bool> = var_pooled
        .iter()
        .zip(&grand_mean)
        .map(|(&v, &m)| !(v > f64::EPSILON * (m * m).max(1.0)))
        .collect();

    let n_constant = constant.iter().filter(|&&c| c).count();
    if n_constant > 0 {
        tracing::warn!(
            "{} of {} features have zero pooled variance and will not be adjusted",
            n_constant,
            g
        );
    }
    tracing::debug!("Standardized {} features against {} batch columns", g, n_batches);

    Ok(Standardization {
        b_hat,
        grand_mean,
        var_pooled,
        constant,
    })
}

/// `(y - stand_mean) / sqrt(var_pooled)` for one subject.
pub fn standardize_row(values: &[f64], stand_mean: &[f64], st: &Standardization) -> Vec<f64> {
    values
        .iter()
        .zip(stand_mean)
        .zip(st.var_pooled.iter().zip(&st.constant))
        .map(|((&y, &m), (&v, &constant))| if constant { 0.0 } else { (y - m) / v.sqrt() })
        .collect()
}

/// Per-batch estimates on the standardized scale.
#[derive(Debug, Clone)]
pub struct LocationScale {
    pub sizes: Vec<usize>,
    /// Batch mean of the standardized data, batches x features.
    pub gamma_hat: Matrix,
    /// Batch variance (ddof = 1), or 1 with `mean_only`.
    pub delta_hat: Matrix,
    /// Sum of squared deviations from `gamma_hat`, kept for the EB updates.
    pub sum_sq: Matrix,
}

pub fn location_scale(
    z: &Matrix,
    members: &[Vec<usize>],
    mean_only: bool,
) -> Result<LocationScale> {
    let g = z.cols();
    let n_batches = members.len();
    let mut gamma_hat = Matrix::zeros(n_batches, g);
    let mut delta_hat = Matrix::zeros(n_batches, g);
    let mut sum_sq = Matrix::zeros(n_batches, g);

    for (b, rows) in members.iter().enumerate() {
        let n = rows.len();
        if n == 0 {
            return Err(HarmonizeError::NumericError {
                message: format!("batch {} has no subjects", b),
            });
        }
        if n < 2 && !mean_only {
            return Err(HarmonizeError::NumericError {
                message: format!(
                    "batch {} has a single subject; its variance cannot be estimated (use mean_only)",
                    b
                ),
            });
        }

        let mean = gamma_hat.row_mut(b);
        for &i in rows {
            for (m, &v) in mean.iter_mut().zip(z.row(i)) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n as f64);

        let mean = gamma_hat.row(b).to_vec();
        let ss = sum_sq.row_mut(b);
        for &i in rows {
            for ((s, &v), &m) in ss.iter_mut().zip(z.row(i)).zip(&mean) {
                let d = v - m;
                *s += d * d;
            }
        }

        let ss = sum_sq.row(b).to_vec();
        let delta = delta_hat.row_mut(b);
        for (d, s) in delta.iter_mut().zip(ss) {
            *d = if mean_only { 1.0 } else { s / (n - 1) as f64 };
        }
    }

    Ok(LocationScale {
        sizes: members.iter().map(Vec::len).collect(),
        gamma_hat,
        delta_hat,
        sum_sq,
    })
}

/// Hyperparameters of one batch, fitted across informative features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPriors {
    pub gamma_bar: f64,
    pub t2: f64,
    pub a: f64,
    pub b: f64,
}

impl BatchPriors {
    fn is_usable(&self, mean_only: bool) -> bool {
        let location_ok = self.gamma_bar.is_finite() && self.t2.is_finite() && self.t2 > 0.0;
        let scale_ok = mean_only || (self.a.is_finite() && self.b.is_finite() && self.a > 0.0);
        location_ok && scale_ok
    }
}

pub fn fit_priors(ls: &LocationScale, constant: &[bool]) -> Vec<BatchPriors> {
    (0..ls.gamma_hat.rows())
        .map(|b| {
            let gammas: Vec<f64> = informative(ls.gamma_hat.row(b), constant);
            let deltas: Vec<f64> = informative(ls.delta_hat.row(b), constant);
            let (gamma_bar, t2) = mean_var(&gammas);
            let (m, s2) = mean_var(&deltas);
            BatchPriors {
                gamma_bar,
                t2,
                a: (2.0 * s2 + m * m) / s2,
                b: (m * s2 + m * m * m) / s2,
            }
        })
        .collect()
}

/// Empirical Bayes adjusted batch effects, batches x features.
#[derive(Debug, Clone)]
pub struct BatchEffects {
    pub gamma_star: Matrix,
    pub delta_star: Matrix,
}

pub fn no_shrinkage(ls: &LocationScale) -> BatchEffects {
    BatchEffects {
        gamma_star: ls.gamma_hat.clone(),
        delta_star: ls.delta_hat.clone(),
    }
}

/// Parametric EB: iterate the posterior mean/variance of every feature until
/// the largest relative change over all features drops to `tolerance`.
pub fn parametric_adjustments(
    ls: &LocationScale,
    priors: &[BatchPriors],
    constant: &[bool],
    mean_only: bool,
    tolerance: f64,
    max_iterations: usize,
) -> BatchEffects {
    let g = ls.gamma_hat.cols();
    let n_batches = priors.len();
    let mut gamma_star = Matrix::zeros(n_batches, g);
    let mut delta_star = Matrix::zeros(n_batches, g);

    for (b, prior) in priors.iter().enumerate() {
        let g_hat = ls.gamma_hat.row(b);
        let d_hat = ls.delta_hat.row(b);

        if !prior.is_usable(mean_only) {
            tracing::warn!(
                "Batch {}: priors are undefined (too few informative features); using unshrunk estimates",
                b
            );
            gamma_star.row_mut(b).copy_from_slice(g_hat);
            delta_star.row_mut(b).copy_from_slice(d_hat);
            continue;
        }

        if mean_only {
            let gamma: Vec<f64> = g_hat
                .par_iter()
                .map(|&gh| posterior_mean(gh, prior.gamma_bar, 1.0, 1.0, prior.t2))
                .collect();
            gamma_star.row_mut(b).copy_from_slice(&gamma);
            delta_star.row_mut(b).iter_mut().for_each(|d| *d = 1.0);
            continue;
        }

        let n = ls.sizes[b] as f64;
        let ss = ls.sum_sq.row(b);
        let mut g_old = g_hat.to_vec();
        let mut d_old = d_hat.to_vec();
        let mut iterations = 0usize;

        loop {
            let updated: Vec<(f64, f64, f64)> = (0..g)
                .into_par_iter()
                .map(|f| {
                    if constant[f] {
                        return (g_old[f], d_old[f], 0.0);
                    }
                    let g_new = posterior_mean(g_hat[f], prior.gamma_bar, n, d_old[f], prior.t2);
                    let resid = g_hat[f] - g_new;
                    let sum2 = ss[f] + n * resid * resid;
                    let d_new = posterior_var(sum2, n, prior.a, prior.b);
                    let change = relative_change(g_new, g_old[f])
                        .max(relative_change(d_new, d_old[f]));
                    (g_new, d_new, change)
                })
                .collect();

            let mut change = 0.0_f64;
            for (f, (g_new, d_new, c)) in updated.into_iter().enumerate() {
                g_old[f] = g_new;
                d_old[f] = d_new;
                change = change.max(c);
            }
            iterations += 1;

            if change <= tolerance {
                break;
            }
            if iterations >= max_iterations {
                tracing::warn!(
                    "Batch {}: EB estimates did not converge after {} iterations (change {:.3e})",
                    b,
                    iterations,
                    change
                );
                break;
            }
        }
        tracing::debug!("Batch {}: EB converged in {} iterations", b, iterations);

        for f in 0..g {
            if constant[f] {
                g_old[f] = 0.0;
                d_old[f] = 1.0;
            }
        }
        gamma_star.row_mut(b).copy_from_slice(&g_old);
        delta_star.row_mut(b).copy_from_slice(&d_old);
    }

    BatchEffects {
        gamma_star,
        delta_star,
    }
}

/// Non-parametric EB: every feature's batch effect is the likelihood-weighted
/// average of the other features' estimates.
pub fn nonparametric_adjustments(
    ls: &LocationScale,
    constant: &[bool],
    mean_only: bool,
) -> BatchEffects {
    let g = ls.gamma_hat.cols();
    let n_batches = ls.gamma_hat.rows();
    let mut gamma_star = Matrix::zeros(n_batches, g);
    let mut delta_star = Matrix::zeros(n_batches, g);

    if g > 20_000 {
        tracing::warn!(
            "Non-parametric EB over {} features is quadratic in the feature count and may take a long time",
            g
        );
    }

    let candidates: Vec<usize> = (0..g).filter(|&f| !constant[f]).collect();

    for b in 0..n_batches {
        let n = ls.sizes[b] as f64;
        let g_hat = ls.gamma_hat.row(b);
        let d_hat = ls.delta_hat.row(b);
        let ss = ls.sum_sq.row(b);

        let estimates: Vec<(f64, f64)> = (0..g)
            .into_par_iter()
            .map(|i| {
                if constant[i] {
                    return (0.0, 1.0);
                }
                // log-sum-exp 避免似然值下溢為 0
                let log_lh: Vec<(usize, f64)> = candidates
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| {
                        let resid = g_hat[i] - g_hat[j];
                        let sum2 = ss[i] + n * resid * resid;
                        let d = d_hat[j];
                        let ll = -0.5 * n * (2.0 * std::f64::consts::PI * d).ln() - sum2 / (2.0 * d);
                        (j, ll)
                    })
                    .filter(|(_, ll)| ll.is_finite())
                    .collect();

                let max_ll = log_lh
                    .iter()
                    .map(|(_, ll)| *ll)
                    .fold(f64::NEG_INFINITY, f64::max);
                if !max_ll.is_finite() {
                    return (g_hat[i], d_hat[i]);
                }

                let (mut wsum, mut gsum, mut dsum) = (0.0, 0.0, 0.0);
                for (j, ll) in log_lh {
                    let w = (ll - max_ll).exp();
                    wsum += w;
                    gsum += w * g_hat[j];
                    dsum += w * d_hat[j];
                }
                let d = if mean_only { 1.0 } else { dsum / wsum };
                (gsum / wsum, d)
            })
            .collect();

        for (f, (gs, ds)) in estimates.into_iter().enumerate() {
            gamma_star.set(b, f, gs);
            delta_star.set(b, f, ds);
        }
    }

    BatchEffects {
        gamma_star,
        delta_star,
    }
}

#[inline]
fn posterior_mean(g_hat: f64, g_bar: f64, n: f64, d_star: f64, t2: f64) -> f64 {
    (t2 * n * g_hat + d_star * g_bar) / (t2 * n + d_star)
}

#[inline]
fn posterior_var(sum2: f64, n: f64, a: f64, b: f64) -> f64 {
    (0.5 * sum2 + b) / (n / 2.0 + a - 1.0)
}

#[inline]
fn relative_change(new: f64, old: f64) -> f64 {
    let diff = (new - old).abs();
    if diff == 0.0 {
        0.0
    } else if old == 0.0 {
        f64::INFINITY
    } else {
        diff / old.abs()
    }
}

fn informative(values: &[f64], constant: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(constant)
        .filter(|(_, c)| !**c)
        .map(|(&v, _)| v)
        .collect()
}

/// Mean and sample variance (ddof = 1); variance is NaN below two values.
fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_var_uses_sample_variance() {
        let (m, v) = mean_var(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m, 2.5);
        assert!((v - 5.0 / 3.0).abs() < 1e-12);
        assert!(mean_var(&[1.0]).1.is_nan());
    }

    #[test]
    fn test_relative_change_handles_zero() {
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert_eq!(relative_change(1.0, 0.0), f64::INFINITY);
        assert!((relative_change(1.1, 1.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_location_scale_per_batch() {
        let z = Matrix::from_rows(&[vec![1.0], vec![3.0], vec![-1.0], vec![-3.0], vec![-2.0]])
            .unwrap();
        let members = vec![vec![0, 1], vec![2, 3, 4]];
        let ls = location_scale(&z, &members, false).unwrap();
        assert_eq!(ls.gamma_hat.get(0, 0), 2.0);
        assert_eq!(ls.gamma_hat.get(1, 0), -2.0);
        assert_eq!(ls.delta_hat.get(0, 0), 2.0);
        assert_eq!(ls.delta_hat.get(1, 0), 1.0);
        assert_eq!(ls.sizes, vec![2, 3]);
    }

    #[test]
    fn test_single_subject_batch_needs_mean_only() {
        let z = Matrix::from_rows(&[vec![1.0], vec![3.0], vec![-1.0]]).unwrap();
        let members = vec![vec![0, 1], vec![2]];
        assert!(location_scale(&z, &members, false).is_err());
        assert!(location_scale(&z, &members, true).is_ok());
    }

    #[test]
    fn test_posterior_mean_shrinks_towards_prior() {
        let shrunk = posterior_mean(2.0, 0.0, 10.0, 1.0, 0.5);
        assert!(shrunk > 0.0 && shrunk < 2.0);
    }

    #[test]
    fn test_parametric_falls_back_without_priors() {
        let z = Matrix::from_rows(&[vec![1.0], vec![3.0], vec![-1.0], vec![-3.0]]).unwrap();
        let members = vec![vec![0, 1], vec![2, 3]];
        let ls = location_scale(&z, &members, false).unwrap();
        // a single feature cannot support a prior variance
        let priors = fit_priors(&ls, &[false]);
        let effects = parametric_adjustments(&ls, &priors, &[false], false, 1e-4, 100);
        assert_eq!(effects.gamma_star.get(0, 0), ls.gamma_hat.get(0, 0));
        assert_eq!(effects.delta_star.get(1, 0), ls.delta_hat.get(1, 0));
    }
}
