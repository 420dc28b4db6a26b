//! Dense row-major matrix with the handful of operations the estimator needs.
//!
//! Design matrices have one column per batch plus covariates, so the normal
//! equations are tiny (p × p) while the data side can be very wide (voxels).

use crate::utils::error::{HarmonizeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(HarmonizeError::ProcessingError {
                message: format!(
                    "matrix buffer has {} values, expected {}x{}",
                    data.len(),
                    rows,
                    cols
                ),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(HarmonizeError::ProcessingError {
                    message: format!("row {} has {} values, expected {}", i, row.len(), cols),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// `selfᵀ · other`, both with the same number of rows.
    pub fn t_mul(&self, other: &Matrix) -> Result<Matrix> {
        if self.rows != other.rows {
            return Err(HarmonizeError::ProcessingError {
                message: format!(
                    "cannot multiply transposed {}x{} with {}x{}",
                    self.rows, self.cols, other.rows, other.cols
                ),
            });
        }
        let mut out = Matrix::zeros(self.cols, other.cols);
        for k in 0..self.rows {
            let a_row = self.row(k);
            let b_row = other.row(k);
            for (i, &a) in a_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let out_row = out.row_mut(i);
                for (o, &b) in out_row.iter_mut().zip(b_row) {
                    *o += a * b;
                }
            }
        }
        Ok(out)
    }

    /// Solves `self · X = rhs` for square `self` with Gauss-Jordan elimination
    /// and partial pivoting.
    ///
    /// Rows and columns are first scaled to a max magnitude of 1, so the
    /// singularity test does not depend on the units of any one covariate.
    pub fn solve(&self, rhs: &Matrix) -> Result<Matrix> {
        if self.rows != self.cols || rhs.rows != self.rows {
            return Err(HarmonizeError::ProcessingError {
                message: format!(
                    "cannot solve {}x{} system with {}x{} right-hand side",
                    self.rows, self.cols, rhs.rows, rhs.cols
                ),
            });
        }

        let n = self.rows;
        let mut a = self.clone();
        let mut b = rhs.clone();

        for r in 0..n {
            let scale = max_abs(a.row(r));
            if scale == 0.0 {
                return Err(dependent_column(r));
            }
            a.row_mut(r).iter_mut().for_each(|v| *v /= scale);
            b.row_mut(r).iter_mut().for_each(|v| *v /= scale);
        }
        let mut col_scale = vec![0.0_f64; n];
        for r in 0..n {
            for (s, &v) in col_scale.iter_mut().zip(a.row(r)) {
                *s = s.max(v.abs());
            }
        }
        if let Some(c) = col_scale.iter().position(|&s| s == 0.0) {
            return Err(dependent_column(c));
        }
        for r in 0..n {
            for (v, &s) in a.row_mut(r).iter_mut().zip(&col_scale) {
                *v /= s;
            }
        }

        // 縮放後所有元素 |v| <= 1
        let tolerance = n as f64 * 1e-12;

        for col in 0..n {
            let pivot = (col..n)
                .max_by(|&x, &y| a.get(x, col).abs().total_cmp(&a.get(y, col).abs()))
                .unwrap_or(col);
            if a.get(pivot, col).abs() <= tolerance {
                return Err(dependent_column(col));
            }
            if pivot != col {
                a.swap_rows(pivot, col);
                b.swap_rows(pivot, col);
            }

            let inv = 1.0 / a.get(col, col);
            a.row_mut(col).iter_mut().for_each(|v| *v *= inv);
            b.row_mut(col).iter_mut().for_each(|v| *v *= inv);

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = a.get(r, col);
                if factor == 0.0 {
                    continue;
                }
                for c in 0..n {
                    let v = a.get(r, c) - factor * a.get(col, c);
                    a.set(r, c, v);
                }
                for c in 0..b.cols {
                    let v = b.get(r, c) - factor * b.get(col, c);
                    b.set(r, c, v);
                }
            }
        }

        // 還原欄縮放
        for (r, &s) in col_scale.iter().enumerate() {
            b.row_mut(r).iter_mut().for_each(|v| *v /= s);
        }
        Ok(b)
    }

    fn swap_rows(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(i * self.cols + c, j * self.cols + c);
        }
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

fn dependent_column(col: usize) -> HarmonizeError {
    HarmonizeError::SingularDesignError {
        message: format!("column {} of the design is linearly dependent", col),
    }
}
