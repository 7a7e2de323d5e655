//! Transformer between multistep history and Nordsieck vectors.
//!
//! An Adams method of `n` steps is carried as a Nordsieck vector: the
//! scaled first derivative `s1 = h y'` plus the rows
//! `[h^2 y''/2, h^3 y'''/6, ..., h^(n+1) y^(n+1)/(n+1)!]`. The matrix
//! `P[i][j] = (j + 2) (-(i + 1))^(j + 1)` maps those rows to the
//! differences `s1(t - (i + 1) h) - s1(t)` of the scaled derivatives at past
//! points; the update and initialization matrices are derived from it.

use crate::error::IntegrationError;

/// LU decomposition with partial pivoting of a dense square matrix
#[derive(Debug, Clone)]
struct LuDecomposition {
    n: usize,
    /// Row-major L (unit diagonal, below) and U (on and above)
    lu: Vec<f64>,
    permutation: Vec<usize>,
}

impl LuDecomposition {
    fn new(matrix: &[Vec<f64>]) -> Option<Self> {
        let n = matrix.len();
        let mut a: Vec<f64> = matrix.iter().flatten().copied().collect();
        let mut permutation: Vec<usize> = (0..n).collect();

        for k in 0..n {
            let mut pivot_row = k;
            let mut pivot_val = a[k * n + k].abs();
            for i in (k + 1)..n {
                let val = a[i * n + k].abs();
                if val > pivot_val {
                    pivot_val = val;
                    pivot_row = i;
                }
            }
            if pivot_val == 0.0 {
                return None;
            }
            if pivot_row != k {
                for j in 0..n {
                    a.swap(k * n + j, pivot_row * n + j);
                }
                permutation.swap(k, pivot_row);
            }
            let akk = a[k * n + k];
            for i in (k + 1)..n {
                let factor = a[i * n + k] / akk;
                a[i * n + k] = factor;
                for j in (k + 1)..n {
                    a[i * n + j] -= factor * a[k * n + j];
                }
            }
        }

        Some(Self {
            n,
            lu: a,
            permutation,
        })
    }

    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x: Vec<f64> = self.permutation.iter().map(|&p| b[p]).collect();
        for i in 0..n {
            let mut sum = x[i];
            for k in 0..i {
                sum -= self.lu[i * n + k] * x[k];
            }
            x[i] = sum;
        }
        for i in (0..n).rev() {
            let mut sum = x[i];
            for k in (i + 1)..n {
                sum -= self.lu[i * n + k] * x[k];
            }
            x[i] = sum / self.lu[i * n + i];
        }
        x
    }

    /// Solve `A X = B` column by column
    fn solve_matrix(&self, b: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = self.n;
        let columns = b.first().map_or(0, Vec::len);
        let mut x = vec![vec![0.0; columns]; n];
        let mut column = vec![0.0; n];
        for j in 0..columns {
            for i in 0..n {
                column[i] = b[i][j];
            }
            let solved = self.solve(&column);
            for i in 0..n {
                x[i][j] = solved[i];
            }
        }
        x
    }
}

/// Matrices of the Adams methods in Nordsieck form for `n` steps
#[derive(Debug, Clone)]
pub struct NordsieckTransformer {
    /// `P^-1 [1, ..., 1]`
    c1: Vec<f64>,
    /// `P^-1` applied to `P` with rows shifted down by one
    update: Vec<Vec<f64>>,
    /// `|P|^-1`, maps forward history to Nordsieck rows
    initialization: Vec<Vec<f64>>,
}

impl NordsieckTransformer {
    /// Build the transformer for `n_steps` history points
    pub fn new(n_steps: usize) -> Result<Self, IntegrationError> {
        if n_steps == 0 {
            return Err(IntegrationError::InvalidInput {
                message: "a multistep method needs at least one step".to_string(),
            });
        }
        let p = build_p(n_steps);
        let singular = || IntegrationError::InvalidInput {
            message: format!("Nordsieck matrix for {} steps is singular", n_steps),
        };
        let p_lu = LuDecomposition::new(&p).ok_or_else(singular)?;

        let c1 = p_lu.solve(&vec![1.0; n_steps]);

        let mut shifted = p.clone();
        shifted.rotate_right(1);
        shifted[0] = vec![0.0; n_steps];
        let update = p_lu.solve_matrix(&shifted);

        let r: Vec<Vec<f64>> = p
            .iter()
            .map(|row| row.iter().map(|v| v.abs()).collect())
            .collect();
        let r_lu = LuDecomposition::new(&r).ok_or_else(singular)?;
        let identity: Vec<Vec<f64>> = (0..n_steps)
            .map(|i| (0..n_steps).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        let initialization = r_lu.solve_matrix(&identity);

        Ok(Self {
            c1,
            update,
            initialization,
        })
    }

    /// Number of history points
    pub fn n_steps(&self) -> usize {
        self.c1.len()
    }

    /// Nordsieck rows from the scaled derivative at the start point and
    /// `multistep[i] = h y'(t0 + (i + 1) h)`
    pub fn initialize_high_order(&self, first: &[f64], multistep: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let differences: Vec<Vec<f64>> = multistep
            .iter()
            .map(|row| row.iter().zip(first).map(|(m, f)| m - f).collect())
            .collect();
        multiply(&self.initialization, &differences)
    }

    /// Shift the rows to the next step, before the new derivative is known
    pub fn update_phase1(&self, nordsieck: &[Vec<f64>]) -> Vec<Vec<f64>> {
        multiply(&self.update, nordsieck)
    }

    /// Complete the update with the scaled derivatives at both ends
    pub fn update_phase2(&self, start: &[f64], end: &[f64], nordsieck: &mut [Vec<f64>]) {
        for (row, c) in nordsieck.iter_mut().zip(&self.c1) {
            for (value, (s, e)) in row.iter_mut().zip(start.iter().zip(end)) {
                *value += c * (s - e);
            }
        }
    }
}

fn build_p(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let factor = -((i + 1) as f64);
            let mut aj = factor;
            (0..n)
                .map(|j| {
                    let value = aj * (j + 2) as f64;
                    aj *= factor;
                    value
                })
                .collect()
        })
        .collect()
}

fn multiply(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let columns = b.first().map_or(0, Vec::len);
    a.iter()
        .map(|row| {
            let mut out = vec![0.0; columns];
            for (weight, b_row) in row.iter().zip(b) {
                for (o, v) in out.iter_mut().zip(b_row) {
                    *o += weight * v;
                }
            }
            out
        })
        .collect()
}
