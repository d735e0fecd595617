//! Shared helpers for the test suites.

use crate::Index;
use faer_core::{Mat, MatRef};
use rand::prelude::*;

pub fn random_symmetric(rng: &mut StdRng, m: usize) -> Mat<f64> {
    let mut a = Mat::<f64>::zeros(m, m);
    for j in 0..m {
        for i in j..m {
            let v = rng.gen_range(-1.0..1.0);
            a.write(i, j, v);
            a.write(j, i, v);
        }
    }
    a
}

pub fn random_spd(rng: &mut StdRng, m: usize) -> Mat<f64> {
    let b = Mat::<f64>::from_fn(m, m + 2, |_, _| rng.gen_range(-1.0..1.0));
    let mut a = &b * b.transpose();
    for i in 0..m {
        a.write(i, i, a.read(i, i) + 0.1);
    }
    a
}

/// Random sparse symmetric matrix in sorted lower CSC form with a full
/// diagonal. `shift` is added to the diagonal (a large shift makes the
/// matrix diagonally dominant).
pub fn random_sparse_symmetric<I: Index>(
    rng: &mut StdRng,
    n: usize,
    density: f64,
    shift: f64,
) -> (Vec<I>, Vec<I>, Vec<f64>) {
    let mut col_ptr = Vec::with_capacity(n + 1);
    let mut row_ind = Vec::new();
    let mut values = Vec::new();

    col_ptr.push(I::truncate(0));
    for j in 0..n {
        row_ind.push(I::truncate(j));
        values.push(rng.gen_range(-1.0..1.0) + shift);
        for i in j + 1..n {
            if rng.gen_bool(density) {
                row_ind.push(I::truncate(i));
                values.push(rng.gen_range(-1.0..1.0));
            }
        }
        col_ptr.push(I::truncate(row_ind.len()));
    }
    (col_ptr, row_ind, values)
}

/// Expands lower CSC input (solver input conventions: strict upper entries
/// ignored, duplicates summed) into a full dense symmetric matrix.
pub fn dense_from_lower_input<I: Index>(
    n: usize,
    col_ptr: &[I],
    row_ind: &[I],
    values: &[f64],
) -> Mat<f64> {
    let mut a = Mat::<f64>::zeros(n, n);
    for j in 0..n {
        for idx in col_ptr[j].zx()..col_ptr[j + 1].zx() {
            let i = row_ind[idx].zx();
            if i < j || i >= n {
                continue;
            }
            let v = a.read(i, j) + values[idx];
            a.write(i, j, v);
            a.write(j, i, v);
        }
    }
    a
}

/// Boolean Cholesky fill of a sorted lower CSC pattern: `fill[i][j]` is true
/// when L has a (structural) entry at `(i, j)`, `i >= j`.
pub fn dense_bool_fill<I: Index>(n: usize, col_ptr: &[I], row_ind: &[I]) -> Vec<Vec<bool>> {
    let mut fill = vec![vec![false; n]; n];
    for j in 0..n {
        for idx in col_ptr[j].zx()..col_ptr[j + 1].zx() {
            fill[row_ind[idx].zx()][j] = true;
        }
    }
    for k in 0..n {
        let nbrs = (k + 1..n).filter(|&i| fill[i][k]).collect::<Vec<_>>();
        for (a, &i) in nbrs.iter().enumerate() {
            for &i2 in &nbrs[a..] {
                fill[i2][i] = true;
            }
        }
    }
    fill
}

/// `max_i |(A x - b)_i|` column by column.
pub fn residual_inf(a: MatRef<'_, f64>, x: MatRef<'_, f64>, b: MatRef<'_, f64>) -> f64 {
    let m = a.nrows();
    let k = x.ncols();
    let mut worst = 0.0f64;
    for col in 0..k {
        for i in 0..m {
            let mut acc = -b.read(i, col);
            for j in 0..m {
                acc += a.read(i, j) * x.read(j, col);
            }
            worst = worst.max(acc.abs());
        }
    }
    worst
}
