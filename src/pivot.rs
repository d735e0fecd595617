//! Dense in-front factorization kernels.
//!
//! A front is an `m×m` column-major block of which only the lower triangle
//! is meaningful. Its first `ncand` columns are pivot candidates; the
//! remaining rows/columns belong to the contribution block handed to the
//! parent front and are not updated here (the caller applies the Schur
//! complement with a rank-`k` update afterwards).
//!
//! Candidate columns failing the threshold test are swapped to the back of
//! the candidate range and delayed to the parent. The root front cannot
//! delay: it retries with relaxed tolerance and, when permitted, zeroes
//! numerically negligible pivots, recording a rank deficiency.

use crate::{FrontalError, Index};
use assert2::{assert, debug_assert};
use faer_core::MatMut;
use reborrow::*;

#[derive(Copy, Clone, Debug)]
pub(crate) struct PivotParams {
    pub u: f64,
    pub small: f64,
    pub action: bool,
    pub is_root: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct PivotInfo {
    pub nelim: usize,
    pub ndelay: usize,
    pub num_two: usize,
    pub num_neg: usize,
    pub num_zero: usize,
}

/// Swaps rows/columns `i` and `j` (`i < j`) of a symmetric matrix stored in
/// its lower triangle.
fn swap_symmetric(mut a: MatMut<'_, f64>, i: usize, j: usize) {
    debug_assert!(i < j);
    let m = a.nrows();

    for k in 0..i {
        let t = a.read(i, k);
        a.write(i, k, a.read(j, k));
        a.write(j, k, t);
    }
    for k in i + 1..j {
        let t = a.read(k, i);
        a.write(k, i, a.read(j, k));
        a.write(j, k, t);
    }
    for k in j + 1..m {
        let t = a.read(k, i);
        a.write(k, i, a.read(k, j));
        a.write(k, j, t);
    }
    let t = a.read(i, i);
    a.write(i, i, a.read(j, j));
    a.write(j, j, t);
}

/// Index and magnitude of the largest entry of column `col` in rows
/// `from..m`.
fn col_abs_max(a: faer_core::MatRef<'_, f64>, col: usize, from: usize) -> (usize, f64) {
    let m = a.nrows();
    let mut imax = from;
    let mut best = 0.0f64;
    for i in from..m {
        let v = a.read(i, col).abs();
        if v > best {
            best = v;
            imax = i;
        }
    }
    (imax, best)
}

/// Applies a 1×1 pivot at column `k`: divides the column by the pivot and
/// right-looking updates the remaining candidate columns over all rows.
fn eliminate_1x1(mut a: MatMut<'_, f64>, k: usize, ncand: usize, d: &mut [f64]) {
    let m = a.nrows();
    let d_k = a.read(k, k);
    let dinv = 1.0 / d_k;

    for i in k + 1..m {
        a.write(i, k, a.read(i, k) * dinv);
    }
    for j in k + 1..ncand {
        let lj_d = a.read(j, k) * d_k;
        if lj_d != 0.0 {
            for i in j..m {
                unsafe {
                    a.write_unchecked(i, j, a.read_unchecked(i, j) - a.read_unchecked(i, k) * lj_d)
                };
            }
        }
    }
    a.write(k, k, 1.0);
    d[2 * k] = d_k;
    d[2 * k + 1] = 0.0;
}

/// Applies a 2×2 pivot at columns `(k, k + 1)`.
fn eliminate_2x2(mut a: MatMut<'_, f64>, k: usize, ncand: usize, d: &mut [f64]) {
    let m = a.nrows();
    let a11 = a.read(k, k);
    let a21 = a.read(k + 1, k);
    let a22 = a.read(k + 1, k + 1);
    let det = a11 * a22 - a21 * a21;
    let i11 = a22 / det;
    let i21 = -a21 / det;
    let i22 = a11 / det;

    for i in k + 2..m {
        let w1 = a.read(i, k);
        let w2 = a.read(i, k + 1);
        a.write(i, k, w1 * i11 + w2 * i21);
        a.write(i, k + 1, w1 * i21 + w2 * i22);
    }
    for j in k + 2..ncand {
        let l1 = a.read(j, k);
        let l2 = a.read(j, k + 1);
        let c1 = a11 * l1 + a21 * l2;
        let c2 = a21 * l1 + a22 * l2;
        if c1 != 0.0 || c2 != 0.0 {
            for i in j..m {
                unsafe {
                    a.write_unchecked(
                        i,
                        j,
                        a.read_unchecked(i, j)
                            - a.read_unchecked(i, k) * c1
                            - a.read_unchecked(i, k + 1) * c2,
                    )
                };
            }
        }
    }
    a.write(k, k, 1.0);
    a.write(k + 1, k + 1, 1.0);
    a.write(k + 1, k, 0.0);

    d[2 * k] = a11;
    d[2 * k + 1] = a21;
    d[2 * k + 2] = a22;
    d[2 * k + 3] = 0.0;
}

/// Zeroes a numerically negligible pivot column, recording the rank
/// deficiency instead of failing.
fn eliminate_zero(mut a: MatMut<'_, f64>, k: usize) {
    let m = a.nrows();
    for i in k + 1..m {
        a.write(i, k, 0.0);
    }
    a.write(k, k, 1.0);
}

/// Threshold partial pivoting with 1×1 and 2×2 pivots and delayed columns.
///
/// On return the first `nelim` columns hold the unit-lower factor panel and
/// `d` holds the corresponding diagonal blocks (two slots per column; a 2×2
/// pair is flagged by a nonzero second slot of its first column). Delayed
/// columns sit in `nelim..ncand`, already updated by the accepted pivots.
/// `rows` is permuted alongside the front.
pub(crate) fn factor_front_indefinite<I: Index>(
    mut a: MatMut<'_, f64>,
    rows: &mut [I],
    ncand: usize,
    d: &mut [f64],
    params: &PivotParams,
) -> Result<PivotInfo, FrontalError> {
    let m = a.nrows();
    assert!(a.ncols() == m);
    assert!(rows.len() == m);
    assert!(ncand <= m);
    assert!(d.len() >= 2 * ncand);
    if params.is_root {
        // the root has no contribution rows to hand anywhere
        assert!(ncand == m);
    }

    let u = params.u.clamp(0.0, 0.5);
    let small = params.small.abs();

    let mut info = PivotInfo::default();
    let mut pend = ncand;

    let mut k = 0usize;
    while k < pend {
        let akk = a.read(k, k);
        let (imax, colmax) = col_abs_max(a.rb(), k, k + 1);

        // 1×1 threshold test
        if akk.abs() > small && akk.abs() >= u * colmax {
            if akk < 0.0 {
                info.num_neg += 1;
            }
            eliminate_1x1(a.rb_mut(), k, ncand, d);
            k += 1;
            continue;
        }

        // 2×2 with the strongest available partner; only an active
        // candidate may be eliminated together with column k
        if k + 1 < pend {
            let r = if imax > k + 1 && imax < pend { imax } else { k + 1 };
            if r != k + 1 {
                swap_symmetric(a.rb_mut(), k + 1, r);
                rows.swap(k + 1, r);
            }

            let b = a.read(k + 1, k);
            let c = a.read(k + 1, k + 1);
            let det = akk * c - b * b;
            let (_, colmax1) = col_abs_max(a.rb(), k, k + 2);
            let (_, colmax2) = col_abs_max(a.rb(), k + 1, k + 2);

            if det.abs() > small {
                let i11 = (c / det).abs();
                let i21 = (b / det).abs();
                let i22 = (akk / det).abs();
                let growth1 = i11 * colmax1 + i21 * colmax2;
                let growth2 = i21 * colmax1 + i22 * colmax2;
                if u * growth1 <= 1.0 && u * growth2 <= 1.0 {
                    info.num_two += 1;
                    info.num_neg += if det < 0.0 {
                        1
                    } else if akk + c < 0.0 {
                        2
                    } else {
                        0
                    };
                    eliminate_2x2(a.rb_mut(), k, ncand, d);
                    k += 2;
                    continue;
                }
            }
        }

        if !params.is_root {
            // delay the column into the parent front
            pend -= 1;
            if k != pend {
                swap_symmetric(a.rb_mut(), k, pend);
                rows.swap(k, pend);
            }
            info.ndelay += 1;
            continue;
        }

        // root: relaxed acceptance, then the singular path
        if akk.abs() > small {
            if akk < 0.0 {
                info.num_neg += 1;
            }
            eliminate_1x1(a.rb_mut(), k, ncand, d);
            k += 1;
            continue;
        }

        if !params.action {
            return Err(FrontalError::Singular);
        }
        eliminate_zero(a.rb_mut(), k);
        d[2 * k] = 0.0;
        d[2 * k + 1] = 0.0;
        info.num_zero += 1;
        k += 1;
    }

    info.nelim = k;
    debug_assert!(info.nelim + info.ndelay == ncand);
    Ok(info)
}

/// Unpivoted LDLᵀ panel factorization for the positive-definite path. Fails
/// on any pivot at or below the `small` threshold.
pub(crate) fn factor_front_posdef(
    mut a: MatMut<'_, f64>,
    ncand: usize,
    d: &mut [f64],
    small: f64,
) -> Result<PivotInfo, FrontalError> {
    let m = a.nrows();
    assert!(a.ncols() == m);
    assert!(ncand <= m);
    assert!(d.len() >= 2 * ncand);
    let small = small.abs();

    for k in 0..ncand {
        if !(a.read(k, k) > small) {
            return Err(FrontalError::NotPositiveDefinite);
        }
        eliminate_1x1(a.rb_mut(), k, ncand, d);
    }

    Ok(PivotInfo {
        nelim: ncand,
        ..PivotInfo::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use faer_core::Mat;
    use rand::prelude::*;

    fn params(is_root: bool) -> PivotParams {
        PivotParams {
            u: 0.01,
            small: 1e-20,
            action: true,
            is_root,
        }
    }

    // reconstructs P A Pᵀ from the factored panel and compares against the
    // original symmetric matrix
    fn check_root_factorization(a0: &Mat<f64>, a: &Mat<f64>, rows: &[i64], d: &[f64], tol: f64) {
        let m = a0.nrows();
        let l = {
            let mut l = Mat::<f64>::zeros(m, m);
            for j in 0..m {
                l.write(j, j, 1.0);
                for i in j + 1..m {
                    l.write(i, j, a.read(i, j));
                }
            }
            l
        };
        let dm = {
            let mut dm = Mat::<f64>::zeros(m, m);
            let mut k = 0;
            while k < m {
                if d[2 * k + 1] != 0.0 {
                    dm.write(k, k, d[2 * k]);
                    dm.write(k + 1, k, d[2 * k + 1]);
                    dm.write(k, k + 1, d[2 * k + 1]);
                    dm.write(k + 1, k + 1, d[2 * k + 2]);
                    k += 2;
                } else {
                    dm.write(k, k, d[2 * k]);
                    k += 1;
                }
            }
            dm
        };
        let ldl = &l * &dm * l.transpose();
        for i in 0..m {
            for j in 0..m {
                let expected = a0.read(rows[i] as usize, rows[j] as usize);
                assert!(
                    (ldl.read(i, j) - expected).abs() <= tol,
                    "mismatch at ({i}, {j})"
                );
            }
        }
    }

    #[test]
    fn random_symmetric_root_front() {
        let mut rng = StdRng::seed_from_u64(0);
        for m in [1usize, 2, 3, 5, 8, 13] {
            let a0 = random_symmetric(&mut rng, m);
            let mut a = a0.clone();
            let mut rows = (0..m as i64).collect::<Vec<_>>();
            let mut d = vec![0.0f64; 2 * m];

            let info =
                factor_front_indefinite(a.as_mut(), &mut rows, m, &mut d, &params(true)).unwrap();
            assert_eq!(info.nelim, m);
            assert_eq!(info.ndelay, 0);
            check_root_factorization(&a0, &a, &rows, &d, 1e-8);
        }
    }

    #[test]
    fn zero_diagonal_forces_two_by_two() {
        // [[0, 1, 0], [1, 0, 1], [0, 1, 1]]
        let mut a = Mat::<f64>::zeros(3, 3);
        a.write(1, 0, 1.0);
        a.write(2, 1, 1.0);
        a.write(2, 2, 1.0);
        let a0 = {
            let mut full = Mat::<f64>::zeros(3, 3);
            for j in 0..3 {
                for i in j..3 {
                    full.write(i, j, a.read(i, j));
                    full.write(j, i, a.read(i, j));
                }
            }
            full
        };
        let mut rows = vec![0i64, 1, 2];
        let mut d = vec![0.0f64; 6];

        let info =
            factor_front_indefinite(a.as_mut(), &mut rows, 3, &mut d, &params(true)).unwrap();
        assert_eq!(info.nelim, 3);
        assert!(info.num_two >= 1);
        assert!(info.num_neg >= 1);
        check_root_factorization(&a0, &a, &rows, &d, 1e-12);
    }

    #[test]
    fn weak_diagonal_is_delayed() {
        // a tiny diagonal entry coupled to a contribution row cannot be
        // eliminated in this front
        let m = 3;
        let mut a = Mat::<f64>::zeros(m, m);
        a.write(0, 0, 1e-12);
        a.write(2, 0, 1.0);
        a.write(1, 1, 4.0);
        a.write(2, 2, 0.0);
        let mut rows = vec![0i64, 1, 2];
        let mut d = vec![0.0f64; 4];

        let info =
            factor_front_indefinite(a.as_mut(), &mut rows, 2, &mut d, &params(false)).unwrap();
        assert_eq!(info.ndelay, 1);
        assert_eq!(info.nelim, 1);
        // the delayed column was swapped to the back of the candidate range
        assert_eq!(rows, vec![1, 0, 2]);
    }

    #[test]
    fn singular_root_respects_action() {
        let mut a = Mat::<f64>::zeros(2, 2);
        a.write(0, 0, 1.0);
        let mut rows = vec![0i64, 1];
        let mut d = vec![0.0f64; 4];

        let mut a1 = a.clone();
        let info =
            factor_front_indefinite(a1.as_mut(), &mut rows, 2, &mut d, &params(true)).unwrap();
        assert_eq!(info.num_zero, 1);

        let mut rows = vec![0i64, 1];
        let err = factor_front_indefinite(
            a.as_mut(),
            &mut rows,
            2,
            &mut d,
            &PivotParams {
                action: false,
                ..params(true)
            },
        )
        .err();
        assert_eq!(err, Some(FrontalError::Singular));
    }

    #[test]
    fn posdef_panel_rejects_indefinite() {
        let mut a = Mat::<f64>::zeros(2, 2);
        a.write(0, 0, 1.0);
        a.write(1, 1, -1.0);
        let mut d = vec![0.0f64; 4];
        assert_eq!(
            factor_front_posdef(a.as_mut(), 2, &mut d, 1e-20).err(),
            Some(FrontalError::NotPositiveDefinite)
        );

        let mut rng = StdRng::seed_from_u64(1);
        for m in [1usize, 4, 9] {
            let a0 = random_spd(&mut rng, m);
            let mut a = a0.clone();
            let mut d = vec![0.0f64; 2 * m];
            let info = factor_front_posdef(a.as_mut(), m, &mut d, 1e-20).unwrap();
            assert_eq!(info.nelim, m);
            let rows = (0..m as i64).collect::<Vec<_>>();
            check_root_factorization(&a0, &a, &rows, &d, 1e-8 * (m as f64));
        }
    }
}
