//! Triangular solves over the stored factor panels.
//!
//! Forward substitution walks the fronts in postorder (children feed their
//! parents), backward substitution walks in reverse, and the diagonal phase
//! applies the packed 1×1/2×2 inverse blocks in the realized pivot order.
//! Any composition of the phases can be selected through [`Job`].
//!
//! The factorization is of the scaled, permuted matrix, so a solve that
//! includes the forward phase maps the right-hand side into that space on
//! entry, and one that includes the backward phase maps the solution back
//! on exit; partial jobs compose exactly (`Forward` then `Diagonal` then
//! `Backward` is `Full`).

use crate::factor::Numeric;
use crate::{nomem, FrontalError, Index, Options};
use dyn_stack::{GlobalPodBuffer, PodStack, StackReq};
use faer_core::solve::{solve_unit_lower_triangular_in_place, solve_unit_upper_triangular_in_place};
use faer_core::{mul, temp_mat_req, temp_mat_uninit, MatMut, MatRef};
use reborrow::*;

/// Substitution phases applied by [`solve_in_place`], in the order
/// forward, diagonal, backward. Follows the SSIDS solve job convention
/// (codes 0 through 4).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Job {
    /// `A x = b`: forward, diagonal and backward.
    Full,
    /// Forward substitution only.
    Forward,
    /// Diagonal solve only.
    Diagonal,
    /// Backward substitution only.
    Backward,
    /// Diagonal solve followed by backward substitution.
    DiagonalBackward,
}

impl Job {
    #[inline]
    fn forward(self) -> bool {
        matches!(self, Job::Full | Job::Forward)
    }

    #[inline]
    fn diagonal(self) -> bool {
        matches!(self, Job::Full | Job::Diagonal | Job::DiagonalBackward)
    }

    #[inline]
    fn backward(self) -> bool {
        matches!(self, Job::Full | Job::Backward | Job::DiagonalBackward)
    }
}

/// Solves the phases selected by `job` in place.
///
/// `rhs` holds one right-hand side per column; a leading dimension larger
/// than `n` is expressed through the matrix view's column stride.
pub fn solve_in_place<I: Index>(
    numeric: &Numeric<'_, I>,
    job: Job,
    rhs: MatMut<'_, f64>,
    options: &Options,
) -> Result<(), FrontalError> {
    let symbolic = numeric.symbolic();
    let n = symbolic.nrows();
    if rhs.nrows() != n {
        return Err(FrontalError::InvalidRhs);
    }
    let k = rhs.ncols();
    if n == 0 || k == 0 {
        return Ok(());
    }
    let parallelism = options.parallelism;

    if options.print_level >= 2 {
        log::trace!("solve: job={job:?}, n={n}, nrhs={k}");
    }

    let req = || -> Result<StackReq, dyn_stack::SizeOverflow> {
        temp_mat_req::<f64>(n, k)?.try_and(temp_mat_req::<f64>(numeric.max_panel_rows(), k)?)
    };
    let mut mem = GlobalPodBuffer::try_new(req().map_err(nomem)?).map_err(nomem)?;
    let stack = PodStack::new(&mut mem);

    let mut rhs = rhs;
    let (fwd, _) = symbolic.perm().fwd_inv();
    let scale = numeric.scale();

    let (mut x, mut stack) = temp_mat_uninit::<f64>(n, k, stack);

    // into the scaled, permuted space
    if job.forward() {
        for j in 0..k {
            for i in 0..n {
                let s = scale.map_or(1.0, |s| s[i]);
                x.write(i, j, s * rhs.read(fwd[i].zx(), j));
            }
        }
    } else {
        for j in 0..k {
            for i in 0..n {
                x.write(i, j, rhs.read(i, j));
            }
        }
    }

    let post = symbolic.postorder();
    let fronts = numeric.fronts();

    if job.forward() {
        for &s in post {
            let s = s.zx();
            let ff = &fronts[s];
            let q = ff.nelim;
            if q == 0 {
                continue;
            }
            let m = ff.rows.len();
            let (head, tail) = panel(numeric, s);

            let (mut z, _) = temp_mat_uninit::<f64>(m, k, stack.rb_mut());
            let (mut z_top, mut z_bot) = z.rb_mut().split_at_row_mut(q);
            for j in 0..k {
                for i in 0..q {
                    z_top.write(i, j, x.read(ff.rows[i].zx(), j));
                }
            }
            solve_unit_lower_triangular_in_place(head, z_top.rb_mut(), parallelism);
            for j in 0..k {
                for i in 0..q {
                    x.write(ff.rows[i].zx(), j, z_top.read(i, j));
                }
            }
            if m > q {
                mul::matmul(z_bot.rb_mut(), tail, z_top.rb(), None, 1.0, parallelism);
                for j in 0..k {
                    for i in 0..m - q {
                        let g = ff.rows[q + i].zx();
                        x.write(g, j, x.read(g, j) - z_bot.read(i, j));
                    }
                }
            }
        }
    }

    if job.diagonal() {
        for &s in post {
            let s = s.zx();
            let ff = &fronts[s];
            let mut piv = 0usize;
            while piv < ff.nelim {
                if ff.d[2 * piv + 1] != 0.0 {
                    let (i11, i21, i22) = (ff.d[2 * piv], ff.d[2 * piv + 1], ff.d[2 * piv + 2]);
                    let g1 = ff.rows[piv].zx();
                    let g2 = ff.rows[piv + 1].zx();
                    for j in 0..k {
                        let x1 = x.read(g1, j);
                        let x2 = x.read(g2, j);
                        x.write(g1, j, i11 * x1 + i21 * x2);
                        x.write(g2, j, i21 * x1 + i22 * x2);
                    }
                    piv += 2;
                } else {
                    let inv = ff.d[2 * piv];
                    let g = ff.rows[piv].zx();
                    for j in 0..k {
                        x.write(g, j, inv * x.read(g, j));
                    }
                    piv += 1;
                }
            }
        }
    }

    if job.backward() {
        for &s in post.iter().rev() {
            let s = s.zx();
            let ff = &fronts[s];
            let q = ff.nelim;
            if q == 0 {
                continue;
            }
            let m = ff.rows.len();
            let (head, tail) = panel(numeric, s);

            let (mut z, _) = temp_mat_uninit::<f64>(m, k, stack.rb_mut());
            let (mut z_top, mut z_bot) = z.rb_mut().split_at_row_mut(q);
            for j in 0..k {
                for i in 0..q {
                    z_top.write(i, j, x.read(ff.rows[i].zx(), j));
                }
                for i in 0..m - q {
                    z_bot.write(i, j, x.read(ff.rows[q + i].zx(), j));
                }
            }
            if m > q {
                mul::matmul(
                    z_top.rb_mut(),
                    tail.transpose(),
                    z_bot.rb(),
                    Some(1.0),
                    -1.0,
                    parallelism,
                );
            }
            solve_unit_upper_triangular_in_place(head.transpose(), z_top.rb_mut(), parallelism);
            for j in 0..k {
                for i in 0..q {
                    x.write(ff.rows[i].zx(), j, z_top.read(i, j));
                }
            }
        }
    }

    // back to the caller's space
    if job.backward() {
        for j in 0..k {
            for i in 0..n {
                let s = scale.map_or(1.0, |s| s[i]);
                rhs.write(fwd[i].zx(), j, s * x.read(i, j));
            }
        }
    } else {
        for j in 0..k {
            for i in 0..n {
                rhs.write(i, j, x.read(i, j));
            }
        }
    }

    Ok(())
}

/// The unit-lower head and the subdiagonal tail of a front's panel, read
/// from the staged copies when the factor was staged (presolve or the
/// resident path), from the packed panel otherwise.
fn panel<'a, I: Index>(
    numeric: &'a Numeric<'_, I>,
    s: usize,
) -> (MatRef<'a, f64>, MatRef<'a, f64>) {
    let ff = &numeric.fronts()[s];
    let m = ff.rows.len();
    let q = ff.nelim;
    match numeric.stage() {
        Some(stage) => {
            let st = &stage[s];
            (
                faer_core::mat::from_column_major_slice::<f64>(&st.head, q, q),
                faer_core::mat::from_column_major_slice::<f64>(&st.tail, m - q, q),
            )
        }
        None => {
            let full = faer_core::mat::from_column_major_slice::<f64>(&ff.l, m, q);
            full.split_at_row(q)
        }
    }
}
