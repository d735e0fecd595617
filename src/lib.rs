//! Sparse symmetric indefinite direct solver.
//!
//! Given a sparse symmetric matrix (positive definite or indefinite), this
//! crate computes a multifrontal Cholesky or pivoted LDLᵀ factorization and
//! reuses it to solve `Ax = b` for many right-hand sides without
//! refactorizing.
//!
//! The solver runs in three phases:
//! - [`analyse`] consumes the sparsity pattern (and an optional fill-reducing
//!   permutation) and produces an immutable [`Symbolic`] structure,
//! - [`Symbolic::factor`] consumes the numerical values and produces a
//!   [`Numeric`] factor together with an [`Inform`] record of statistics,
//! - [`Numeric::solve_in_place`] performs any composition of the
//!   forward/diagonal/backward substitution phases.
//!
//! Dense kernels (matrix multiply, triangular solves) are delegated to
//! `faer-core`. Frontal matrices live in per-worker arenas built on
//! `dyn-stack`, sized during the symbolic phase so that the numeric phase
//! never reallocates.

#![forbid(elided_lifetimes_in_paths)]
#![allow(non_snake_case)]
#![allow(clippy::too_many_arguments)]

use bytemuck::Pod;
use dyn_stack::{SizeOverflow, StackReq};

pub use faer_core::Parallelism;

macro_rules! impl_copy {
    (< $($lt_param: lifetime),* >< $($ty_param: ident $(: $tt: tt)?),* > <$ty: ty>) => {
        impl<$($lt_param,)* $($ty_param $(: $tt)?,)*> Copy for $ty {}
        impl<$($lt_param,)* $($ty_param $(: $tt)?,)*> Clone for $ty {
            #[inline(always)]
            fn clone(&self) -> Self {
                *self
            }
        }
    };
}

mod arena;
mod mem;
mod pivot;

pub mod factor;
pub mod solve;
pub mod symbolic;

#[cfg(test)]
pub(crate) mod test_util;

pub use factor::Numeric;
pub use solve::Job;
pub use symbolic::{analyse, analyse_coord, Symbolic};

mod seal {
    pub trait Seal {}

    impl Seal for i32 {}
    impl Seal for i64 {}
}

/// Signed index type usable for sparse structures and permutations.
///
/// The all-ones bit pattern (`-1`) is reserved as the `none` sentinel.
pub trait Index:
    seal::Seal
    + core::ops::Add<Output = Self>
    + core::ops::Sub<Output = Self>
    + core::ops::AddAssign
    + core::ops::SubAssign
    + Copy
    + Pod
    + Eq
    + Ord
    + Send
    + Sync
    + 'static
    + core::fmt::Debug
{
    #[inline]
    fn incr(&mut self) {
        *self += Self::truncate(1)
    }
    #[inline]
    fn decr(&mut self) {
        *self -= Self::truncate(1)
    }

    const MAX: Self;

    #[must_use]
    fn truncate(value: usize) -> Self;

    /// zero extend
    #[must_use]
    fn zx(self) -> usize;
    /// sign extend
    #[must_use]
    fn sx(self) -> usize;

    /// sum with overflow check
    #[must_use]
    fn sum_nonnegative(slice: &[Self]) -> Option<Self>;
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl Index for i32 {
    const MAX: Self = Self::MAX;

    #[inline(always)]
    fn truncate(value: usize) -> Self {
        const _: () = {
            core::assert!(i32::BITS <= usize::BITS);
        };
        value as isize as Self
    }

    #[inline(always)]
    fn zx(self) -> usize {
        self as u32 as usize
    }

    #[inline(always)]
    fn sx(self) -> usize {
        self as isize as usize
    }

    #[inline]
    fn sum_nonnegative(slice: &[Self]) -> Option<Self> {
        let mut total = 0i32;
        for &v in slice {
            if v < 0 {
                return None;
            }
            total = total.checked_add(v)?;
        }
        Some(total)
    }
}

#[cfg(target_pointer_width = "64")]
impl Index for i64 {
    const MAX: Self = Self::MAX;

    #[inline(always)]
    fn truncate(value: usize) -> Self {
        const _: () = {
            core::assert!(i64::BITS <= usize::BITS);
        };
        value as isize as Self
    }

    #[inline(always)]
    fn zx(self) -> usize {
        self as u64 as usize
    }

    #[inline(always)]
    fn sx(self) -> usize {
        self as isize as usize
    }

    #[inline]
    fn sum_nonnegative(slice: &[Self]) -> Option<Self> {
        let mut total = 0i64;
        for &v in slice {
            if v < 0 {
                return None;
            }
            total = total.checked_add(v)?;
        }
        Some(total)
    }
}

/// Fatal errors reported by the analyse/factor/solve phases.
///
/// Recoverable anomalies (duplicate entries, out-of-range indices, missing
/// diagonal entries, permitted rank deficiency) are not errors: they are
/// counted in [`Inform`] and processing continues.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[non_exhaustive]
pub enum FrontalError {
    IndexOverflow,
    OutOfMemory,
    /// `n` is not representable in the index type.
    InvalidDimension,
    /// Malformed column pointer array, or mismatched array lengths.
    InvalidPattern,
    /// The supplied elimination order is not a permutation of `0..n`.
    InvalidOrder,
    /// Right-hand side dimensions do not match the factor.
    InvalidRhs,
    /// The matrix is singular and [`Options::action`] is `false`.
    Singular,
    /// A nonpositive pivot was met in positive-definite mode.
    NotPositiveDefinite,
}

impl core::fmt::Display for FrontalError {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for FrontalError {}

impl FrontalError {
    /// Status code stored in [`Inform::flag`] for this error.
    #[inline]
    pub fn flag(self) -> i32 {
        match self {
            FrontalError::InvalidDimension => flag::ERROR_DIMENSION,
            FrontalError::InvalidPattern => flag::ERROR_PATTERN,
            FrontalError::InvalidOrder => flag::ERROR_ORDER,
            FrontalError::InvalidRhs => flag::ERROR_RHS,
            FrontalError::Singular => flag::ERROR_SINGULAR,
            FrontalError::NotPositiveDefinite => flag::ERROR_NOT_POS_DEF,
            FrontalError::OutOfMemory => flag::ERROR_ALLOC,
            FrontalError::IndexOverflow => flag::ERROR_INDEX_OVERFLOW,
        }
    }
}

/// Status codes stored in [`Inform::flag`].
///
/// Zero is success, positive values are warnings, negative values mirror the
/// fatal [`FrontalError`] conditions.
pub mod flag {
    pub const SUCCESS: i32 = 0;
    /// Duplicate, out-of-range, or missing-diagonal entries were found and
    /// repaired; see the `matrix_*` counts.
    pub const WARN_MATRIX_ANOMALY: i32 = 1;
    /// The factorization completed but the matrix is rank deficient; see
    /// `matrix_rank`.
    pub const WARN_RANK_DEFICIENT: i32 = 4;

    pub const ERROR_DIMENSION: i32 = -1;
    pub const ERROR_PATTERN: i32 = -2;
    pub const ERROR_ORDER: i32 = -3;
    pub const ERROR_RHS: i32 = -4;
    pub const ERROR_SINGULAR: i32 = -5;
    pub const ERROR_NOT_POS_DEF: i32 = -6;
    pub const ERROR_ALLOC: i32 = -50;
    pub const ERROR_INDEX_OVERFLOW: i32 = -51;
}

#[inline]
#[track_caller]
pub(crate) fn try_zeroed<I: Pod>(n: usize) -> Result<Vec<I>, FrontalError> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).map_err(nomem)?;
    unsafe {
        core::ptr::write_bytes::<I>(v.as_mut_ptr(), 0u8, n);
        v.set_len(n);
    }
    Ok(v)
}

#[inline]
#[track_caller]
pub(crate) fn try_collect<I: IntoIterator>(iter: I) -> Result<Vec<I::Item>, FrontalError>
where
    I::IntoIter: ExactSizeIterator,
{
    let iter = iter.into_iter();
    let mut v = Vec::new();
    v.try_reserve_exact(iter.len()).map_err(nomem)?;
    v.extend(iter);
    Ok(v)
}

#[inline]
pub(crate) fn nomem<T>(_: T) -> FrontalError {
    FrontalError::OutOfMemory
}

#[inline(always)]
pub(crate) fn windows2<I>(slice: &[I]) -> impl DoubleEndedIterator<Item = &[I; 2]> {
    slice
        .windows(2)
        .map(|window| unsafe { &*(window.as_ptr() as *const [I; 2]) })
}

#[inline]
pub(crate) fn __try_any_of(
    reqs: impl IntoIterator<Item = StackReq>,
) -> Result<StackReq, SizeOverflow> {
    let mut total = StackReq::empty();
    for req in reqs {
        total = total.try_or(req)?;
    }
    Ok(total)
}

/// Selects the elimination order used by [`analyse`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Ordering {
    /// Use the caller-supplied order when one is passed, the natural order
    /// otherwise.
    #[default]
    Auto,
    /// Always use the natural (identity) order.
    Natural,
    /// Require a caller-supplied order; its absence is an error.
    Given,
}

/// Pre-scaling applied to improve numerical stability.
///
/// Scale factors are computed during factorization, stored with the factor,
/// and consistently undone during the solve phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Scaling {
    #[default]
    None,
    /// Symmetric equilibration: `s[i] = 1 / sqrt(max_j |a[i][j]|)`.
    MaxElement,
}

/// Solver tunables. [`Options::default`] returns the documented defaults.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Options {
    /// Index base of the input arrays (0 or 1).
    pub array_base: usize,
    /// Diagnostic verbosity routed through the `log` facade. Nothing is
    /// emitted at level 0.
    pub print_level: i32,
    pub ordering: Ordering,
    /// Supernode amalgamation threshold: adjacent tree nodes are merged when
    /// either has fewer than `nemin` columns, trading explicit zeros for
    /// larger dense fronts.
    pub nemin: usize,
    pub scaling: Scaling,
    /// When `true`, a singular pivot is zeroed and recorded as a rank
    /// deficiency instead of aborting the factorization.
    pub action: bool,
    /// Absolute pivot acceptance threshold.
    pub small: f64,
    /// Relative pivot threshold; multipliers are bounded by `1/u`. Clamped
    /// to `[0, 0.5]`.
    pub u: f64,
    /// Route solves through the staged, accelerator-resident path. Falls
    /// back to the host path when no accelerator backend is available.
    pub use_gpu_solve: bool,
    /// Precompute solve-acceleration structures at factor time.
    pub presolve: bool,
    /// Parallelism used for the tree traversal and the dense kernels.
    pub parallelism: Parallelism,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            array_base: 0,
            print_level: 0,
            ordering: Ordering::Auto,
            nemin: 8,
            scaling: Scaling::None,
            action: true,
            small: 1e-20,
            u: 0.01,
            use_gpu_solve: false,
            presolve: false,
            parallelism: Parallelism::Rayon(0),
        }
    }
}

/// Diagnostics accumulated by the analyse/factor/solve phases.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Inform {
    /// Status code; see the [`flag`] constants.
    pub flag: i32,
    /// Number of duplicate entries merged into their first occurrence.
    pub matrix_dup: usize,
    /// Number of diagonal entries structurally absent from the input.
    pub matrix_missing_diag: usize,
    /// Number of input entries dropped as out of range.
    pub matrix_outrange: usize,
    /// Realized numerical rank of the matrix.
    pub matrix_rank: usize,
    /// Depth of the assembly tree.
    pub maxdepth: usize,
    /// Largest front order (rows), including delayed pivots once the numeric
    /// phase has run.
    pub maxfront: usize,
    /// Total number of delayed pivots over all fronts.
    pub num_delay: usize,
    /// Entries stored in the factor.
    pub num_factor: u64,
    /// Floating-point operations performed (or forecast, after analyse).
    pub num_flops: u64,
    /// Number of negative eigenvalues of the factored matrix.
    pub num_neg: usize,
    /// Number of supernodes (fronts) in the assembly tree.
    pub num_sup: usize,
    /// Number of 2×2 pivots used.
    pub num_two: usize,
    /// Allocation failure indicator (nonzero on allocation failure).
    pub stat: i32,
    /// Accelerator error codes; zero when the host backend served the solve.
    pub cuda_error: i32,
    pub cublas_error: i32,
}

mod __core {
    use super::*;
    use assert2::{assert, debug_assert};
    use core::ops::Range;

    #[derive(Debug)]
    pub struct PermutationRef<'a, I> {
        fwd: &'a [I],
        inv: &'a [I],
    }

    #[derive(Debug)]
    pub struct SymbolicSparseColMatRef<'a, I> {
        nrows: usize,
        ncols: usize,
        col_ptr: &'a [I],
        row_ind: &'a [I],
    }

    #[derive(Debug)]
    pub struct SparseColMatRef<'a, I> {
        symbolic: SymbolicSparseColMatRef<'a, I>,
        val: &'a [f64],
    }

    impl<'a, I: Index> PermutationRef<'a, I> {
        #[inline]
        #[track_caller]
        pub fn new_checked(fwd: &'a [I], inv: &'a [I]) -> Self {
            let n = fwd.len();
            assert!(fwd.len() == inv.len());
            assert!(n < I::MAX.zx());
            for (i, &p) in fwd.iter().enumerate() {
                let p = p.sx();
                assert!(p < n);
                assert!(inv[p].sx() == i);
            }
            Self { fwd, inv }
        }

        #[inline]
        #[track_caller]
        pub unsafe fn new_unchecked(fwd: &'a [I], inv: &'a [I]) -> Self {
            let n = fwd.len();
            let _ = n;
            debug_assert!(fwd.len() == inv.len());
            debug_assert!(n < I::MAX.zx());
            Self { fwd, inv }
        }

        #[inline]
        pub fn fwd_inv(self) -> (&'a [I], &'a [I]) {
            (self.fwd, self.inv)
        }

        #[inline]
        pub fn len(self) -> usize {
            self.fwd.len()
        }
    }

    /// Requires:
    /// * `nrows <= I::MAX`, `ncols <= I::MAX` (always checked)
    /// * `col_ptrs` has length `ncols + 1` and is non-decreasing
    /// * `col_ptrs[0]..col_ptrs[ncols]` is a valid range in `row_indices`
    /// * elements of `row_indices[col_ptrs[j]..col_ptrs[j + 1]]` are less
    ///   than `nrows`
    impl<'a, I: Index> SymbolicSparseColMatRef<'a, I> {
        #[inline]
        #[track_caller]
        pub fn new_checked(
            nrows: usize,
            ncols: usize,
            col_ptrs: &'a [I],
            row_indices: &'a [I],
        ) -> Self {
            assert!(ncols <= I::MAX.zx());
            assert!(nrows <= I::MAX.zx());
            assert!(col_ptrs.len() == ncols + 1);
            assert!(col_ptrs[0] >= I::truncate(0));
            for &[c, c_next] in windows2(col_ptrs) {
                assert!(c <= c_next);
            }
            assert!(col_ptrs[ncols].zx() <= row_indices.len());

            let c0 = col_ptrs[0].zx();
            let cn = col_ptrs[ncols].zx();
            for &i in &row_indices[c0..cn] {
                assert!(i.sx() < nrows);
            }

            Self {
                nrows,
                ncols,
                col_ptr: col_ptrs,
                row_ind: row_indices,
            }
        }

        #[inline(always)]
        #[track_caller]
        pub unsafe fn new_unchecked(
            nrows: usize,
            ncols: usize,
            col_ptrs: &'a [I],
            row_indices: &'a [I],
        ) -> Self {
            assert!(ncols <= I::MAX.zx());
            assert!(nrows <= I::MAX.zx());
            assert!(col_ptrs.len() == ncols + 1);
            assert!(col_ptrs[0] >= I::truncate(0));
            assert!(col_ptrs[ncols].zx() <= row_indices.len());

            Self {
                nrows,
                ncols,
                col_ptr: col_ptrs,
                row_ind: row_indices,
            }
        }

        #[inline]
        pub fn nrows(&self) -> usize {
            self.nrows
        }
        #[inline]
        pub fn ncols(&self) -> usize {
            self.ncols
        }

        #[inline]
        pub fn compute_nnz(&self) -> usize {
            self.col_ptr[self.ncols].zx() - self.col_ptr[0].zx()
        }

        #[inline]
        pub fn col_ptrs(&self) -> &'a [I] {
            self.col_ptr
        }

        #[inline]
        pub fn row_indices(&self) -> &'a [I] {
            self.row_ind
        }

        #[inline]
        #[track_caller]
        pub fn row_indices_of_col_raw(&self, j: usize) -> &'a [I] {
            &self.row_ind[self.col_range(j)]
        }

        #[inline]
        #[track_caller]
        pub fn row_indices_of_col(
            &self,
            j: usize,
        ) -> impl 'a + ExactSizeIterator + DoubleEndedIterator<Item = usize> {
            self.row_indices_of_col_raw(j).iter().map(
                #[inline(always)]
                |&i| i.zx(),
            )
        }

        #[inline]
        #[track_caller]
        pub fn col_range(&self, j: usize) -> Range<usize> {
            self.col_ptr[j].zx()..self.col_ptr[j + 1].zx()
        }
    }

    /// Requires: all the requirements of [`SymbolicSparseColMatRef`], and
    /// `values` must have the same length as `row_indices`.
    impl<'a, I: Index> SparseColMatRef<'a, I> {
        #[inline]
        #[track_caller]
        pub fn new(symbolic: SymbolicSparseColMatRef<'a, I>, values: &'a [f64]) -> Self {
            assert!(symbolic.row_ind.len() == values.len());
            Self {
                symbolic,
                val: values,
            }
        }

        #[inline]
        pub fn nrows(&self) -> usize {
            self.symbolic.nrows
        }
        #[inline]
        pub fn ncols(&self) -> usize {
            self.symbolic.ncols
        }

        #[inline]
        pub fn values(&self) -> &'a [f64] {
            self.val
        }

        #[inline]
        #[track_caller]
        pub fn row_indices_of_col(
            &self,
            j: usize,
        ) -> impl 'a + ExactSizeIterator + DoubleEndedIterator<Item = usize> {
            self.symbolic.row_indices_of_col(j)
        }

        #[inline]
        #[track_caller]
        pub fn values_of_col(&self, j: usize) -> &'a [f64] {
            &self.val[self.symbolic.col_range(j)]
        }

        #[inline]
        pub fn symbolic(self) -> SymbolicSparseColMatRef<'a, I> {
            self.symbolic
        }
    }
}

pub use __core::{PermutationRef, SparseColMatRef, SymbolicSparseColMatRef};

impl_copy!(<><I> <PermutationRef<'_, I>>);
impl_copy!(<><I> <SymbolicSparseColMatRef<'_, I>>);
impl_copy!(<><I> <SparseColMatRef<'_, I>>);

/// Returns the documented defaults for all tunables.
#[inline]
pub fn default_options() -> Options {
    Options::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documentation() {
        let opts = default_options();
        assert_eq!(opts.array_base, 0);
        assert_eq!(opts.nemin, 8);
        assert_eq!(opts.u, 0.01);
        assert_eq!(opts.small, 1e-20);
        assert!(opts.action);
        assert_eq!(opts.scaling, Scaling::None);
        assert_eq!(opts.ordering, Ordering::Auto);
        assert!(!opts.use_gpu_solve);
        assert!(!opts.presolve);
    }

    #[test]
    fn error_flags_are_negative() {
        for err in [
            FrontalError::IndexOverflow,
            FrontalError::OutOfMemory,
            FrontalError::InvalidDimension,
            FrontalError::InvalidPattern,
            FrontalError::InvalidOrder,
            FrontalError::InvalidRhs,
            FrontalError::Singular,
            FrontalError::NotPositiveDefinite,
        ] {
            assert!(err.flag() < 0);
        }
    }
}
