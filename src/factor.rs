//! Multifrontal numeric factorization.
//!
//! The assembly tree is walked child-before-parent. At each front: scatter
//! the original matrix entries and the children's trailing blocks into a
//! zeroed dense block, run the pivoting kernel, push the Schur complement of
//! the contribution rows with a rank-`k` update, then hand the trailing
//! block (delayed columns first) to the parent.
//!
//! Sibling subtrees are independent: above a work threshold they are
//! fork-joined, each branch owning a private arena, with statistics merged
//! on the way back up. A fatal error raises an abort flag; in-flight
//! siblings drain and no further fronts start.

use crate::arena::{self, WorkerArena};
use crate::mem::NONE;
use crate::pivot::{self, PivotParams};
use crate::symbolic::{flop_count, Symbolic};
use crate::{
    flag, nomem, try_collect, try_zeroed, FrontalError, Index, Inform, Options, Scaling,
    SparseColMatRef,
};
use assert2::debug_assert;
use core::iter::zip;
use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use dyn_stack::PodStack;
use faer_core::mul::triangular::{self, BlockStructure};
use faer_core::{join_raw, parallelism_degree, temp_mat_uninit, MatMut, Parallelism};
use reborrow::*;
use std::sync::Mutex;

// below this many flops a subtree is not worth forking
const SUBTREE_FORK_THRESHOLD: f64 = 128.0 * 128.0 * 128.0;

/// Numeric factor (the "fkeep").
///
/// Borrows the [`Symbolic`] structure it was produced from, which therefore
/// cannot change for the factor's lifetime. Dropping the factor releases all
/// of its storage.
#[derive(Debug)]
pub struct Numeric<'a, I> {
    symbolic: &'a Symbolic<I>,
    posdef: bool,
    fronts: Vec<FrontFactor<I>>,
    // scale factors, permuted order; None when scaling is disabled
    scale: Option<Vec<f64>>,
    stage: Option<Vec<SolveStage>>,
    max_panel_rows: usize,
    inform: Inform,
}

/// Factor data retained per front: the realized pivot order, the unit-lower
/// panel, and the packed inverted diagonal blocks.
#[derive(Debug)]
pub(crate) struct FrontFactor<I> {
    pub nelim: usize,
    /// Global (permuted) row ids; the first `nelim` are the pivots in
    /// elimination order.
    pub rows: Vec<I>,
    /// `rows.len() × nelim` column-major panel, unit diagonal stored.
    pub l: Vec<f64>,
    /// Two slots per eliminated column, SSIDS-style D⁻¹ packing: a 1×1
    /// pivot stores `(1/d, 0)`; a 2×2 pair stores `(inv11, inv21)` then
    /// `(inv22, 0)`, flagged by the nonzero second slot of its first
    /// column. A zeroed pivot stores `(0, 0)`.
    pub d: Vec<f64>,
}

impl<I> Default for FrontFactor<I> {
    fn default() -> Self {
        Self {
            nelim: 0,
            rows: Vec::new(),
            l: Vec::new(),
            d: Vec::new(),
        }
    }
}

/// Contiguous copies of the factor panels, staged at factor time for the
/// resident solve path.
#[derive(Debug)]
pub(crate) struct SolveStage {
    pub head: Vec<f64>,
    pub tail: Vec<f64>,
}

impl<'a, I: Index> Numeric<'a, I> {
    #[inline]
    pub fn nrows(&self) -> usize {
        self.symbolic.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.symbolic.nrows()
    }

    #[inline]
    pub fn posdef(&self) -> bool {
        self.posdef
    }

    /// Diagnostics of the factorization, including the analyse-phase
    /// anomaly counts.
    #[inline]
    pub fn inform(&self) -> &Inform {
        &self.inform
    }

    /// Realized numerical rank.
    #[inline]
    pub fn matrix_rank(&self) -> usize {
        self.inform.matrix_rank
    }

    /// Solves the selected phases in place for one or more right-hand
    /// sides; see [`crate::solve::solve_in_place`].
    #[inline]
    pub fn solve_in_place(
        &self,
        job: crate::Job,
        rhs: MatMut<'_, f64>,
        options: &Options,
    ) -> Result<(), FrontalError> {
        crate::solve::solve_in_place(self, job, rhs, options)
    }

    /// Single right-hand-side convenience over [`Numeric::solve_in_place`].
    #[inline]
    pub fn solve_slice_in_place(
        &self,
        job: crate::Job,
        rhs: &mut [f64],
        options: &Options,
    ) -> Result<(), FrontalError> {
        if rhs.len() != self.nrows() {
            return Err(FrontalError::InvalidRhs);
        }
        let n = rhs.len();
        let rhs = faer_core::mat::from_column_major_slice_mut::<f64>(rhs, n, 1);
        crate::solve::solve_in_place(self, job, rhs, options)
    }

    #[inline]
    pub(crate) fn symbolic(&self) -> &'a Symbolic<I> {
        self.symbolic
    }

    #[inline]
    pub(crate) fn fronts(&self) -> &[FrontFactor<I>] {
        &self.fronts
    }

    #[inline]
    pub(crate) fn scale(&self) -> Option<&[f64]> {
        self.scale.as_deref()
    }

    #[inline]
    pub(crate) fn stage(&self) -> Option<&[SolveStage]> {
        self.stage.as_deref()
    }

    #[inline]
    pub(crate) fn max_panel_rows(&self) -> usize {
        self.max_panel_rows
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Stats {
    num_delay: usize,
    num_neg: usize,
    num_two: usize,
    num_zero: usize,
    num_factor: u64,
    num_flops: u64,
    maxfront: usize,
}

impl Stats {
    fn merge(self, other: Self) -> Self {
        Self {
            num_delay: self.num_delay + other.num_delay,
            num_neg: self.num_neg + other.num_neg,
            num_two: self.num_two + other.num_two,
            num_zero: self.num_zero + other.num_zero,
            num_factor: self.num_factor + other.num_factor,
            num_flops: self.num_flops + other.num_flops,
            maxfront: Ord::max(self.maxfront, other.maxfront),
        }
    }
}

/// Marker for an aborted traversal; the originating error is recorded in
/// the shared context by whoever hit it first.
struct Stop;

/// Output slot a parent carves (from its own arena) for one child's
/// trailing block.
struct ContribSlot<'a, I> {
    vals: &'a mut [f64],
    rows: &'a mut [I],
    ndelay: usize,
    nrows: usize,
}

struct FrontsPtr<I>(*mut FrontFactor<I>);
// Safety: every supernode slot is written by exactly one task of the
// traversal, and the traversal joins before the vector is read.
unsafe impl<I> Send for FrontsPtr<I> {}
unsafe impl<I> Sync for FrontsPtr<I> {}

struct FactorCtx<'a, I> {
    symbolic: &'a Symbolic<I>,
    aval: &'a [f64],
    posdef: bool,
    u: f64,
    small: f64,
    action: bool,
    abort: AtomicBool,
    first_err: Mutex<Option<FrontalError>>,
    fronts: FrontsPtr<I>,
}

impl<I: Index> FactorCtx<'_, I> {
    fn fail(&self, err: FrontalError) -> Stop {
        let mut first = self.first_err.lock().unwrap();
        if first.is_none() {
            *first = Some(err);
        }
        self.abort.store(true, AtomicOrdering::Relaxed);
        Stop
    }
}

pub(crate) fn factorize<'a, I: Index>(
    symbolic: &'a Symbolic<I>,
    posdef: bool,
    values: &[f64],
    user_scale: Option<&[f64]>,
    options: &Options,
) -> Result<Numeric<'a, I>, FrontalError> {
    let n = symbolic.nrows();
    if values.len() != symbolic.expected_values_len() {
        return Err(FrontalError::InvalidPattern);
    }
    let none = I::truncate(NONE);

    // canonical values; duplicates accumulate into their shared slot
    let mut aval = try_zeroed::<f64>(symbolic.canon_len())?;
    for (e, &slot) in symbolic.entry_to_canon().iter().enumerate() {
        if slot != none {
            aval[slot.zx()] += values[e];
        }
    }

    let scale = match (user_scale, options.scaling) {
        (Some(user), _) => {
            if user.len() != n {
                return Err(FrontalError::InvalidPattern);
            }
            let (fwd, _) = symbolic.perm_arrays();
            let mut s = try_zeroed::<f64>(n)?;
            for (i, si) in s.iter_mut().enumerate() {
                *si = user[fwd[i].zx()];
            }
            Some(s)
        }
        (None, Scaling::None) => None,
        (None, Scaling::MaxElement) => Some(compute_scale(symbolic, &aval)?),
    };
    if let Some(s) = &scale {
        let col_ptr = symbolic.col_ptrs();
        let row_ind = symbolic.row_indices();
        for c in 0..n {
            for idx in col_ptr[c].zx()..col_ptr[c + 1].zx() {
                aval[idx] *= s[row_ind[idx].zx()] * s[c];
            }
        }
    }

    let n_sup = symbolic.n_supernodes();
    let mut fronts: Vec<FrontFactor<I>> = Vec::new();
    fronts.try_reserve_exact(n_sup).map_err(nomem)?;
    for _ in 0..n_sup {
        fronts.push(FrontFactor::default());
    }

    let ctx = FactorCtx {
        symbolic,
        aval: &aval,
        posdef,
        u: options.u,
        small: options.small,
        action: options.action,
        abort: AtomicBool::new(false),
        first_err: Mutex::new(None),
        fronts: FrontsPtr(fronts.as_mut_ptr()),
    };

    let stats = {
        let roots = symbolic.roots();
        let mut root_slots = roots.iter().map(|_| None).collect::<Vec<_>>();
        match factor_kids_worker(&ctx, roots, &mut root_slots, options.parallelism) {
            Ok(stats) => stats,
            Err(Stop) => {
                let err = ctx.first_err.lock().unwrap().take();
                return Err(err.unwrap_or(FrontalError::OutOfMemory));
            }
        }
    };

    let mut inform = *symbolic.inform();
    inform.num_delay = stats.num_delay;
    inform.num_neg = stats.num_neg;
    inform.num_two = stats.num_two;
    inform.num_factor = stats.num_factor;
    inform.num_flops = stats.num_flops;
    inform.maxfront = stats.maxfront;
    inform.matrix_rank = n - stats.num_zero;
    if stats.num_zero > 0 {
        inform.flag = flag::WARN_RANK_DEFICIENT;
    }

    let stage = if options.presolve || options.use_gpu_solve {
        Some(stage_fronts(&fronts)?)
    } else {
        None
    };

    if options.print_level >= 1 {
        log::debug!(
            "factor: n={n}, rank={}, delays={}, 2x2={}, neg={}, maxfront={}, flops={}",
            inform.matrix_rank,
            inform.num_delay,
            inform.num_two,
            inform.num_neg,
            inform.maxfront,
            inform.num_flops,
        );
    }

    Ok(Numeric {
        symbolic,
        posdef,
        fronts,
        scale,
        stage,
        max_panel_rows: stats.maxfront,
        inform,
    })
}

/// Symmetric equilibration: `s[i] = 1/sqrt(max_j |a[i][j]|)` over the
/// canonical pattern, in the permuted order.
fn compute_scale<I: Index>(symbolic: &Symbolic<I>, aval: &[f64]) -> Result<Vec<f64>, FrontalError> {
    let n = symbolic.nrows();
    let A_lower = SparseColMatRef::new(symbolic.canon_pattern(), aval);

    let mut maxabs = try_zeroed::<f64>(n)?;
    for c in 0..n {
        for (r, &val) in zip(A_lower.row_indices_of_col(c), A_lower.values_of_col(c)) {
            let v = val.abs();
            maxabs[r] = maxabs[r].max(v);
            maxabs[c] = maxabs[c].max(v);
        }
    }
    let mut scale = maxabs;
    for s in &mut scale {
        *s = if *s > 0.0 { 1.0 / s.sqrt() } else { 1.0 };
    }
    Ok(scale)
}

/// Runs the given sibling subtrees, forking above the work threshold; each
/// sequential leaf of the fork tree owns an independent arena.
fn factor_kids_worker<I: Index>(
    ctx: &FactorCtx<'_, I>,
    kids: &[I],
    slots: &mut [Option<ContribSlot<'_, I>>],
    parallelism: Parallelism,
) -> Result<Stats, Stop> {
    let total_work: f64 = kids.iter().map(|&s| ctx.symbolic.subtree_work(s.zx())).sum();

    if kids.len() >= 2
        && parallelism_degree(parallelism) > 1
        && total_work >= SUBTREE_FORK_THRESHOLD
    {
        // balanced binary split by estimated flops
        let mut acc = 0.0f64;
        let mut split = 1usize;
        for (i, &s) in kids.iter().enumerate() {
            acc += ctx.symbolic.subtree_work(s.zx());
            if acc * 2.0 >= total_work {
                split = Ord::clamp(i + 1, 1, kids.len() - 1);
                break;
            }
        }
        let (kids_a, kids_b) = kids.split_at(split);
        let (slots_a, slots_b) = slots.split_at_mut(split);

        let mut res_a = Ok(Stats::default());
        let mut res_b = Ok(Stats::default());
        join_raw(
            |par| res_a = factor_kids_worker(ctx, kids_a, slots_a, par),
            |par| res_b = factor_kids_worker(ctx, kids_b, slots_b, par),
            parallelism,
        );
        let a = res_a?;
        let b = res_b?;
        Ok(a.merge(b))
    } else {
        let req = ctx
            .symbolic
            .worker_req(kids)
            .map_err(|_| ctx.fail(FrontalError::OutOfMemory))?;
        let mut arena = WorkerArena::try_with(req).map_err(|e| ctx.fail(e))?;
        let mut stack = arena.stack();
        let (g2l, stack) = stack.make_raw::<I>(ctx.symbolic.nrows());
        crate::mem::fill_none(g2l);
        factor_kids_seq(ctx, kids, slots, parallelism, stack, g2l)
    }
}

fn factor_kids_seq<I: Index>(
    ctx: &FactorCtx<'_, I>,
    kids: &[I],
    slots: &mut [Option<ContribSlot<'_, I>>],
    parallelism: Parallelism,
    mut stack: PodStack<'_>,
    g2l: &mut [I],
) -> Result<Stats, Stop> {
    let mut stats = Stats::default();
    for (&s, slot) in kids.iter().zip(slots.iter_mut()) {
        stats = stats.merge(factor_subtree(
            ctx,
            s.zx(),
            slot.as_mut(),
            stack.rb_mut(),
            g2l,
            parallelism,
        )?);
    }
    Ok(stats)
}

fn factor_subtree<I: Index>(
    ctx: &FactorCtx<'_, I>,
    s: usize,
    out: Option<&mut ContribSlot<'_, I>>,
    stack: PodStack<'_>,
    g2l: &mut [I],
    parallelism: Parallelism,
) -> Result<Stats, Stop> {
    if ctx.abort.load(AtomicOrdering::Relaxed) {
        return Err(Stop);
    }
    let symbolic = ctx.symbolic;
    let mut stack = stack;

    // carve every child's contribution slot up front, then recurse
    let kids = symbolic
        .children(s)
        .map(I::truncate)
        .collect::<Vec<_>>();
    let mut slots = Vec::with_capacity(kids.len());
    for &c in &kids {
        let rmax = symbolic.rows_max(c.zx());
        let (vals, rows, rest) = arena::carve_contrib_slot::<I>(rmax, stack);
        slots.push(Some(ContribSlot {
            vals,
            rows,
            ndelay: 0,
            nrows: 0,
        }));
        stack = rest;
    }

    let kids_work: f64 = kids.iter().map(|&c| symbolic.subtree_work(c.zx())).sum();
    let mut stats = if kids.is_empty() {
        Stats::default()
    } else if kids.len() >= 2
        && parallelism_degree(parallelism) > 1
        && kids_work >= SUBTREE_FORK_THRESHOLD
    {
        factor_kids_worker(ctx, &kids, &mut slots, parallelism)?
    } else {
        factor_kids_seq(ctx, &kids, &mut slots, parallelism, stack.rb_mut(), g2l)?
    };

    if ctx.abort.load(AtomicOrdering::Relaxed) {
        return Err(Stop);
    }

    // realized front dimensions, inflated by the children's delayed pivots
    let cols = symbolic.supernode_cols(s);
    let own = cols.len();
    let pattern = symbolic.front_pattern(s);
    let ndelay_in: usize = slots.iter().map(|c| c.as_ref().unwrap().ndelay).sum();
    let p = ndelay_in + own;
    let m = p + pattern.len();
    debug_assert!(m <= symbolic.rows_max(s));

    let (mut front, rows, mut stack) = arena::acquire_front::<I>(m, stack);

    // delayed columns first, then the supernode's columns, then the pattern
    let mut pos = 0usize;
    for slot in &slots {
        let slot = slot.as_ref().unwrap();
        for &g in &slot.rows[..slot.ndelay] {
            rows[pos] = g;
            pos += 1;
        }
    }
    for j in cols.clone() {
        rows[pos] = I::truncate(j);
        pos += 1;
    }
    for &g in pattern {
        rows[pos] = g;
        pos += 1;
    }
    debug_assert!(pos == m);

    for (loc, &g) in rows.iter().enumerate() {
        g2l[g.zx()] = I::truncate(loc);
    }

    // original entries of the supernode's columns
    {
        let A_lower = SparseColMatRef::new(symbolic.canon_pattern(), ctx.aval);
        for j in cols.clone() {
            let jl = g2l[j].zx();
            for (i, &val) in zip(A_lower.row_indices_of_col(j), A_lower.values_of_col(j)) {
                let il = g2l[i].zx();
                debug_assert!(il >= jl);
                front.write(il, jl, val);
            }
        }
    }

    // children's trailing blocks, additive scatter
    for slot in &slots {
        let slot = slot.as_ref().unwrap();
        let t = slot.nrows;
        let block = faer_core::mat::from_column_major_slice::<f64>(&slot.vals[..t * t], t, t);
        for jj in 0..t {
            let lj = g2l[slot.rows[jj].zx()].zx();
            debug_assert!(lj < m);
            for ii in jj..t {
                let li = g2l[slot.rows[ii].zx()].zx();
                debug_assert!(li < m);
                let (hi, lo) = if li >= lj { (li, lj) } else { (lj, li) };
                unsafe {
                    front.write_unchecked(
                        hi,
                        lo,
                        front.read_unchecked(hi, lo) + block.read_unchecked(ii, jj),
                    )
                };
            }
        }
    }

    // factor the candidate panel
    let (d, mut stack) = stack.make_raw::<f64>(2 * p);
    let is_root = out.is_none();
    let info = if ctx.posdef {
        pivot::factor_front_posdef(front.rb_mut(), p, d, ctx.small)
    } else {
        pivot::factor_front_indefinite(
            front.rb_mut(),
            rows,
            p,
            d,
            &PivotParams {
                u: ctx.u,
                small: ctx.small,
                action: ctx.action,
                is_root,
            },
        )
    }
    .map_err(|e| ctx.fail(e))?;
    let q = info.nelim;

    // Schur complement of the contribution rows
    let tcon = m - p;
    if tcon > 0 && q > 0 {
        let (left, right) = front.rb_mut().split_at_col_mut(p);
        let l21 = left.rb().subrows(p, tcon).subcols(0, q);
        let contrib = right.subrows_mut(p, tcon);

        let (mut w, _) = temp_mat_uninit::<f64>(tcon, q, stack.rb_mut());
        let mut k = 0usize;
        while k < q {
            if d[2 * k + 1] != 0.0 {
                let (d11, d21, d22) = (d[2 * k], d[2 * k + 1], d[2 * k + 2]);
                for i in 0..tcon {
                    let l1 = l21.read(i, k);
                    let l2 = l21.read(i, k + 1);
                    w.write(i, k, l1 * d11 + l2 * d21);
                    w.write(i, k + 1, l1 * d21 + l2 * d22);
                }
                k += 2;
            } else {
                let d11 = d[2 * k];
                for i in 0..tcon {
                    w.write(i, k, l21.read(i, k) * d11);
                }
                k += 1;
            }
        }

        triangular::matmul(
            contrib,
            BlockStructure::TriangularLower,
            l21,
            BlockStructure::Rectangular,
            w.rb().transpose(),
            BlockStructure::Rectangular,
            Some(1.0),
            -1.0,
            parallelism,
        );
    }

    // retain the factor panel and the inverted diagonal
    {
        let mut ff = FrontFactor::<I> {
            nelim: q,
            rows: try_collect(rows.iter().copied()).map_err(|e| ctx.fail(e))?,
            l: try_zeroed(m * q).map_err(|e| ctx.fail(e))?,
            d: try_zeroed(2 * q).map_err(|e| ctx.fail(e))?,
        };
        for k in 0..q {
            for i in 0..m {
                ff.l[k * m + i] = front.read(i, k);
            }
        }
        let mut k = 0usize;
        while k < q {
            if d[2 * k + 1] != 0.0 {
                let (d11, d21, d22) = (d[2 * k], d[2 * k + 1], d[2 * k + 2]);
                let det = d11 * d22 - d21 * d21;
                ff.d[2 * k] = d22 / det;
                ff.d[2 * k + 1] = -d21 / det;
                ff.d[2 * k + 2] = d11 / det;
                ff.d[2 * k + 3] = 0.0;
                k += 2;
            } else {
                let d11 = d[2 * k];
                ff.d[2 * k] = if d11 != 0.0 { 1.0 / d11 } else { 0.0 };
                ff.d[2 * k + 1] = 0.0;
                k += 1;
            }
        }
        // Safety: each supernode is written by exactly one task
        unsafe { *ctx.fronts.0.add(s) = ff };
    }

    // trailing block (delayed columns first) to the parent
    if let Some(out) = out {
        let t = m - q;
        out.ndelay = p - q;
        out.nrows = t;
        out.rows[..t].copy_from_slice(&rows[q..]);
        for jj in 0..t {
            for ii in jj..t {
                out.vals[jj * t + ii] = front.read(q + ii, q + jj);
            }
        }
    }

    for &g in rows.iter() {
        g2l[g.zx()] = I::truncate(NONE);
    }

    stats.num_delay += info.ndelay;
    stats.num_neg += info.num_neg;
    stats.num_two += info.num_two;
    stats.num_zero += info.num_zero;
    stats.num_factor += (m * q) as u64;
    stats.num_flops += flop_count(m, q);
    stats.maxfront = Ord::max(stats.maxfront, m);
    Ok(stats)
}

fn stage_fronts<I: Index>(fronts: &[FrontFactor<I>]) -> Result<Vec<SolveStage>, FrontalError> {
    let mut stage = Vec::new();
    stage.try_reserve_exact(fronts.len()).map_err(nomem)?;
    for ff in fronts {
        let m = ff.rows.len();
        let q = ff.nelim;
        let mut head = try_zeroed::<f64>(q * q)?;
        let mut tail = try_zeroed::<f64>((m - q) * q)?;
        for k in 0..q {
            for i in 0..q {
                head[k * q + i] = ff.l[k * m + i];
            }
            for i in q..m {
                tail[k * (m - q) + (i - q)] = ff.l[k * m + i];
            }
        }
        stage.push(SolveStage { head, tail });
    }
    Ok(stage)
}
