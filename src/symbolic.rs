//! Symbolic analysis: pattern validation, elimination tree, supernode
//! amalgamation, and per-front workspace sizing.
//!
//! The output of [`analyse`] is an immutable [`Symbolic`] structure shared by
//! every numeric factorization of matrices with the same pattern.

use crate::arena;
use crate::mem::{self, NONE};
use crate::{
    flag, nomem, try_collect, try_zeroed, windows2, FrontalError, Index, Inform, Options, Ordering,
    PermutationRef, SymbolicSparseColMatRef, __try_any_of,
};
use assert2::{assert, debug_assert};
use core::ops::Range;
use dyn_stack::{GlobalPodBuffer, PodStack, SizeOverflow, StackReq};
use reborrow::*;

/// Immutable symbolic factorization (the "akeep").
///
/// Holds the canonicalized pattern, the assembly tree, and worst-case
/// workspace sizing for the numeric phase. Never mutated by factorization.
#[derive(Debug)]
pub struct Symbolic<I> {
    n: usize,
    nnz_in: usize,

    perm_fwd: Vec<I>,
    perm_inv: Vec<I>,

    // canonical lower-triangle pattern of the permuted matrix, columns
    // sorted, diagonal entries always structurally present
    col_ptr: Vec<I>,
    row_ind: Vec<I>,
    // original entry slot -> canonical slot, NONE for dropped entries
    entry_to_canon: Vec<I>,

    supernode_begin: Vec<I>,
    parent: Vec<I>,
    child_head: Vec<I>,
    child_next: Vec<I>,
    roots: Vec<I>,
    post: Vec<I>,

    front_ptr: Vec<I>,
    front_row: Vec<I>,

    // front dimensions over-provisioned for worst-case pivot delays
    cols_max: Vec<I>,
    rows_max: Vec<I>,
    subtree_req: Vec<StackReq>,
    subtree_work: Vec<f64>,

    inform: Inform,
}

impl<I: Index> Symbolic<I> {
    #[inline]
    pub fn nrows(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn n_supernodes(&self) -> usize {
        self.parent.len()
    }

    /// Diagnostics of the analyse phase, including the input anomaly counts.
    #[inline]
    pub fn inform(&self) -> &Inform {
        &self.inform
    }

    /// Fill-reducing permutation, `fwd[new] = old`.
    #[inline]
    pub fn perm(&self) -> PermutationRef<'_, I> {
        unsafe { PermutationRef::new_unchecked(&self.perm_fwd, &self.perm_inv) }
    }

    /// Column pointers of the canonicalized (permuted, lower-triangle)
    /// pattern.
    #[inline]
    pub fn col_ptrs(&self) -> &[I] {
        &self.col_ptr
    }

    /// Row indices of the canonicalized pattern.
    #[inline]
    pub fn row_indices(&self) -> &[I] {
        &self.row_ind
    }

    /// View of the canonicalized pattern.
    #[inline]
    pub fn canon_pattern(&self) -> SymbolicSparseColMatRef<'_, I> {
        unsafe { SymbolicSparseColMatRef::new_unchecked(self.n, self.n, &self.col_ptr, &self.row_ind) }
    }

    /// Number of entries expected in the `values` argument of
    /// [`Symbolic::factor`].
    #[inline]
    pub fn expected_values_len(&self) -> usize {
        self.nnz_in
    }

    /// Computes a multifrontal factorization of a matrix with this pattern.
    ///
    /// `posdef` selects the Cholesky-style unpivoted path; otherwise pivoted
    /// LDLᵀ with delayed pivots is used. `values` holds one value per input
    /// pattern entry, in the original entry order; duplicates accumulate.
    #[inline]
    pub fn factor<'a>(
        &'a self,
        posdef: bool,
        values: &[f64],
        options: &Options,
    ) -> Result<crate::factor::Numeric<'a, I>, FrontalError> {
        crate::factor::factorize(self, posdef, values, None, options)
    }

    /// Like [`Symbolic::factor`], with caller-supplied scale factors
    /// (`scale[i]` applies to variable `i` of the original order),
    /// overriding [`Options::scaling`].
    #[inline]
    pub fn factor_scaled<'a>(
        &'a self,
        posdef: bool,
        values: &[f64],
        scale: &[f64],
        options: &Options,
    ) -> Result<crate::factor::Numeric<'a, I>, FrontalError> {
        crate::factor::factorize(self, posdef, values, Some(scale), options)
    }

    #[inline]
    pub(crate) fn supernode_cols(&self, s: usize) -> Range<usize> {
        self.supernode_begin[s].zx()..self.supernode_begin[s + 1].zx()
    }

    #[inline]
    pub(crate) fn front_pattern(&self, s: usize) -> &[I] {
        &self.front_row[self.front_ptr[s].zx()..self.front_ptr[s + 1].zx()]
    }

    #[inline]
    pub(crate) fn rows_max(&self, s: usize) -> usize {
        self.rows_max[s].zx()
    }

    #[inline]
    pub(crate) fn subtree_req(&self, s: usize) -> StackReq {
        self.subtree_req[s]
    }

    #[inline]
    pub(crate) fn subtree_work(&self, s: usize) -> f64 {
        self.subtree_work[s]
    }

    #[inline]
    pub(crate) fn roots(&self) -> &[I] {
        &self.roots
    }

    #[inline]
    pub(crate) fn postorder(&self) -> &[I] {
        &self.post
    }

    #[inline]
    pub(crate) fn entry_to_canon(&self) -> &[I] {
        &self.entry_to_canon
    }

    #[inline]
    pub(crate) fn canon_len(&self) -> usize {
        self.row_ind.len()
    }

    #[inline]
    pub(crate) fn perm_arrays(&self) -> (&[I], &[I]) {
        (&self.perm_fwd, &self.perm_inv)
    }

    #[inline]
    pub(crate) fn children(&self, s: usize) -> ChildIter<'_, I> {
        ChildIter {
            head: self.child_head[s],
            next: &self.child_next,
        }
    }

    /// Arena requirement for one worker processing the given subtrees
    /// sequentially.
    pub(crate) fn worker_req(&self, kids: &[I]) -> Result<StackReq, SizeOverflow> {
        let g2l = StackReq::try_new::<I>(self.n)?;
        g2l.try_and(__try_any_of(
            kids.iter().map(|&s| self.subtree_req[s.zx()]),
        )?)
    }
}

pub(crate) struct ChildIter<'a, I> {
    head: I,
    next: &'a [I],
}

impl<I: Index> Iterator for ChildIter<'_, I> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        let none = I::truncate(NONE);
        if self.head == none {
            None
        } else {
            let s = self.head.zx();
            self.head = self.next[s];
            Some(s)
        }
    }
}

enum EntrySource<'a, I> {
    Csc { col_ptr: &'a [I], row_ind: &'a [I] },
    Coord { rows: &'a [I], cols: &'a [I] },
}

/// Performs the analysis phase for a compressed sparse column pattern.
///
/// The input describes the lower triangle of a symmetric matrix of order
/// `n`; `col_ptrs` and `row_indices` use the index base selected by
/// [`Options::array_base`]. Entries in the strict upper triangle and
/// indices outside `[0, n)` are dropped and counted in
/// [`Inform::matrix_outrange`]; duplicates and missing diagonal entries are
/// likewise repaired and counted rather than rejected.
///
/// `order[old]` gives the position of variable `old` in the elimination
/// order; `None` selects the natural order.
pub fn analyse<I: Index>(
    n: usize,
    col_ptrs: &[I],
    row_indices: &[I],
    order: Option<&[I]>,
    options: &Options,
) -> Result<Symbolic<I>, FrontalError> {
    let base = options.array_base;
    assert!(base <= 1);

    if n == 0 || n >= I::MAX.zx() {
        return Err(FrontalError::InvalidDimension);
    }
    if col_ptrs.len() != n + 1 || col_ptrs[0].sx() != base {
        return Err(FrontalError::InvalidPattern);
    }
    for &[c, c_next] in windows2(col_ptrs) {
        if c > c_next {
            return Err(FrontalError::InvalidPattern);
        }
    }
    let nnz = col_ptrs[n].zx() - base;
    if row_indices.len() != nnz {
        return Err(FrontalError::InvalidPattern);
    }

    analyse_impl(
        n,
        EntrySource::Csc {
            col_ptr: col_ptrs,
            row_ind: row_indices,
        },
        order,
        options,
    )
}

/// Performs the analysis phase for coordinate input.
///
/// Entries may address either triangle; an entry and its mirror are folded
/// onto the same lower-triangle position (the second occurrence counts as a
/// duplicate and its value accumulates).
pub fn analyse_coord<I: Index>(
    n: usize,
    rows: &[I],
    cols: &[I],
    order: Option<&[I]>,
    options: &Options,
) -> Result<Symbolic<I>, FrontalError> {
    assert!(options.array_base <= 1);

    if n == 0 || n >= I::MAX.zx() {
        return Err(FrontalError::InvalidDimension);
    }
    if rows.len() != cols.len() {
        return Err(FrontalError::InvalidPattern);
    }

    analyse_impl(n, EntrySource::Coord { rows, cols }, order, options)
}

fn analyse_impl<I: Index>(
    n: usize,
    entries: EntrySource<'_, I>,
    order: Option<&[I]>,
    options: &Options,
) -> Result<Symbolic<I>, FrontalError> {
    let base = options.array_base;
    let none = I::truncate(NONE);
    let zero = I::truncate(0);
    let one = I::truncate(1);

    let nnz_in = match entries {
        EntrySource::Csc { row_ind, .. } => row_ind.len(),
        EntrySource::Coord { rows, .. } => rows.len(),
    };
    if nnz_in >= I::MAX.zx() {
        return Err(FrontalError::IndexOverflow);
    }

    let mut inform = Inform {
        matrix_rank: n,
        ..Inform::default()
    };

    // elimination order: perm_inv[old] = new, perm_fwd[new] = old
    let mut perm_fwd = try_zeroed::<I>(n)?;
    let mut perm_inv = try_zeroed::<I>(n)?;
    match (options.ordering, order) {
        (Ordering::Natural, _) | (Ordering::Auto, None) => {
            for i in 0..n {
                perm_fwd[i] = I::truncate(i);
                perm_inv[i] = I::truncate(i);
            }
        }
        (Ordering::Given, None) => return Err(FrontalError::InvalidOrder),
        (Ordering::Auto | Ordering::Given, Some(order)) => {
            if order.len() != n {
                return Err(FrontalError::InvalidOrder);
            }
            mem::fill_none(&mut perm_fwd);
            for (old, &pos) in order.iter().enumerate() {
                let pos = pos.sx().wrapping_sub(base);
                if pos >= n || perm_fwd[pos] != none {
                    return Err(FrontalError::InvalidOrder);
                }
                perm_fwd[pos] = I::truncate(old);
                perm_inv[old] = I::truncate(pos);
            }
        }
    }

    let req = || -> Result<StackReq, SizeOverflow> {
        let n_req = StackReq::try_new::<I>(n)?;
        let np1_req = StackReq::try_new::<I>(n + 1)?;
        let nnz_req = StackReq::try_new::<I>(nnz_in)?;

        // canonicalization: two stable counting passes over (row, col,
        // entry) triples
        let canon = StackReq::try_all_of([
            np1_req, nnz_req, nnz_req, nnz_req, nnz_req, nnz_req, nnz_req,
        ])?;

        // strict upper transpose, alive until the front patterns are built
        let upper = StackReq::try_all_of([np1_req, nnz_req.try_and(n_req)?])?;
        // etree, supernodes, amalgamation, ereach, postorder reuse n-sized
        // slots; provision the widest concurrent set
        let tree = StackReq::try_all_of([n_req; 8])?;

        canon.try_or(upper.try_and(tree)?)
    };
    let mut mem_buf = GlobalPodBuffer::try_new(req().map_err(nomem)?).map_err(nomem)?;
    let mut stack = PodStack::new(&mut mem_buf);

    // canonical pattern outputs
    let mut col_ptr = try_zeroed::<I>(n + 1)?;
    let mut row_ind = try_zeroed::<I>(nnz_in + n)?;
    let mut entry_to_canon = try_zeroed::<I>(nnz_in)?;
    mem::fill_none(&mut entry_to_canon);

    let canon_nnz;
    {
        let stack = stack.rb_mut();
        let (count, stack) = stack.make_raw::<I>(n + 1);
        let (rv, stack) = stack.make_raw::<I>(nnz_in);
        let (cv, stack) = stack.make_raw::<I>(nnz_in);
        let (ev, stack) = stack.make_raw::<I>(nnz_in);
        let (rv2, stack) = stack.make_raw::<I>(nnz_in);
        let (cv2, stack) = stack.make_raw::<I>(nnz_in);
        let (ev2, _) = stack.make_raw::<I>(nnz_in);

        // pass 0: base/range filtering, mapping to the permuted lower
        // triangle
        let mut nv = 0usize;
        let mirror = matches!(entries, EntrySource::Coord { .. });
        let mut outrange = 0usize;
        {
            let mut visit = |i_raw: I, j_raw: I, e: usize| {
                let i = i_raw.sx().wrapping_sub(base);
                let j = j_raw.sx().wrapping_sub(base);
                if i >= n || j >= n || (!mirror && i < j) {
                    outrange += 1;
                    return;
                }
                let pi = perm_inv[i].zx();
                let pj = perm_inv[j].zx();
                let (r, c) = if pi >= pj { (pi, pj) } else { (pj, pi) };
                rv[nv] = I::truncate(r);
                cv[nv] = I::truncate(c);
                ev[nv] = I::truncate(e);
                nv += 1;
            };
            match entries {
                EntrySource::Csc { col_ptr, row_ind } => {
                    for j in 0..n {
                        for e in col_ptr[j].zx() - base..col_ptr[j + 1].zx() - base {
                            visit(row_ind[e], I::truncate(j + base), e);
                        }
                    }
                }
                EntrySource::Coord { rows, cols } => {
                    for e in 0..nnz_in {
                        visit(rows[e], cols[e], e);
                    }
                }
            }
        }
        inform.matrix_outrange = outrange;

        // stable counting sort by row, then by column
        mem::fill_zero(count);
        for k in 0..nv {
            count[rv[k].zx()].incr();
        }
        let mut acc = zero;
        for r in 0..n {
            let c = count[r];
            count[r] = acc;
            acc += c;
        }
        for k in 0..nv {
            let pos = count[rv[k].zx()].zx();
            count[rv[k].zx()].incr();
            rv2[pos] = rv[k];
            cv2[pos] = cv[k];
            ev2[pos] = ev[k];
        }

        mem::fill_zero(count);
        for k in 0..nv {
            count[cv2[k].zx()].incr();
        }
        let mut acc = zero;
        for c in 0..n {
            let cnt = count[c];
            count[c] = acc;
            acc += cnt;
        }
        for k in 0..nv {
            let pos = count[cv2[k].zx()].zx();
            count[cv2[k].zx()].incr();
            rv[pos] = rv2[k];
            cv[pos] = cv2[k];
            ev[pos] = ev2[k];
        }

        // dedup walk, inserting structurally absent diagonal entries
        let mut out = 0usize;
        let mut k = 0usize;
        for c in 0..n {
            col_ptr[c] = I::truncate(out);
            let c_ = I::truncate(c);
            if k >= nv || cv[k] != c_ || rv[k] != c_ {
                inform.matrix_missing_diag += 1;
                row_ind[out] = c_;
                out += 1;
            }
            while k < nv && cv[k] == c_ {
                let r = rv[k];
                if out > col_ptr[c].zx() && row_ind[out - 1] == r {
                    inform.matrix_dup += 1;
                } else {
                    row_ind[out] = r;
                    out += 1;
                }
                entry_to_canon[ev[k].zx()] = I::truncate(out - 1);
                k += 1;
            }
        }
        col_ptr[n] = I::truncate(out);
        canon_nnz = out;
    }
    row_ind.truncate(canon_nnz);
    let col_ptr = col_ptr;
    let row_ind = row_ind;

    // strict upper transpose: column k lists the neighbors j < k, the view
    // consumed by the elimination tree and row pattern passes
    let (up_col_ptr, stack) = stack.make_raw::<I>(n + 1);
    let (up_row_buf, mut stack) = stack.make_raw::<I>(canon_nnz);
    let up_nnz;
    {
        mem::fill_zero(up_col_ptr);
        for c in 0..n {
            for &r in &row_ind[col_ptr[c].zx()..col_ptr[c + 1].zx()] {
                if r.zx() > c {
                    up_col_ptr[r.zx()].incr();
                }
            }
        }
        let mut acc = zero;
        for k in 0..n {
            let cnt = up_col_ptr[k];
            up_col_ptr[k] = acc;
            acc += cnt;
        }
        up_col_ptr[n] = acc;
        up_nnz = acc.zx();

        let (pos, _) = stack.rb_mut().make_raw::<I>(n);
        pos.copy_from_slice(&up_col_ptr[..n]);
        for c in 0..n {
            for &r in &row_ind[col_ptr[c].zx()..col_ptr[c + 1].zx()] {
                let r = r.zx();
                if r > c {
                    up_row_buf[pos[r].zx()] = I::truncate(c);
                    pos[r].incr();
                }
            }
        }
    }
    let up_row_ind = &up_row_buf[..up_nnz];
    let up_col_ptr = &up_col_ptr[..];

    // elimination tree and factor column counts
    let mut etree = try_zeroed::<I>(n)?;
    let mut col_counts = try_zeroed::<I>(n)?;
    {
        let (visited, _) = stack.rb_mut().make_raw::<I>(n);
        mem::fill_none(&mut etree);
        for j in 0..n {
            let j_ = I::truncate(j);
            visited[j] = j_;
            col_counts[j] = one;

            for &i_ in &up_row_ind[up_col_ptr[j].zx()..up_col_ptr[j + 1].zx()] {
                let mut i = i_.zx();
                loop {
                    if visited[i] == j_ {
                        break;
                    }

                    let next_i = if etree[i] == none {
                        etree[i] = j_;
                        j
                    } else {
                        etree[i].zx()
                    };

                    col_counts[i].incr();
                    visited[i] = j_;
                    i = next_i;
                }
            }
        }
    }
    // the factor entry count must stay representable
    let _ = I::sum_nonnegative(&col_counts).ok_or(FrontalError::IndexOverflow)?;

    // fundamental supernodes: a column joins its predecessor when it is the
    // parent of only that column and their patterns nest
    let (child_count, stack) = stack.make_raw::<I>(n);
    let (index_to_super, stack) = stack.make_raw::<I>(n);
    let (supernode_sizes, mut stack) = stack.make_raw::<I>(n);

    mem::fill_zero(child_count);
    for j in 0..n {
        if etree[j] != none {
            child_count[etree[j].zx()].incr();
        }
    }

    mem::fill_zero(supernode_sizes);
    let mut current_supernode = 0usize;
    supernode_sizes[0] = one;
    for j in 1..n {
        let j_prev = j - 1;
        let is_parent_of_prev = etree[j_prev].sx() == j;
        let is_parent_of_only_prev = child_count[j] == one;
        let same_pattern_as_prev = col_counts[j_prev] == col_counts[j] + one;

        if !(is_parent_of_prev && is_parent_of_only_prev && same_pattern_as_prev) {
            current_supernode += 1;
        }
        supernode_sizes[current_supernode].incr();
    }
    let n_fundamental = current_supernode + 1;

    let n_supernodes;
    {
        let stack = stack.rb_mut();
        let (super_etree, stack) = stack.make_raw::<I>(n_fundamental);
        let (degrees, stack) = stack.make_raw::<I>(n_fundamental);
        let (merged_into, stack) = stack.make_raw::<I>(n_fundamental);
        let (first_fund, _) = stack.make_raw::<I>(n_fundamental);

        let sizes = &mut supernode_sizes[..n_fundamental];

        let mut begin = 0usize;
        for (s, &size) in sizes.iter().enumerate() {
            index_to_super[begin..begin + size.zx()].fill(I::truncate(s));
            begin += size.zx();
        }
        let mut begin = 0usize;
        for (s, &size) in sizes.iter().enumerate() {
            let last = begin + size.zx() - 1;
            super_etree[s] = if etree[last] != none {
                index_to_super[etree[last].zx()]
            } else {
                none
            };
            degrees[s] = col_counts[last] - one;
            first_fund[s] = I::truncate(s);
            begin += size.zx();
        }
        mem::fill_none(merged_into);

        // relaxed amalgamation: merge a supernode into its parent when the
        // parent's columns start right after its own, provided the merge
        // adds no explicit zeros or either node is smaller than nemin
        let resolve = |merged_into: &[I], mut s: usize| -> usize {
            while merged_into[s] != none {
                s = merged_into[s].zx();
            }
            s
        };
        let nemin = I::truncate(options.nemin);
        for s in 0..n_fundamental.saturating_sub(1) {
            if super_etree[s] == none {
                continue;
            }
            let p = resolve(merged_into, super_etree[s].zx());
            if first_fund[p].zx() != s + 1 {
                continue;
            }
            let size_s = sizes[s];
            let size_p = sizes[p];
            let new_zeros = (size_p.zx() + degrees[p].zx() - degrees[s].zx()) * size_s.zx();
            if new_zeros == 0 || (size_s < nemin && size_p < nemin) {
                sizes[p] = size_p + size_s;
                sizes[s] = zero;
                first_fund[p] = first_fund[s];
                merged_into[s] = I::truncate(p);
            }
        }

        // compact the surviving supernodes
        let mut pos = 0usize;
        for s in 0..n_fundamental {
            if sizes[s] > zero {
                sizes[pos] = sizes[s];
                pos += 1;
            }
        }
        n_supernodes = pos;

        let mut begin = 0usize;
        for (s, &size) in sizes[..n_supernodes].iter().enumerate() {
            index_to_super[begin..begin + size.zx()].fill(I::truncate(s));
            begin += size.zx();
        }
    }

    let mut supernode_begin = try_zeroed::<I>(n_supernodes + 1)?;
    {
        let mut begin = zero;
        for (s, &size) in supernode_sizes[..n_supernodes].iter().enumerate() {
            supernode_begin[s] = begin;
            begin += size;
        }
        supernode_begin[n_supernodes] = begin;
        debug_assert!(begin.zx() == n);
    }

    let mut parent = try_zeroed::<I>(n_supernodes)?;
    for s in 0..n_supernodes {
        let last = supernode_begin[s + 1].zx() - 1;
        parent[s] = if etree[last] != none {
            index_to_super[etree[last].zx()]
        } else {
            none
        };
    }

    // per-front row patterns below the supernode columns
    let mut front_ptr = try_zeroed::<I>(n_supernodes + 1)?;
    {
        let mut acc = zero;
        for s in 0..n_supernodes {
            let last = supernode_begin[s + 1].zx() - 1;
            let degree = col_counts[last] - one;
            front_ptr[s] = acc;
            acc += degree;
            front_ptr[s + 1] = acc;
        }
    }
    let front_nnz = front_ptr[n_supernodes].zx();
    let mut front_row = try_zeroed::<I>(front_nnz)?;
    {
        let stack = stack.rb_mut();
        let (current_row_positions, stack) = stack.make_raw::<I>(n_supernodes);
        let (visited, _) = stack.make_raw::<I>(n_supernodes);
        current_row_positions.copy_from_slice(&front_ptr[..n_supernodes]);
        mem::fill_none(visited);

        for k in 0..n {
            let k_ = I::truncate(k);
            visited[index_to_super[k].zx()] = k_;
            for &i_ in &up_row_ind[up_col_ptr[k].zx()..up_col_ptr[k + 1].zx()] {
                let mut si = index_to_super[i_.zx()].zx();
                loop {
                    if visited[si] == k_ {
                        break;
                    }
                    front_row[current_row_positions[si].zx()] = k_;
                    current_row_positions[si].incr();
                    visited[si] = k_;
                    si = parent[si].zx();
                }
            }
        }

        debug_assert!(*current_row_positions == front_ptr[1..]);
    }

    // child lists (ascending) and roots
    let mut child_head = try_zeroed::<I>(n_supernodes)?;
    let mut child_next = try_zeroed::<I>(n_supernodes)?;
    mem::fill_none(&mut child_head);
    mem::fill_none(&mut child_next);
    let mut roots = Vec::new();
    for s in (0..n_supernodes).rev() {
        let p = parent[s];
        if p != none {
            child_next[s] = child_head[p.zx()];
            child_head[p.zx()] = I::truncate(s);
        } else {
            roots.push(I::truncate(s));
        }
    }
    roots.reverse();

    // postorder over the supernodal tree
    let mut post = try_zeroed::<I>(n_supernodes)?;
    {
        let stack = stack.rb_mut();
        let (dfs, stack) = stack.make_raw::<I>(n_supernodes);
        let (first_child, _) = stack.make_raw::<I>(n_supernodes);
        first_child.copy_from_slice(&child_head);

        let mut start_index = 0usize;
        for &root in &*roots {
            let mut top = 1usize;
            dfs[0] = root;
            while top != 0 {
                let current_node = dfs[top - 1].zx();
                let current_child = first_child[current_node];

                if current_child != none {
                    dfs[top] = current_child;
                    top += 1;
                    first_child[current_node] = child_next[current_child.zx()];
                } else {
                    post[start_index] = I::truncate(current_node);
                    start_index += 1;
                    top -= 1;
                }
            }
        }
        debug_assert!(start_index == n_supernodes);
    }

    // tree depth: parents precede children in reverse postorder
    let mut maxdepth = 0usize;
    {
        let (depth, _) = stack.rb_mut().make_raw::<I>(n_supernodes);
        for &s in post.iter().rev() {
            let s = s.zx();
            let d = if parent[s] == none {
                one
            } else {
                depth[parent[s].zx()] + one
            };
            depth[s] = d;
            maxdepth = Ord::max(maxdepth, d.zx());
        }
    }

    let children = |s: usize| ChildIter {
        head: child_head[s],
        next: &child_next,
    };

    // worst-case front dimensions under pivot delay: every candidate of
    // every descendant may be pushed into its parent
    let mut cols_max = try_zeroed::<I>(n_supernodes)?;
    let mut rows_max = try_zeroed::<I>(n_supernodes)?;
    for &s in &*post {
        let s = s.zx();
        let size = supernode_begin[s + 1] - supernode_begin[s];
        let degree = front_ptr[s + 1] - front_ptr[s];
        let mut cmax = size;
        for c in children(s) {
            cmax += cols_max[c];
        }
        if cmax.zx() + degree.zx() > n {
            // delays never push a front past the matrix order
            cmax = I::truncate(n - degree.zx());
        }
        cols_max[s] = cmax;
        rows_max[s] = cmax + degree;
    }

    // per-subtree arena peaks and work estimates
    let mut subtree_req = try_collect((0..n_supernodes).map(|_| StackReq::empty()))?;
    let mut subtree_work = try_zeroed::<f64>(n_supernodes)?;
    let mut num_factor = 0u64;
    let mut num_flops = 0u64;
    let mut maxfront = 0usize;
    for &s in &*post {
        let s = s.zx();
        let size = (supernode_begin[s + 1] - supernode_begin[s]).zx();
        let degree = (front_ptr[s + 1] - front_ptr[s]).zx();
        let m = size + degree;
        maxfront = Ord::max(maxfront, m);
        num_factor += (m * size) as u64;
        let flops = flop_count(m, size);
        num_flops += flops;

        let mut work = flops as f64;
        let mut slots = StackReq::empty();
        let mut children_peak = StackReq::empty();
        for c in children(s) {
            work += subtree_work[c];
            slots = slots
                .try_and(
                    arena::contrib_slot_req::<I>(rows_max[c].zx()).map_err(nomem)?,
                )
                .map_err(nomem)?;
            children_peak = children_peak.try_or(subtree_req[c]).map_err(nomem)?;
        }
        let own = arena::front_work_req::<I>(rows_max[s].zx(), cols_max[s].zx()).map_err(nomem)?;
        subtree_req[s] = slots
            .try_and(own.try_or(children_peak).map_err(nomem)?)
            .map_err(nomem)?;
        subtree_work[s] = work;
    }

    inform.num_sup = n_supernodes;
    inform.maxdepth = maxdepth;
    inform.maxfront = maxfront;
    inform.num_factor = num_factor;
    inform.num_flops = num_flops;
    if inform.matrix_dup != 0 || inform.matrix_outrange != 0 || inform.matrix_missing_diag != 0 {
        inform.flag = flag::WARN_MATRIX_ANOMALY;
    }

    if options.print_level >= 1 {
        log::debug!(
            "analyse: n={n}, nnz={canon_nnz}, supernodes={n_supernodes}, maxdepth={maxdepth}, \
             maxfront={maxfront}, forecast flops={num_flops}",
        );
    }

    Ok(Symbolic {
        n,
        nnz_in,
        perm_fwd,
        perm_inv,
        col_ptr,
        row_ind,
        entry_to_canon,
        supernode_begin,
        parent,
        child_head,
        child_next,
        roots,
        post,
        front_ptr,
        front_row,
        cols_max,
        rows_max,
        subtree_req,
        subtree_work,
        inform,
    })
}

/// `sum_{k=0}^{q-1} (m - k)^2`, the dominant cost of eliminating `q` columns
/// from a front with `m` rows.
pub(crate) fn flop_count(m: usize, q: usize) -> u64 {
    let sq = |x: u128| x * (x + 1) * (2 * x + 1) / 6;
    let m = m as u128;
    let q = (q as u128).min(m);
    let total = sq(m) - sq(m - q);
    total.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::Options;

    macro_rules! monomorphize_test {
        ($name: ident) => {
            monomorphize_test!($name, i32);
            monomorphize_test!($name, i64);
        };

        ($name: ident, $ty: ident) => {
            paste::paste! {
                #[test]
                fn [<$name _ $ty>]() {
                    $name::<$ty>();
                }
            }
        };
    }

    // 11×11 pattern with a known elimination tree; the input lists both
    // triangles, so the strict upper entries are dropped and counted
    fn fixture_11<I: Index>() -> (usize, Vec<I>, Vec<I>) {
        let truncate = I::truncate;
        let n = 11;
        let col_ptr = vec![0usize, 3, 6, 10, 13, 16, 21, 24, 29, 31, 37, 43]
            .into_iter()
            .map(truncate)
            .collect::<Vec<_>>();
        let row_ind = vec![
            0, 5, 6, // 0
            1, 2, 7, // 1
            1, 2, 9, 10, // 2
            3, 5, 9, // 3
            4, 7, 10, // 4
            0, 3, 5, 8, 9, // 5
            0, 6, 10, // 6
            1, 4, 7, 9, 10, // 7
            5, 8, // 8
            2, 3, 5, 7, 9, 10, // 9
            2, 4, 6, 7, 9, 10, // 10
        ]
        .into_iter()
        .map(truncate)
        .collect::<Vec<_>>();
        (n, col_ptr, row_ind)
    }

    fn test_analyse_fixture<I: Index>() {
        let (n, col_ptr, row_ind) = fixture_11::<I>();
        let options = Options {
            nemin: 1,
            ..Options::default()
        };
        let symbolic = analyse(n, &col_ptr, &row_ind, None, &options).unwrap();

        // strict upper entries of the full-pattern input are dropped
        assert!(symbolic.inform().matrix_outrange > 0);
        assert_eq!(symbolic.inform().matrix_dup, 0);
        assert_eq!(symbolic.inform().matrix_missing_diag, 0);
        assert_eq!(symbolic.inform().num_sup, symbolic.n_supernodes());

        // every column belongs to exactly one supernode
        assert_eq!(
            symbolic.supernode_begin[symbolic.n_supernodes()].zx(),
            n
        );

        // front patterns match a dense boolean factorization
        let fill = dense_bool_fill(n, &symbolic.col_ptr, &symbolic.row_ind);
        for s in 0..symbolic.n_supernodes() {
            let cols = symbolic.supernode_cols(s);
            let mut expected = vec![false; n];
            for j in cols.clone() {
                for i in j + 1..n {
                    if fill[i][j] && !cols.contains(&i) {
                        expected[i] = true;
                    }
                }
            }
            let pattern = symbolic.front_pattern(s);
            let got = pattern.iter().map(|&i| i.zx()).collect::<Vec<_>>();
            let want = (0..n).filter(|&i| expected[i]).collect::<Vec<_>>();
            assert_eq!(got, want);
        }

        // postorder visits children before parents
        let mut seen = vec![false; symbolic.n_supernodes()];
        for &s in symbolic.postorder() {
            let s = s.zx();
            for c in symbolic.children(s) {
                assert!(seen[c]);
            }
            seen[s] = true;
        }
    }

    fn test_anomaly_counts<I: Index>() {
        let truncate = I::truncate;
        // 3×3 lower CSC with two duplicate entries, one out-of-range index,
        // and one missing diagonal
        let n = 3;
        let col_ptr = [0usize, 4, 6, 7].map(truncate);
        let row_ind = [0usize, 1, 1, 7, 1, 1, 2].map(truncate);

        let symbolic = analyse(n, &col_ptr, &row_ind, None, &Options::default()).unwrap();
        assert_eq!(symbolic.inform().matrix_dup, 2);
        assert_eq!(symbolic.inform().matrix_outrange, 1);
        assert_eq!(symbolic.inform().matrix_missing_diag, 0);
        assert_eq!(symbolic.inform().flag, crate::flag::WARN_MATRIX_ANOMALY);

        // duplicates share a canonical slot
        let map = symbolic.entry_to_canon();
        assert_eq!(map[1], map[2]);
        assert_eq!(map[4], map[5]);
        assert_eq!(map[3], truncate(crate::mem::NONE));

        // missing diagonal is repaired and counted
        let col_ptr = [0usize, 1, 2, 2].map(truncate);
        let row_ind = [0usize, 1].map(truncate);
        let symbolic = analyse(n, &col_ptr, &row_ind, None, &Options::default()).unwrap();
        assert_eq!(symbolic.inform().matrix_missing_diag, 1);
        assert_eq!(symbolic.canon_len(), 3);
    }

    fn test_one_based_input<I: Index>() {
        let truncate = I::truncate;
        let n = 3;
        let col_ptr0 = [0usize, 2, 4, 5].map(truncate);
        let row_ind0 = [0usize, 2, 1, 2, 2].map(truncate);
        let col_ptr1 = [1usize, 3, 5, 6].map(truncate);
        let row_ind1 = [1usize, 3, 2, 3, 3].map(truncate);

        let s0 = analyse(n, &col_ptr0, &row_ind0, None, &Options::default()).unwrap();
        let s1 = analyse(
            n,
            &col_ptr1,
            &row_ind1,
            None,
            &Options {
                array_base: 1,
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(s0.col_ptrs(), s1.col_ptrs());
        assert_eq!(s0.row_indices(), s1.row_indices());
    }

    fn test_custom_order<I: Index>() {
        let truncate = I::truncate;
        let n = 4;
        // arrow matrix, dense first column
        let col_ptr = [0usize, 4, 5, 6, 7].map(truncate);
        let row_ind = [0usize, 1, 2, 3, 1, 2, 3].map(truncate);

        // eliminate the dense column last
        let order = [3usize, 0, 1, 2].map(truncate);
        let symbolic = analyse(n, &col_ptr, &row_ind, Some(&order), &Options::default()).unwrap();
        let (fwd, inv) = symbolic.perm_arrays();
        assert_eq!(fwd.iter().map(|&i| i.zx()).collect::<Vec<_>>(), [1, 2, 3, 0]);
        assert_eq!(inv.iter().map(|&i| i.zx()).collect::<Vec<_>>(), [3, 0, 1, 2]);

        // not a permutation
        let order = [0usize, 0, 1, 2].map(truncate);
        assert_eq!(
            analyse(n, &col_ptr, &row_ind, Some(&order), &Options::default()).err(),
            Some(FrontalError::InvalidOrder)
        );
    }

    fn test_invalid_inputs<I: Index>() {
        let truncate = I::truncate;
        let n = 2;
        let good_ptr = [0usize, 1, 2].map(truncate);
        let good_row = [0usize, 1].map(truncate);

        assert_eq!(
            analyse::<I>(n, &good_ptr[..2], &good_row, None, &Options::default()).err(),
            Some(FrontalError::InvalidPattern)
        );
        let bad_ptr = [0usize, 2, 1].map(truncate);
        assert_eq!(
            analyse::<I>(n, &bad_ptr, &good_row, None, &Options::default()).err(),
            Some(FrontalError::InvalidPattern)
        );
        assert_eq!(
            analyse::<I>(n, &good_ptr, &good_row[..1], None, &Options::default()).err(),
            Some(FrontalError::InvalidPattern)
        );
        // an empty system has nothing to factor
        let empty = [truncate(0usize)];
        assert_eq!(
            analyse::<I>(0, &empty, &[], None, &Options::default()).err(),
            Some(FrontalError::InvalidDimension)
        );
    }

    fn test_coord_mirror<I: Index>() {
        let truncate = I::truncate;
        let n = 3;
        let rows = [0usize, 2, 0, 1, 2].map(truncate);
        let cols = [0usize, 0, 2, 1, 2].map(truncate);
        let symbolic = analyse_coord(n, &rows, &cols, None, &Options::default()).unwrap();
        // (2, 0) and its mirror (0, 2) fold onto one slot
        assert_eq!(symbolic.inform().matrix_dup, 1);
        assert_eq!(symbolic.inform().matrix_outrange, 0);
        let map = symbolic.entry_to_canon();
        assert_eq!(map[1], map[2]);
    }

    fn test_amalgamation_nemin<I: Index>() {
        let (n, col_ptr, row_ind) = fixture_11::<I>();
        let loose = analyse(
            n,
            &col_ptr,
            &row_ind,
            None,
            &Options {
                nemin: 16,
                ..Options::default()
            },
        )
        .unwrap();
        let tight = analyse(
            n,
            &col_ptr,
            &row_ind,
            None,
            &Options {
                nemin: 1,
                ..Options::default()
            },
        )
        .unwrap();
        // a large nemin merges more aggressively
        assert!(loose.n_supernodes() <= tight.n_supernodes());
        assert!(loose.n_supernodes() >= 1);
    }

    monomorphize_test!(test_analyse_fixture);
    monomorphize_test!(test_anomaly_counts);
    monomorphize_test!(test_one_based_input);
    monomorphize_test!(test_custom_order);
    monomorphize_test!(test_invalid_inputs);
    monomorphize_test!(test_coord_mirror);
    monomorphize_test!(test_amalgamation_nemin);
}
