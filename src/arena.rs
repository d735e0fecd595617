//! Per-worker frontal-matrix arenas.
//!
//! Frontal matrices and their side arrays are carved out of a coarse aligned
//! page ([`GlobalPodBuffer`]) in strict LIFO order matching the post-order
//! tree traversal, so a bump allocator ([`PodStack`]) is all that is needed.
//! Block sizes come from the symbolic structure's worst-case (delay
//! inflated) front dimensions, so the numeric phase never reallocates.
//!
//! Each worker of a parallel traversal owns an independent arena; a child's
//! contribution block crosses the fork-join boundary by being written into a
//! slot carved by the parent, never by transferring arena ownership.

use crate::{nomem, FrontalError, Index};
use dyn_stack::{GlobalPodBuffer, PodStack, SizeOverflow, StackReq};
use faer_core::{temp_mat_req, temp_mat_zeroed, MatMut};

/// Alignment of floating-point blocks, suitable for vectorized kernels.
pub(crate) const BLOCK_ALIGN: usize = 64;

/// An independent arena owned by one worker of the tree traversal.
pub(crate) struct WorkerArena {
    mem: GlobalPodBuffer,
}

impl WorkerArena {
    pub fn try_with(req: StackReq) -> Result<Self, FrontalError> {
        Ok(Self {
            mem: GlobalPodBuffer::try_new(req).map_err(nomem)?,
        })
    }

    #[inline]
    pub fn stack(&mut self) -> PodStack<'_> {
        PodStack::new(&mut self.mem)
    }
}

/// Requirement of the blocks live while one front is assembled and
/// factorized: the zeroed `m×m` front, its global row list, the packed
/// diagonal output, and the Schur update scratch.
pub(crate) fn front_work_req<I: Index>(
    rows_max: usize,
    cols_max: usize,
) -> Result<StackReq, SizeOverflow> {
    StackReq::try_all_of([
        temp_mat_req::<f64>(rows_max, rows_max)?,
        StackReq::try_new::<I>(rows_max)?,
        StackReq::try_new::<f64>(2 * cols_max)?,
        temp_mat_req::<f64>(rows_max, cols_max)?,
    ])
}

/// Requirement of the slot a parent carves for one child's contribution
/// block: the trailing dense block and its global row list.
pub(crate) fn contrib_slot_req<I: Index>(rows_max: usize) -> Result<StackReq, SizeOverflow> {
    let len = rows_max.checked_mul(rows_max).ok_or(SizeOverflow)?;
    StackReq::try_new_aligned::<f64>(len, BLOCK_ALIGN)?.try_and(StackReq::try_new::<I>(rows_max)?)
}

/// Acquires a zero-initialized front of order `m` together with its row
/// list. Released when the borrow on `stack` ends.
#[inline]
pub(crate) fn acquire_front<'a, I: Index>(
    m: usize,
    stack: PodStack<'a>,
) -> (MatMut<'a, f64>, &'a mut [I], PodStack<'a>) {
    let (front, stack) = temp_mat_zeroed::<f64>(m, m, stack);
    let (rows, stack) = stack.make_raw::<I>(m);
    (front, rows, stack)
}

/// Carves the output slot for one child's contribution block from the
/// parent's arena.
#[inline]
pub(crate) fn carve_contrib_slot<'a, I: Index>(
    rows_max: usize,
    stack: PodStack<'a>,
) -> (&'a mut [f64], &'a mut [I], PodStack<'a>) {
    let (vals, stack) = stack.make_aligned_raw::<f64>(rows_max * rows_max, BLOCK_ALIGN);
    let (rows, stack) = stack.make_raw::<I>(rows_max);
    (vals, rows, stack)
}
