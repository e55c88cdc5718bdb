// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Slow tier views and the launch workspace.
//!
//! The workspace is one arena per launch, partitioned statically: padded
//! copies of A and B, split-K slice planes or stream-K partial slots, the
//! padded C plane and the per unit epilogue staging slots. Every region is
//! addressed by `(unit, slot)` or by slice, so engines never share an
//! element they both write.

use std::mem::size_of;

use crate::aligned_alloc::{Alloc, BUFFER_ALIGN};
use crate::cost::PaddingTag;
use crate::kernel::Element;
use crate::pointer::Ptr;
use crate::problem::{Layout, OperandId};
use crate::tiling::{KernelVariant, TilingDecision};
use crate::util::{ceil_div, round_up_to};

/// Side of the square fractals of [`PaddingTag::FractalPad`].
pub const FRACTAL: usize = 16;

/// Reads through simple padding are fastest at this many bytes per row.
const SIMPLE_PAD_BYTES: usize = 512;

/// Element addressing of a matrix in the slow tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    Strided { rs: isize, cs: isize },
    /// Row major tiles of `tile_rows x tile_cols`, themselves row major.
    Blocked { tile_rows: usize, tile_cols: usize, tiles_per_row: usize },
    /// Row major fractals, fractal columns outermost.
    Fractal { padded_rows: usize },
}

impl Storage {
    #[inline]
    pub fn offset(&self, i: usize, j: usize) -> isize {
        match *self {
            Storage::Strided { rs, cs } => rs * i as isize + cs * j as isize,
            Storage::Blocked { tile_rows, tile_cols, tiles_per_row } => {
                let tile = (i / tile_rows) * tiles_per_row + j / tile_cols;
                (tile * tile_rows * tile_cols + (i % tile_rows) * tile_cols + j % tile_cols) as isize
            }
            Storage::Fractal { padded_rows } => {
                ((j / FRACTAL) * padded_rows * FRACTAL
                 + (i / FRACTAL) * FRACTAL * FRACTAL
                 + (i % FRACTAL) * FRACTAL
                 + j % FRACTAL) as isize
            }
        }
    }
}

/// A `rows x cols` matrix in the slow tier.
#[derive(Copy, Clone, Debug)]
pub struct GlobalView<E> {
    ptr: Ptr<E>,
    storage: Storage,
    rows: usize,
    cols: usize,
}

impl<E: Copy> GlobalView<E> {
    pub(crate) fn new(ptr: Ptr<E>, storage: Storage, rows: usize, cols: usize) -> Self {
        GlobalView { ptr, storage, rows, cols }
    }

    pub(crate) fn strided(ptr: *mut E, layout: Layout, ld: usize, rows: usize, cols: usize) -> Self {
        let (rs, cs) = layout.strides(ld);
        GlobalView::new(Ptr::new(ptr), Storage::Strided { rs, cs }, rows, cols)
    }

    #[inline]
    pub fn rows(&self) -> usize { self.rows }
    #[inline]
    pub fn cols(&self) -> usize { self.cols }
    #[inline]
    pub fn storage(&self) -> Storage { self.storage }

    /// `(row stride, column stride)` of strided storage.
    pub fn strides(&self) -> Option<(isize, isize)> {
        match self.storage {
            Storage::Strided { rs, cs } => Some((rs, cs)),
            _ => None,
        }
    }

    /// ***Safety***: `(i, j)` is inside the view.
    #[inline]
    pub unsafe fn at(&self, i: usize, j: usize) -> *mut E {
        debug_assert!(i < self.rows && j < self.cols,
                      "({}, {}) outside {} x {}", i, j, self.rows, self.cols);
        self.ptr.ptr().offset(self.storage.offset(i, j))
    }

    #[inline]
    pub unsafe fn read(&self, i: usize, j: usize) -> E {
        *self.at(i, j)
    }

    #[inline]
    pub unsafe fn write(&self, i: usize, j: usize, value: E) {
        *self.at(i, j) = value;
    }
}

/// Strided `f32` accumulator tile in the workspace.
#[derive(Copy, Clone, Debug)]
pub struct AccTile {
    ptr: Ptr<f32>,
    rs: isize,
    cs: isize,
}

impl AccTile {
    pub(crate) fn new(ptr: Ptr<f32>, rs: isize, cs: isize) -> Self {
        AccTile { ptr, rs, cs }
    }

    /// Row major tile with leading dimension `ld`.
    pub(crate) fn row_major(ptr: Ptr<f32>, ld: usize) -> Self {
        AccTile::new(ptr, ld as isize, 1)
    }

    /// The same tile, moved `(i, j)` elements.
    pub(crate) unsafe fn offset(&self, i: usize, j: usize) -> Self {
        AccTile { ptr: self.ptr.stride_offset(self.rs, i).stride_offset(self.cs, j), ..*self }
    }

    #[inline(always)]
    pub unsafe fn at(&self, i: usize, j: usize) -> *mut f32 {
        self.ptr.stride_offset(self.rs, i).stride_offset(self.cs, j).ptr()
    }
}

/// Storage of a reformatted operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PaddedOperand {
    pub storage: Storage,
    /// Elements
    pub len: usize,
}

impl PaddedOperand {
    /// Padded storage of a `rows x cols` operand, or `None` if not padded.
    pub fn new(tag: PaddingTag, rows: usize, cols: usize, layout: Layout,
               tile: (usize, usize), elem: usize) -> Option<Self>
    {
        match tag {
            PaddingTag::None => None,
            PaddingTag::SimplePad => {
                let ld = round_up_to(layout.minor_extent(rows, cols), SIMPLE_PAD_BYTES / elem);
                let (rs, cs) = layout.strides(ld);
                Some(PaddedOperand {
                    storage: Storage::Strided { rs, cs },
                    len: layout.major_extent(rows, cols).saturating_mul(ld),
                })
            }
            PaddingTag::BlockPad => {
                let (tile_rows, tile_cols) = tile;
                let tiles_per_row = ceil_div(cols, tile_cols);
                Some(PaddedOperand {
                    storage: Storage::Blocked { tile_rows, tile_cols, tiles_per_row },
                    len: (ceil_div(rows, tile_rows) * tiles_per_row).saturating_mul(tile_rows * tile_cols),
                })
            }
            PaddingTag::FractalPad => {
                let padded_rows = round_up_to(rows, FRACTAL);
                Some(PaddedOperand {
                    storage: Storage::Fractal { padded_rows },
                    len: padded_rows.saturating_mul(round_up_to(cols, FRACTAL)),
                })
            }
        }
    }
}

/// Sizes and offsets of the launch workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub a: Option<PaddedOperand>,
    pub b: Option<PaddedOperand>,
    /// Strides and length of the padded `f32` C plane.
    pub c: Option<PaddedOperand>,
    /// `f32` elements of split-K planes or stream-K partial slots.
    pub partials: usize,
    /// `f32` elements of epilogue staging, two slots per unit.
    pub staging: usize,
    tile_elems: usize,
    elem: usize,
}

impl WorkspaceLayout {
    /// Workspace of `decision`, assuming an epilogue the matrix engine cannot
    /// apply itself; this is the most a launch of it can need.
    pub fn of(decision: &TilingDecision) -> Self {
        WorkspaceLayout::new(decision, true)
    }

    pub fn new(decision: &TilingDecision, staged_epilogue: bool) -> Self {
        let p = &decision.problem;
        let l1 = decision.tile.l1;
        let elem = p.element.size_bytes();
        let units = decision.units;
        let tile_elems = l1.m * l1.n;

        let a = PaddedOperand::new(decision.padding(OperandId::A), p.m, p.k, p.a.layout,
                                   (l1.m, l1.k), elem);
        let b = PaddedOperand::new(decision.padding(OperandId::B), p.k, p.n, p.b.layout,
                                   (l1.k, l1.n), elem);
        let c = PaddedOperand::new(decision.padding(OperandId::C), p.m, p.n, p.c.layout,
                                   (l1.m, l1.n), size_of::<f32>());
        let partials = match decision.variant {
            KernelVariant::SplitK => decision.split.saturating_mul(p.m * p.n),
            KernelVariant::StreamK => units * 2 * tile_elems,
            _ => 0,
        };
        let stages_tiles = match decision.variant {
            KernelVariant::SplitK => false,
            KernelVariant::Padding => c.is_none(),
            _ => true,
        };
        let staging = if staged_epilogue && stages_tiles {
            units * 2 * tile_elems
        } else {
            0
        };
        WorkspaceLayout { a, b, c, partials, staging, tile_elems, elem }
    }

    fn len_of(operand: &Option<PaddedOperand>) -> usize {
        operand.map_or(0, |o| o.len)
    }

    /// `f32` elements: partials, then padded C, then staging.
    fn acc_len(&self) -> usize {
        self.partials.saturating_add(WorkspaceLayout::len_of(&self.c)).saturating_add(self.staging)
    }

    /// Saturates at `usize::MAX` for workspaces no host could allocate.
    pub fn bytes(&self) -> usize {
        WorkspaceLayout::len_of(&self.a)
            .saturating_add(WorkspaceLayout::len_of(&self.b))
            .saturating_mul(self.elem)
            .saturating_add(self.acc_len().saturating_mul(size_of::<f32>()))
    }
}

/// The launch arena.
pub(crate) struct Workspace<E> {
    layout: WorkspaceLayout,
    a: Alloc<E>,
    b: Alloc<E>,
    acc: Alloc<f32>,
}

impl<E: Element> Workspace<E> {
    pub(crate) fn new(layout: WorkspaceLayout) -> Self {
        let a = Alloc::filled(WorkspaceLayout::len_of(&layout.a), BUFFER_ALIGN, E::zero());
        let b = Alloc::filled(WorkspaceLayout::len_of(&layout.b), BUFFER_ALIGN, E::zero());
        let acc = Alloc::filled(layout.acc_len(), BUFFER_ALIGN, 0f32);
        Workspace { layout, a, b, acc }
    }

    pub(crate) fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// View of the padded copy of A or B with the logical `rows x cols`.
    pub(crate) fn padded(&self, id: OperandId, rows: usize, cols: usize) -> Option<GlobalView<E>> {
        let (operand, buf) = match id {
            OperandId::A => (self.layout.a, &self.a),
            OperandId::B => (self.layout.b, &self.b),
            OperandId::C => return None,
        };
        operand.map(|o| GlobalView::new(Ptr::new(buf.ptr_mut()), o.storage, rows, cols))
    }

    fn acc_ptr(&self, offset: usize) -> Ptr<f32> {
        debug_assert!(offset <= self.acc.len());
        unsafe { Ptr::new(self.acc.ptr_mut()).add(offset) }
    }

    /// Plane of split-K slice `slice`, row major `m x n`.
    pub(crate) fn split_plane(&self, slice: usize, m: usize, n: usize) -> AccTile {
        debug_assert_eq!(self.layout.partials % (m * n), 0);
        AccTile::row_major(self.acc_ptr(slice * m * n), n)
    }

    /// Stream-K partial slot `slot` of `unit`, row major with the nominal
    /// tile width as leading dimension.
    pub(crate) fn stream_slot(&self, unit: usize, slot: usize, ld: usize) -> AccTile {
        debug_assert!(slot < 2);
        AccTile::row_major(self.acc_ptr((unit * 2 + slot) * self.layout.tile_elems), ld)
    }

    /// The padded C plane, in C's layout.
    pub(crate) fn padded_c(&self) -> Option<AccTile> {
        self.layout.c.map(|c| match c.storage {
            Storage::Strided { rs, cs } => AccTile::new(self.acc_ptr(self.layout.partials), rs, cs),
            _ => unreachable!("C only takes simple padding"),
        })
    }

    /// Epilogue staging slot `slot` of `unit`.
    pub(crate) fn staging(&self, unit: usize, slot: usize, ld: usize) -> AccTile {
        debug_assert!(slot < 2);
        let base = self.layout.partials + WorkspaceLayout::len_of(&self.layout.c);
        AccTile::row_major(self.acc_ptr(base + (unit * 2 + slot) * self.layout.tile_elems), ld)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractal_offsets() {
        let s = Storage::Fractal { padded_rows: 32 };
        assert_eq!(s.offset(0, 0), 0);
        assert_eq!(s.offset(1, 0), 16);
        assert_eq!(s.offset(16, 0), 256);
        // next fractal column starts after all 32 padded rows
        assert_eq!(s.offset(0, 16), 512);
        assert_eq!(s.offset(17, 18), 512 + 256 + 16 + 2);
    }

    #[test]
    fn blocked_offsets() {
        let s = Storage::Blocked { tile_rows: 2, tile_cols: 3, tiles_per_row: 2 };
        assert_eq!(s.offset(0, 2), 2);
        assert_eq!(s.offset(1, 0), 3);
        assert_eq!(s.offset(0, 3), 6);
        assert_eq!(s.offset(2, 0), 12);
    }

    #[test]
    fn padded_sizes() {
        let simple = PaddedOperand::new(PaddingTag::SimplePad, 10, 300, Layout::RowMajor,
                                        (16, 16), 2).unwrap();
        assert_eq!(simple.storage, Storage::Strided { rs: 512, cs: 1 });
        assert_eq!(simple.len, 10 * 512);
        let fractal = PaddedOperand::new(PaddingTag::FractalPad, 4096, 7, Layout::RowMajor,
                                         (128, 256), 2).unwrap();
        assert_eq!(fractal.len, 4096 * 16);
        assert!(PaddedOperand::new(PaddingTag::None, 1, 1, Layout::RowMajor, (1, 1), 2).is_none());
    }

    #[test]
    fn distinct_offsets_fill_padded_storage() {
        for &tag in &[PaddingTag::BlockPad, PaddingTag::FractalPad] {
            let (rows, cols) = (37, 21);
            let op = PaddedOperand::new(tag, rows, cols, Layout::RowMajor, (16, 8), 2).unwrap();
            let mut seen = vec![false; op.len];
            for i in 0..rows {
                for j in 0..cols {
                    let off = op.storage.offset(i, j) as usize;
                    assert!(!seen[off], "{:?} maps two elements to {}", tag, off);
                    seen[off] = true;
                }
            }
        }
    }
}
