// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Problem description: shape, layouts and element kind of one multiply.

use std::mem::size_of;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage order of a matrix operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    RowMajor,
    ColumnMajor,
}

impl Layout {
    /// Numeric tag used in the tiling key and in layout-pair tables.
    pub fn tag(self) -> u8 {
        match self {
            Layout::RowMajor => 0,
            Layout::ColumnMajor => 1,
        }
    }

    /// Extent of the contiguous (minor) dimension of a `rows x cols` matrix.
    #[inline]
    pub fn minor_extent(self, rows: usize, cols: usize) -> usize {
        match self {
            Layout::RowMajor => cols,
            Layout::ColumnMajor => rows,
        }
    }

    /// Extent of the strided (major) dimension of a `rows x cols` matrix.
    #[inline]
    pub fn major_extent(self, rows: usize, cols: usize) -> usize {
        match self {
            Layout::RowMajor => rows,
            Layout::ColumnMajor => cols,
        }
    }

    /// Row and column strides, in elements, for leading dimension `ld`.
    #[inline]
    pub fn strides(self, ld: usize) -> (isize, isize) {
        match self {
            Layout::RowMajor => (ld as isize, 1),
            Layout::ColumnMajor => (1, ld as isize),
        }
    }
}

/// Fixed width element kinds understood by the cost model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    F16,
    Bf16,
    F32,
}

impl ElementKind {
    pub fn size_bytes(self) -> usize {
        match self {
            ElementKind::F16 | ElementKind::Bf16 => 2,
            ElementKind::F32 => 4,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            ElementKind::F16 => 0,
            ElementKind::Bf16 => 1,
            ElementKind::F32 => 2,
        }
    }
}

/// Layout and leading dimension of one operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Operand {
    pub layout: Layout,
    pub ld: usize,
}

/// Which operand of `C = A B`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperandId {
    A,
    B,
    C,
}

impl OperandId {
    pub(crate) fn name(self) -> char {
        match self {
            OperandId::A => 'A',
            OperandId::B => 'B',
            OperandId::C => 'C',
        }
    }
}

/// Tiling parameters are stored as 32-bit values on the device.
pub const MAX_DIM: usize = u32::MAX as usize;

/// Immutable description of one multiply `C (m x n) = A (m x k) B (k x n)`.
///
/// Build with [`ProblemShape::builder`]; validation happens once in
/// [`ProblemBuilder::build`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProblemShape {
    pub(crate) m: usize,
    pub(crate) n: usize,
    pub(crate) k: usize,
    pub(crate) a: Operand,
    pub(crate) b: Operand,
    pub(crate) c: Operand,
    pub(crate) element: ElementKind,
}

impl ProblemShape {
    pub fn builder(m: usize, n: usize, k: usize) -> ProblemBuilder {
        ProblemBuilder {
            m,
            n,
            k,
            layouts: [Layout::RowMajor; 3],
            ld: [None; 3],
            element: ElementKind::F16,
        }
    }

    #[inline]
    pub fn m(&self) -> usize { self.m }
    #[inline]
    pub fn n(&self) -> usize { self.n }
    #[inline]
    pub fn k(&self) -> usize { self.k }
    #[inline]
    pub fn element(&self) -> ElementKind { self.element }

    pub fn operand(&self, id: OperandId) -> Operand {
        match id {
            OperandId::A => self.a,
            OperandId::B => self.b,
            OperandId::C => self.c,
        }
    }

    /// Logical `(rows, cols)` of an operand.
    pub fn dims(&self, id: OperandId) -> (usize, usize) {
        match id {
            OperandId::A => (self.m, self.k),
            OperandId::B => (self.k, self.n),
            OperandId::C => (self.m, self.n),
        }
    }

    /// `(inner, outer)` axis lengths of an operand as stored in memory.
    pub fn inner_outer(&self, id: OperandId) -> (usize, usize) {
        let (rows, cols) = self.dims(id);
        let layout = self.operand(id).layout;
        (layout.minor_extent(rows, cols), layout.major_extent(rows, cols))
    }

    /// Number of elements a buffer must hold to back operand `id`.
    pub fn required_len(&self, id: OperandId) -> usize {
        let (rows, cols) = self.dims(id);
        let op = self.operand(id);
        required_len(rows, cols, op.layout, op.ld)
    }
}

pub(crate) fn required_len(rows: usize, cols: usize, layout: Layout, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    let major = layout.major_extent(rows, cols);
    let minor = layout.minor_extent(rows, cols);
    (major - 1) * ld + minor
}

fn checked_len(rows: usize, cols: usize, layout: Layout, ld: usize) -> Option<usize> {
    let major = layout.major_extent(rows, cols);
    let minor = layout.minor_extent(rows, cols);
    (major - 1).checked_mul(ld)?.checked_add(minor)
}

/// Builder for [`ProblemShape`].
#[derive(Clone, Debug)]
pub struct ProblemBuilder {
    m: usize,
    n: usize,
    k: usize,
    layouts: [Layout; 3],
    ld: [Option<usize>; 3],
    element: ElementKind,
}

impl ProblemBuilder {
    pub fn layouts(mut self, a: Layout, b: Layout, c: Layout) -> Self {
        self.layouts = [a, b, c];
        self
    }

    /// Leading dimension for `id`; defaults to the packed minor extent.
    pub fn ld(mut self, id: OperandId, ld: usize) -> Self {
        self.ld[id as usize] = Some(ld);
        self
    }

    pub fn element(mut self, element: ElementKind) -> Self {
        self.element = element;
        self
    }

    pub fn build(self) -> Result<ProblemShape> {
        let ProblemBuilder { m, n, k, layouts, ld, element } = self;
        if m == 0 || n == 0 || k == 0 {
            return Err(Error::EmptyProblem { m, n, k });
        }
        for &dim in &[m, n, k] {
            if dim > MAX_DIM {
                return Err(Error::ExceedsLimits(dim));
            }
        }
        let dims = [(m, k), (k, n), (m, n)];
        let ids = [OperandId::A, OperandId::B, OperandId::C];
        let mut ops = [Operand { layout: Layout::RowMajor, ld: 0 }; 3];
        for i in 0..3 {
            let (rows, cols) = dims[i];
            let extent = layouts[i].minor_extent(rows, cols);
            let ld = ld[i].unwrap_or(extent);
            if ld < extent {
                return Err(Error::InvalidStride { operand: ids[i].name(), ld, extent });
            }
            // sized as f32, the widest element and the accumulator type
            match checked_len(rows, cols, layouts[i], ld)
                .and_then(|len| len.checked_mul(size_of::<f32>()))
            {
                Some(bytes) if bytes <= isize::MAX as usize => {}
                _ => return Err(Error::ExceedsLimits(rows.saturating_mul(cols))),
            }
            ops[i] = Operand { layout: layouts[i], ld };
        }
        Ok(ProblemShape {
            m,
            n,
            k,
            a: ops[0],
            b: ops[1],
            c: ops[2],
            element,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_defaults() {
        let p = ProblemShape::builder(3, 5, 7)
            .layouts(Layout::RowMajor, Layout::ColumnMajor, Layout::RowMajor)
            .build()
            .unwrap();
        assert_eq!(p.operand(OperandId::A).ld, 7);
        assert_eq!(p.operand(OperandId::B).ld, 7);
        assert_eq!(p.operand(OperandId::C).ld, 5);
        assert_eq!(p.inner_outer(OperandId::B), (7, 5));
        assert_eq!(p.required_len(OperandId::C), 15);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(ProblemShape::builder(0, 5, 7).build(),
                         Err(Error::EmptyProblem { .. })));
        let err = ProblemShape::builder(3, 5, 7).ld(OperandId::A, 6).build();
        assert!(matches!(err, Err(Error::InvalidStride { operand: 'A', ld: 6, extent: 7 })));
    }

    #[test]
    fn strided_length() {
        let p = ProblemShape::builder(4, 4, 4)
            .layouts(Layout::ColumnMajor, Layout::RowMajor, Layout::RowMajor)
            .ld(OperandId::A, 10)
            .build()
            .unwrap();
        assert_eq!(p.required_len(OperandId::A), 3 * 10 + 4);
    }
}
