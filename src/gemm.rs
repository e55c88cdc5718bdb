// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::panic::resume_unwind;

use crate::calibration::Calibration;
use crate::engine::{kernel_for, LaunchContext};
use crate::error::{Error, Result};
use crate::kernel::{Element, Epilogue, Portable, Primitives};
use crate::memory::{GlobalView, Workspace, WorkspaceLayout};
use crate::platform::PlatformCapacities;
use crate::problem::{Layout, OperandId, ProblemShape};
use crate::scheduler::BlockCoord;
use crate::sync::LaunchFlags;
use crate::tiling::{TilingDecision, TilingSelector};

/// Read only matrix operand backed by a slice.
///
/// Nothing is checked until the view is used in a launch.
#[derive(Copy, Clone, Debug)]
pub struct MatRef<'a, E> {
    data: &'a [E],
    rows: usize,
    cols: usize,
    layout: Layout,
    ld: usize,
}

/// Mutable matrix operand backed by a slice.
#[derive(Debug)]
pub struct MatMut<'a, E> {
    data: &'a mut [E],
    rows: usize,
    cols: usize,
    layout: Layout,
    ld: usize,
}

impl<'a, E> MatRef<'a, E> {
    /// Packed row major `rows x cols` matrix.
    pub fn row_major(data: &'a [E], rows: usize, cols: usize) -> Self {
        MatRef { data, rows, cols, layout: Layout::RowMajor, ld: cols }
    }

    /// Packed column major `rows x cols` matrix.
    pub fn col_major(data: &'a [E], rows: usize, cols: usize) -> Self {
        MatRef { data, rows, cols, layout: Layout::ColumnMajor, ld: rows }
    }

    /// Use leading dimension `ld` instead of the packed one.
    pub fn with_ld(mut self, ld: usize) -> Self {
        self.ld = ld;
        self
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn layout(&self) -> Layout { self.layout }
}

impl<'a, E> MatMut<'a, E> {
    pub fn row_major(data: &'a mut [E], rows: usize, cols: usize) -> Self {
        MatMut { data, rows, cols, layout: Layout::RowMajor, ld: cols }
    }

    pub fn col_major(data: &'a mut [E], rows: usize, cols: usize) -> Self {
        MatMut { data, rows, cols, layout: Layout::ColumnMajor, ld: rows }
    }

    pub fn with_ld(mut self, ld: usize) -> Self {
        self.ld = ld;
        self
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn layout(&self) -> Layout { self.layout }
}

/// What a launch did.
#[derive(Clone, Debug)]
pub struct LaunchReport {
    pub decision: TilingDecision,
    pub units: usize,
    /// Per unit, the tiles its matrix engine processed, in order.
    pub tiles: Vec<Vec<BlockCoord>>,
}

/// A set of parallel units with tiered memory, and the calibration of its
/// cost model.
#[derive(Clone, Debug, Default)]
pub struct Device {
    platform: PlatformCapacities,
    calibration: Calibration,
}

impl Device {
    pub fn new(platform: PlatformCapacities) -> Self {
        Device { platform, calibration: Calibration::default() }
    }

    /// Units of this host, see [`PlatformCapacities::host`].
    pub fn host() -> Self {
        Device::new(PlatformCapacities::host())
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn platform(&self) -> &PlatformCapacities {
        &self.platform
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Tiling and kernel variant for `problem` on this device.
    pub fn select(&self, problem: &ProblemShape) -> Result<TilingDecision> {
        TilingSelector::new(&self.platform, &self.calibration).select(problem)
    }

    /// General matrix multiplication
    ///
    /// C ← α A B + β C
    ///
    /// + A: m by k matrix
    /// + B: k by n matrix
    /// + C: m by n matrix
    ///
    /// If β is zero, then C does not need to be initialized.
    pub fn gemm<E: Element>(&self, alpha: f32, a: MatRef<'_, E>, b: MatRef<'_, E>,
                            beta: f32, c: MatMut<'_, E>) -> Result<LaunchReport>
    {
        self.gemm_with(&Epilogue::new(alpha, beta), a, b, c)
    }

    /// C ← act(α A B + β C)
    pub fn gemm_with<E: Element>(&self, epilogue: &Epilogue, a: MatRef<'_, E>,
                                 b: MatRef<'_, E>, c: MatMut<'_, E>) -> Result<LaunchReport>
    {
        let problem = problem_of(&a, &b, &c)?;
        let decision = self.select(&problem)?;
        self.launch(&decision, epilogue, a, b, c)
    }

    /// y ← α A x + β y
    pub fn gemv<E: Element>(&self, alpha: f32, a: MatRef<'_, E>, x: &[E],
                            beta: f32, y: &mut [E]) -> Result<LaunchReport>
    {
        if x.len() != a.cols || y.len() != a.rows {
            return Err(Error::ShapeMismatch(format!(
                "A is {}x{}, x has {} elements, y has {}", a.rows, a.cols, x.len(), y.len())));
        }
        let (m, k) = (a.rows, a.cols);
        self.gemm(alpha, a, MatRef::col_major(x, k, 1), beta, MatMut::col_major(y, m, 1))
    }

    /// Run `decision` with the reference primitives.
    pub fn launch<E: Element>(&self, decision: &TilingDecision, epilogue: &Epilogue,
                              a: MatRef<'_, E>, b: MatRef<'_, E>, c: MatMut<'_, E>)
        -> Result<LaunchReport>
    {
        self.launch_with(decision, epilogue, a, b, c, &Portable)
    }

    /// Run `decision` with the primitives of another backend.
    ///
    /// All checks happen before any engine starts. An engine that panics
    /// stops the others; the panic is resumed on the calling thread.
    pub fn launch_with<E: Element>(&self, decision: &TilingDecision, epilogue: &Epilogue,
                                   a: MatRef<'_, E>, b: MatRef<'_, E>, c: MatMut<'_, E>,
                                   prims: &dyn Primitives<E>) -> Result<LaunchReport>
    {
        let problem = problem_of(&a, &b, &c)?;
        if decision.problem != problem {
            return Err(Error::InvalidDecision(format!(
                "decision is for {}x{}x{}, operands are {}x{}x{}",
                decision.problem.m, decision.problem.n, decision.problem.k,
                problem.m, problem.n, problem.k)));
        }
        decision.tile.validate(problem.element, &self.platform)?;
        if decision.units > self.platform.units {
            return Err(Error::InvalidDecision(format!(
                "decision uses {} units, device has {}", decision.units, self.platform.units)));
        }

        let layout = WorkspaceLayout::new(decision, !epilogue.is_direct());
        log::debug!("launch {} on {} units, {} workspace bytes",
                    decision.tiling_key(), decision.units, layout.bytes());
        let workspace = Workspace::<E>::new(layout);
        let flags = LaunchFlags::new(decision.units);
        let av = GlobalView::strided(a.data.as_ptr() as *mut E, a.layout, a.ld, a.rows, a.cols);
        let bv = GlobalView::strided(b.data.as_ptr() as *mut E, b.layout, b.ld, b.rows, b.cols);
        let cv = GlobalView::strided(c.data.as_mut_ptr(), c.layout, c.ld, c.rows, c.cols);
        let cx = LaunchContext::new(decision, epilogue, prims, &self.platform,
                                    av, bv, cv, &workspace, &flags);
        let kernel = kernel_for::<E>(decision.variant);
        let (cx, kernel) = (&cx, &*kernel);

        let res = crossbeam::scope(|s| {
            for unit in 0..decision.units {
                s.spawn(move |_| {
                    let _guard = cx.flags.abort.on_panic();
                    kernel.vector_engine(unit, cx)
                });
            }
            let matrix: Vec<_> = (0..decision.units)
                .map(|unit| s.spawn(move |_| {
                    let _guard = cx.flags.abort.on_panic();
                    kernel.matrix_engine(unit, cx)
                }))
                .collect();
            matrix.into_iter().map(|h| h.join()).collect::<std::thread::Result<Vec<_>>>()
        });
        let tiles = match res {
            Ok(Ok(tiles)) => tiles,
            Ok(Err(payload)) | Err(payload) => resume_unwind(payload),
        };
        Ok(LaunchReport { decision: decision.clone(), units: decision.units, tiles })
    }
}

/// Check the operands against each other and their buffers.
fn problem_of<E: Element>(a: &MatRef<'_, E>, b: &MatRef<'_, E>, c: &MatMut<'_, E>)
    -> Result<ProblemShape>
{
    if a.cols != b.rows || a.rows != c.rows || b.cols != c.cols {
        return Err(Error::ShapeMismatch(format!(
            "A is {}x{}, B is {}x{}, C is {}x{}",
            a.rows, a.cols, b.rows, b.cols, c.rows, c.cols)));
    }
    let problem = ProblemShape::builder(a.rows, b.cols, a.cols)
        .layouts(a.layout, b.layout, c.layout)
        .ld(OperandId::A, a.ld)
        .ld(OperandId::B, b.ld)
        .ld(OperandId::C, c.ld)
        .element(E::KIND)
        .build()?;
    let lens = [(OperandId::A, a.data.len()), (OperandId::B, b.data.len()),
                (OperandId::C, c.data.len())];
    for &(id, len) in &lens {
        let need = problem.required_len(id);
        if len < need {
            return Err(Error::BufferTooSmall { operand: id.name(), len, need });
        }
    }
    Ok(problem)
}
