// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Kernel variants: what the matrix and vector engine of a unit do.
//!
//! Every unit runs the same static stride loop over the scheduler's tasks,
//! `unit, unit + units, ...`, so both engines of a unit derive the same job
//! list independently and meet only at the flags.

use std::cmp::max;
use std::mem::size_of;

use crate::kernel::{Element, Epilogue, Primitives, TileCopy, TileEpilogue};
use crate::memory::{AccTile, GlobalView, Workspace};
use crate::pipeline::{run_matrix_engine, run_single_pass, OutputTarget, TileJob};
use crate::platform::PlatformCapacities;
use crate::problem::OperandId;
use crate::scheduler::{BlockCoord, BlockScheduler, StreamkScheduler};
use crate::sync::{Aborted, LaunchFlags};
use crate::tiling::{BlockShape, KernelVariant, TilingDecision, STAGES};
use crate::util::{range_chunk, static_part};

/// Everything the engines of one launch share.
pub struct LaunchContext<'a, E: Element> {
    pub(crate) decision: &'a TilingDecision,
    pub(crate) epilogue: &'a Epilogue,
    pub(crate) prims: &'a dyn Primitives<E>,
    pub(crate) platform: &'a PlatformCapacities,
    src_a: GlobalView<E>,
    src_b: GlobalView<E>,
    /// What the loader reads: the caller's operand or its padded copy.
    pub(crate) a: GlobalView<E>,
    pub(crate) b: GlobalView<E>,
    pub(crate) c: GlobalView<E>,
    pub(crate) workspace: &'a Workspace<E>,
    pub(crate) flags: &'a LaunchFlags,
    pub(crate) scheduler: BlockScheduler,
}

impl<'a, E: Element> LaunchContext<'a, E> {
    pub(crate) fn new(decision: &'a TilingDecision, epilogue: &'a Epilogue,
                      prims: &'a dyn Primitives<E>, platform: &'a PlatformCapacities,
                      a: GlobalView<E>, b: GlobalView<E>, c: GlobalView<E>,
                      workspace: &'a Workspace<E>, flags: &'a LaunchFlags) -> Self
    {
        let p = &decision.problem;
        let padded_a = workspace.padded(OperandId::A, p.m, p.k);
        let padded_b = workspace.padded(OperandId::B, p.k, p.n);
        LaunchContext {
            decision,
            epilogue,
            prims,
            platform,
            src_a: a,
            src_b: b,
            a: padded_a.unwrap_or(a),
            b: padded_b.unwrap_or(b),
            c,
            workspace,
            flags,
            scheduler: BlockScheduler::of(decision),
        }
    }

    /// Whether A or B is reformatted before the matrix engines start.
    pub(crate) fn reformats(&self) -> bool {
        !(self.decision.padding(OperandId::A).is_none()
          && self.decision.padding(OperandId::B).is_none())
    }

    fn units(&self) -> usize {
        self.decision.units
    }

    fn n1(&self) -> usize {
        self.decision.tile.l1.n
    }

    /// Rows of a `cols` wide strip summing `parts` partials that fit the
    /// unified buffer with double buffering.
    fn ub_rows(&self, cols: usize, parts: usize) -> usize {
        let elem = self.decision.problem.element.size_bytes();
        let row_bytes = cols * (parts * size_of::<f32>() + elem) * STAGES;
        max(1, self.platform.ub_bytes / max(1, row_bytes))
    }

    /// Task order of `unit` in the static stride loop.
    fn tasks(&self, unit: usize) -> impl Iterator<Item = BlockCoord> + '_ {
        let swizzle = self.decision.swizzle;
        (unit..self.scheduler.total_tasks())
            .step_by(self.units())
            .map(move |task| self.scheduler.coord_of(task, swizzle))
    }

    /// Jobs for full output tiles, finished by the epilogue path.
    fn output_jobs(&self, coords: impl Iterator<Item = BlockCoord>) -> Vec<TileJob> {
        let direct = self.epilogue.is_direct();
        let padded_c = self.workspace.padded_c();
        let mut staged = 0;
        coords
            .map(|coord| {
                let target = if let Some(pc) = padded_c {
                    let (row, col) = self.scheduler.origin(coord);
                    OutputTarget::Workspace(unsafe { pc.offset(row, col) })
                } else if direct {
                    OutputTarget::Direct
                } else {
                    staged += 1;
                    OutputTarget::Staged((staged - 1) % 2)
                };
                TileJob { coord, shape: self.scheduler.actual_shape_of(coord), k_offset: 0, target }
            })
            .collect()
    }

    /// Epilogue over a block of C from workspace partials, in strips that
    /// fit the unified buffer.
    fn epilogue_strips(&self, parts: &[AccTile], row: usize, col: usize,
                       rows: usize, cols: usize)
    {
        let strips = range_chunk(rows, self.ub_rows(cols, parts.len()));
        let mut shifted = parts.to_vec();
        for (index, len) in strips {
            let r = strips.start_of(index);
            unsafe {
                for (dst, src) in shifted.iter_mut().zip(parts) {
                    *dst = src.offset(r, 0);
                }
                self.prims.apply(self.epilogue, &shifted, &self.c, row + r, col, len, cols);
            }
        }
    }

    /// Reformat this unit's share of the padded operands.
    fn prologue(&self, unit: usize) {
        if !self.reformats() {
            return;
        }
        let operands = [(OperandId::A, &self.src_a, &self.a), (OperandId::B, &self.src_b, &self.b)];
        for &(id, src, dst) in &operands {
            if self.decision.padding(id).is_none() {
                continue;
            }
            let rows = static_part(src.rows(), unit, self.units());
            dprint!("unit {} reformats rows {:?} of {}", unit, rows, id.name());
            unsafe {
                self.prims.reformat(src, dst, rows);
            }
        }
        self.flags.prologue.set(unit);
    }

    /// Vector side of the staged epilogue: drain tiles in the order the
    /// matrix engine fills them.
    fn drain_staged(&self, unit: usize, jobs: &[TileJob]) -> Result<(), Aborted> {
        let pair = &self.flags.pairs[unit];
        for job in jobs {
            if let OutputTarget::Staged(slot) = job.target {
                pair.ready[slot].wait(&self.flags.abort)?;
                let (row, col) = self.scheduler.origin(job.coord);
                let part = self.workspace.staging(unit, slot, self.n1());
                self.epilogue_strips(&[part], row, col, job.shape.m, job.shape.n);
                pair.free[slot].set();
            }
        }
        Ok(())
    }

    /// Copy this unit's rows of the padded C plane back through the epilogue.
    fn padded_c_back(&self, unit: usize) -> Result<(), Aborted> {
        if let Some(pc) = self.workspace.padded_c() {
            self.flags.matrix_done.wait_all(&self.flags.abort)?;
            let p = &self.decision.problem;
            let rows = static_part(p.m, unit, self.units());
            if !rows.is_empty() {
                let part = unsafe { pc.offset(rows.start, 0) };
                self.epilogue_strips(&[part], rows.start, 0, rows.len(), p.n);
            }
        }
        Ok(())
    }

    fn finish_matrix(&self, unit: usize, run: Result<(), Aborted>) {
        if run.is_ok() {
            self.flags.matrix_done.set(unit);
        }
    }

    /// An aborted vector engine just stops; `launch_with` re-raises the
    /// panic that raised the abort.
    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    fn finish_vector(&self, unit: usize, run: Result<(), Aborted>) {
        match run {
            Ok(()) => {}
            Err(Aborted) => {
                dprint!("unit {} vector engine stopped by abort", unit);
            }
        }
    }
}

fn coords(jobs: &[TileJob]) -> Vec<BlockCoord> {
    jobs.iter().map(|job| job.coord).collect()
}

/// One kernel variant's engine programs.
pub trait MatmulKernel<E: Element> : Send + Sync {
    fn variant(&self) -> KernelVariant;

    /// Run the matrix engine of `unit`; returns the tiles it processed, in
    /// order.
    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord>;

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>);
}

/// Whole problem in a few tiles with a single k tile; no pipelining.
#[derive(Copy, Clone, Debug, Default)]
pub struct Small;

/// Pipelined tiles straight from the caller's operands.
#[derive(Copy, Clone, Debug, Default)]
pub struct Common;

/// Operands reformatted by the vector engines first; C optionally through
/// a padded plane.
#[derive(Copy, Clone, Debug, Default)]
pub struct Padding;

/// K split into slices reduced by the vector engines.
#[derive(Copy, Clone, Debug, Default)]
pub struct SplitK;

/// Tail tiles' K iterations spread over all units, fixed up by the vector
/// engines.
#[derive(Copy, Clone, Debug, Default)]
pub struct StreamK;

impl<E: Element> MatmulKernel<E> for Small {
    fn variant(&self) -> KernelVariant { KernelVariant::Small }

    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord> {
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_matrix(unit, run_single_pass(cx, unit, &jobs));
        coords(&jobs)
    }

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) {
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_vector(unit, cx.drain_staged(unit, &jobs));
    }
}

impl<E: Element> MatmulKernel<E> for Common {
    fn variant(&self) -> KernelVariant { KernelVariant::Common }

    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord> {
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_matrix(unit, run_matrix_engine(cx, unit, &jobs));
        coords(&jobs)
    }

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) {
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_vector(unit, cx.drain_staged(unit, &jobs));
    }
}

impl<E: Element> MatmulKernel<E> for Padding {
    fn variant(&self) -> KernelVariant { KernelVariant::Padding }

    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord> {
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_matrix(unit, run_matrix_engine(cx, unit, &jobs));
        coords(&jobs)
    }

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) {
        cx.prologue(unit);
        let jobs = cx.output_jobs(cx.tasks(unit));
        cx.finish_vector(unit, cx.drain_staged(unit, &jobs)
            .and_then(|()| cx.padded_c_back(unit)));
    }
}

impl SplitK {
    fn jobs<E: Element>(cx: &LaunchContext<'_, E>, unit: usize) -> Vec<TileJob> {
        let p = &cx.decision.problem;
        cx.tasks(unit)
            .map(|coord| {
                let shape = cx.scheduler.actual_shape_of(coord);
                let (k_offset, _) = cx.scheduler.k_range(coord.split);
                let (row, col) = cx.scheduler.origin(coord);
                let plane = cx.workspace.split_plane(coord.split, p.m, p.n);
                let target = OutputTarget::Workspace(unsafe { plane.offset(row, col) });
                TileJob { coord, shape, k_offset, target }
            })
            .collect()
    }
}

impl<E: Element> MatmulKernel<E> for SplitK {
    fn variant(&self) -> KernelVariant { KernelVariant::SplitK }

    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord> {
        let jobs = SplitK::jobs(cx, unit);
        cx.finish_matrix(unit, run_matrix_engine(cx, unit, &jobs));
        coords(&jobs)
    }

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) {
        cx.prologue(unit);
        if let Err(Aborted) = cx.flags.matrix_done.wait_all(&cx.flags.abort) {
            cx.finish_vector(unit, Err(Aborted));
            return;
        }
        let p = &cx.decision.problem;
        let rows = static_part(p.m, unit, cx.units());
        if rows.is_empty() {
            return;
        }
        let parts: Vec<AccTile> = (0..cx.decision.split)
            .map(|slice| unsafe { cx.workspace.split_plane(slice, p.m, p.n).offset(rows.start, 0) })
            .collect();
        dprint!("unit {} reduces {} slices over rows {:?}", unit, parts.len(), rows);
        cx.epilogue_strips(&parts, rows.start, 0, rows.len(), p.n);
    }
}

impl StreamK {
    fn scheduler<E: Element>(cx: &LaunchContext<'_, E>) -> StreamkScheduler {
        StreamkScheduler::new(cx.scheduler, cx.decision.swizzle, cx.units())
    }

    fn jobs<E: Element>(cx: &LaunchContext<'_, E>, sk: &StreamkScheduler, unit: usize)
        -> Vec<TileJob>
    {
        let mut jobs = cx.output_jobs(sk.normal_tasks(unit));
        for seg in sk.segments(unit) {
            let (k_offset, k_len) = sk.k_extent(&seg.k_tiles);
            let full = cx.scheduler.actual_shape_of(seg.coord);
            let slot = cx.workspace.stream_slot(unit, seg.slot, cx.n1());
            jobs.push(TileJob {
                coord: seg.coord,
                shape: BlockShape::new(full.m, full.n, k_len),
                k_offset,
                target: OutputTarget::Workspace(slot),
            });
        }
        jobs
    }

    /// Sum the partials of every stream tile over this unit's row share.
    fn fix_up<E: Element>(cx: &LaunchContext<'_, E>, sk: &StreamkScheduler, unit: usize)
        -> Result<(), Aborted>
    {
        for block in 0..sk.stream_blocks() {
            let coord = sk.coord_of_stream(block);
            let shape = cx.scheduler.actual_shape_of(coord);
            let rows = static_part(shape.m, unit, cx.units());
            if rows.is_empty() {
                continue;
            }
            let contributors = sk.contributors(block);
            for &(peer, _) in &contributors {
                cx.flags.matrix_done.wait(peer, &cx.flags.abort)?;
            }
            let parts: Vec<AccTile> = contributors
                .iter()
                .map(|&(peer, slot)| unsafe {
                    cx.workspace.stream_slot(peer, slot, cx.n1()).offset(rows.start, 0)
                })
                .collect();
            let (row, col) = cx.scheduler.origin(coord);
            cx.epilogue_strips(&parts, row + rows.start, col, rows.len(), shape.n);
        }
        Ok(())
    }
}

impl<E: Element> MatmulKernel<E> for StreamK {
    fn variant(&self) -> KernelVariant { KernelVariant::StreamK }

    fn matrix_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) -> Vec<BlockCoord> {
        let sk = StreamK::scheduler(cx);
        let jobs = StreamK::jobs(cx, &sk, unit);
        cx.finish_matrix(unit, run_matrix_engine(cx, unit, &jobs));
        coords(&jobs)
    }

    fn vector_engine(&self, unit: usize, cx: &LaunchContext<'_, E>) {
        cx.prologue(unit);
        let sk = StreamK::scheduler(cx);
        let jobs = StreamK::jobs(cx, &sk, unit);
        cx.finish_vector(unit, cx.drain_staged(unit, &jobs)
            .and_then(|()| StreamK::fix_up(cx, &sk, unit)));
    }
}

/// The engine programs of `variant`.
pub fn kernel_for<E: Element>(variant: KernelVariant) -> Box<dyn MatmulKernel<E>> {
    match variant {
        KernelVariant::Small => Box::new(Small),
        KernelVariant::Common => Box::new(Common),
        KernelVariant::Padding => Box::new(Padding),
        KernelVariant::SplitK => Box::new(SplitK),
        KernelVariant::StreamK => Box::new(StreamK),
    }
}
