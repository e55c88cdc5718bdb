// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bandwidth cost model.
//!
//! Estimates how fast the matrix engine can stream an operand in its
//! original layout versus after a reformat pass on the vector engine, and
//! decides which operands are worth reformatting. All times are in
//! microseconds and only meaningful relative to each other.

use core::cmp::{max, min};

use serde::{Deserialize, Serialize};

use crate::calibration::{BandwidthFit, Calibration};
use crate::platform::{MemoryTier, PlatformCapacities};
use crate::problem::{Layout, OperandId, ProblemShape};
use crate::tiling::BlockShape;
use crate::util::{ceil_div, round_up_to};

/// How an operand is rewritten before the main pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaddingTag {
    None,
    /// Same layout, leading dimension rounded up to the alignment unit.
    SimplePad,
    /// Stored as consecutive tile-sized blocks.
    BlockPad,
    /// Stored as 16 x 16 fractals, fractal columns outermost.
    FractalPad,
}

impl PaddingTag {
    pub fn tag(self) -> u8 {
        match self {
            PaddingTag::None => 0,
            PaddingTag::SimplePad => 1,
            PaddingTag::BlockPad => 2,
            PaddingTag::FractalPad => 3,
        }
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == PaddingTag::None
    }
}

impl Default for PaddingTag {
    fn default() -> Self { PaddingTag::None }
}

fn horner(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0., |acc, &c| acc * x + c)
}

/// Achieved bandwidth of moving `n_value` rows of `d_value` contiguous
/// elements out of a matrix whose logical inner extent is `src_d`.
pub fn bandwidth(fit: &BandwidthFit, n_value: usize, d_value: usize, src_d: usize) -> f64 {
    let mut band = horner(&fit.poly, d_value as f64);

    if d_value == src_d && d_value <= fit.full_row_max && d_value % fit.full_row_align == 0 {
        band = fit.full_row;
    }
    if src_d >= fit.collapse_stride {
        band = fit.collapse;
    }
    if let Some(&(_, factor)) = fit.alignment_bonus.iter().find(|&&(align, _)| src_d % align == 0) {
        band *= factor;
    }
    band = band.min(fit.cap);

    if let Some(short) = fit.short_outer.iter().find(|s| d_value % s.align == 0) {
        if n_value < short.below {
            band *= horner(&short.coeffs, n_value as f64);
        }
    }
    band
}

/// Padding decision for all three operands plus the unit count to launch.
#[derive(Clone, Debug, PartialEq)]
pub struct PaddingPlan {
    pub a: PaddingTag,
    pub b: PaddingTag,
    pub c: PaddingTag,
    pub units: usize,
    /// Estimated time of: no reformat, B only, A only, both.
    pub times: [f64; 4],
}

impl PaddingPlan {
    pub fn any(&self) -> bool {
        !(self.a.is_none() && self.b.is_none() && self.c.is_none())
    }
}

/// Per worker bytes and task count of reformatting an operand in strips.
fn reformat_load(cal: &Calibration, inner: usize, outer: usize, elem: usize,
                 units: usize) -> (f64, usize)
{
    let pad = &cal.padding;
    let mut rows = pad.strip_rows;
    let mut cols = pad.strip_bytes / elem / rows;
    if inner < cols {
        cols = inner;
    }
    if outer < rows {
        rows = outer;
    }
    cols = round_up_to(inner / ceil_div(inner, cols), pad.strip_align);
    let tasks = ceil_div(outer, rows) * ceil_div(inner, cols);
    let per_worker = ceil_div(tasks, units.saturating_mul(pad.reformat_workers_per_unit));
    (per_worker as f64 * (cols * rows * elem) as f64, tasks)
}

/// Byte count as `f64`; cost terms of large problems do not fit `usize`.
fn operand_bytes(rows: usize, cols: usize, elem: usize) -> f64 {
    rows as f64 * cols as f64 * elem as f64
}

struct OperandCost {
    before: f64,
    reformat_bw: f64,
    matrix_bytes: f64,
    reformat_bytes: f64,
    reformat_tasks: usize,
    inner: usize,
    outer: usize,
}

/// Run the reformat cost comparison for tile `tile` and split factor `split`.
pub fn padding_plan(problem: &ProblemShape, tile: BlockShape, split: usize,
                    platform: &PlatformCapacities, cal: &Calibration) -> PaddingPlan
{
    let (m, n, k) = (problem.m, problem.n, problem.k);
    let elem = problem.element.size_bytes();
    let units = platform.units;
    let pad = &cal.padding;

    let tiles_m = ceil_div(m, tile.m);
    let tiles_n = ceil_div(n, tile.n);
    let tasks = tiles_m * tiles_n * split;
    let matrix_units = min(tasks, units);
    let rounds = ceil_div(tasks, units);
    let k_per_slice = ceil_div(k, split);

    let operand = |id: OperandId, tiles_outer: usize, tile_outer: usize, outer_dim: usize| {
        let (inner, outer) = problem.inner_outer(id);
        let k_inner = match id {
            OperandId::B => problem.b.layout == Layout::ColumnMajor,
            _ => problem.a.layout == Layout::RowMajor,
        };
        // rows moved per copy and contiguous elements per row
        let (rows_moved, row_len) = if k_inner {
            (min(outer_dim, tile_outer), min(k, tile.k))
        } else {
            (min(k, tile.k), min(outer_dim, tile_outer))
        };
        let mut before = bandwidth(&cal.bandwidth, rows_moved, row_len, inner);
        if tiles_outer < matrix_units / 2 && k <= tile.k && tiles_outer <= 2 {
            before /= (matrix_units / tiles_outer) as f64 * pad.few_tiles_penalty;
        }
        let l2 = platform.capacity(MemoryTier::L2) as f64;
        let reformat_bw = if operand_bytes(inner, outer, elem) > l2 {
            pad.reformat_bandwidth_cold
        } else {
            pad.reformat_bandwidth
        };
        let (reformat_bytes, reformat_tasks) = reformat_load(cal, inner, outer, elem, units);
        OperandCost {
            before,
            reformat_bw,
            matrix_bytes: rounds as f64
                * operand_bytes(min(outer_dim, tile_outer), k_per_slice, elem),
            reformat_bytes,
            reformat_tasks,
            inner,
            outer,
        }
    };
    let ca = operand(OperandId::A, tiles_m, tile.m, m);
    let cb = operand(OperandId::B, tiles_n, tile.n, n);

    let reformat_tasks = max(ca.reformat_tasks, cb.reformat_tasks);
    let reformat_units = min(ceil_div(reformat_tasks, pad.reformat_workers_per_unit), units);
    let launch_units = if ca.inner > pad.wide_inner && cb.inner > pad.wide_inner {
        max(matrix_units, reformat_units)
    } else {
        matrix_units
    };

    let after = pad.padded_bandwidth;
    let head = pad.head_cost_base + pad.head_cost_per_unit * launch_units as f64 / units as f64;
    let load = |bytes: f64, bw: f64| bytes / bw / 1000.;
    let t00 = load(ca.matrix_bytes, ca.before) + load(cb.matrix_bytes, cb.before);
    let t01 = load(ca.matrix_bytes, ca.before) + load(cb.matrix_bytes, after)
        + load(cb.reformat_bytes, cb.reformat_bw) + head;
    let t10 = load(ca.matrix_bytes, after) + load(cb.matrix_bytes, cb.before)
        + load(ca.reformat_bytes, ca.reformat_bw) + head;
    let t11 = load(ca.matrix_bytes, after) + load(cb.matrix_bytes, after)
        + load(ca.reformat_bytes, ca.reformat_bw) + load(cb.reformat_bytes, cb.reformat_bw)
        + head + pad.both_padded_extra;

    let options = [
        (t00, PaddingTag::None, PaddingTag::None),
        (t01, PaddingTag::None, PaddingTag::FractalPad),
        (t10, PaddingTag::FractalPad, PaddingTag::None),
        (t11, PaddingTag::FractalPad, PaddingTag::FractalPad),
    ];
    let mut best = f64::MAX;
    let (mut tag_a, mut tag_b) = (PaddingTag::None, PaddingTag::None);
    for &(t, a, b) in &options {
        if t < best {
            best = t;
            tag_a = a;
            tag_b = b;
        }
    }

    if forced_reformat(cal, ca.inner, ca.outer) {
        tag_a = PaddingTag::FractalPad;
    }
    if forced_reformat(cal, cb.inner, cb.outer) {
        tag_b = PaddingTag::FractalPad;
    }

    PaddingPlan {
        a: tag_a,
        b: tag_b,
        c: padding_tag_c(problem, tile, platform, cal),
        units: launch_units,
        times: [t00, t01, t10, t11],
    }
}

/// Tiny or unaligned inner axes on tall operands are always reformatted;
/// the polynomial fit does not see that access pattern.
pub fn forced_reformat(cal: &Calibration, inner: usize, outer: usize) -> bool {
    let pad = &cal.padding;
    let unaligned = inner < pad.override_tiny_inner
        || (inner < pad.override_small_inner && inner % pad.override_align != 0);
    unaligned && outer > pad.override_min_outer
}

fn padding_tag_c(problem: &ProblemShape, tile: BlockShape, platform: &PlatformCapacities,
                 cal: &Calibration) -> PaddingTag
{
    let pad = &cal.padding;
    let (m, n, k) = (problem.m, problem.n, problem.k);
    let elem = problem.element.size_bytes();
    let (inner, _) = problem.inner_outer(OperandId::C);
    if m * n > pad.c_min_elements && inner > pad.c_min_n && inner % pad.c_align != 0 {
        let total = operand_bytes(m, k, elem) * ceil_div(n, tile.n) as f64
            + operand_bytes(k, n, elem) * ceil_div(m, tile.m) as f64
            + operand_bytes(m, n, elem);
        if total < (platform.capacity(MemoryTier::L2) / 2) as f64 {
            return PaddingTag::SimplePad;
        }
    }
    PaddingTag::None
}

/// Whether an `m1 x n1 x k1` tile fits L1 double buffered and L0C.
pub fn judge_space(m1: usize, n1: usize, k1: usize, elem: usize,
                   platform: &PlatformCapacities) -> bool
{
    let l1 = m1 * k1 * 2 * elem + k1 * n1 * 2 * elem <= platform.capacity(MemoryTier::L1);
    let l0c = m1 * n1 * 4 <= platform.capacity(MemoryTier::L0C);
    l1 && l0c
}

/// Largest calibrated k1 not above `preferred` that fits with `m1 x n1`.
pub fn fit_k1(m1: usize, n1: usize, preferred: usize, elem: usize,
              platform: &PlatformCapacities, cal: &Calibration) -> Option<usize>
{
    cal.tiling.k1_candidates.iter()
        .cloned()
        .filter(|&k1| k1 <= preferred)
        .find(|&k1| judge_space(m1, n1, k1, elem, platform))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit() -> BandwidthFit { BandwidthFit::default() }

    #[test]
    fn full_aligned_rows_are_fast() {
        // fixed 60 for a whole aligned row, bonus for 128 alignment, then the cap
        let bw = bandwidth(&fit(), 128, 128, 128);
        assert!((bw - 80.).abs() < 1e-9);
        let bw = bandwidth(&fit(), 128, 112, 112);
        assert!((bw - 60. * 40. / 30.).abs() < 1e-9);
    }

    #[test]
    fn huge_strides_collapse() {
        let aligned = bandwidth(&fit(), 128, 256, 4096);
        let huge = bandwidth(&fit(), 128, 256, 65536 * 2);
        assert!((aligned - 80.).abs() < 1e-9);
        assert!((huge - 100. / 30.).abs() < 1e-9);
    }

    #[test]
    fn bandwidth_is_capped() {
        for &d in &[16, 64, 256, 512, 1024] {
            assert!(bandwidth(&fit(), 128, d, 4096) <= 80.);
        }
    }

    #[test]
    fn short_outer_is_penalized() {
        let long = bandwidth(&fit(), 128, 256, 4096);
        let short = bandwidth(&fit(), 4, 256, 4096);
        assert!(short < long);
    }

    #[test]
    fn tiny_inner_forces_fractal() {
        let cal = Calibration::default();
        assert!(forced_reformat(&cal, 7, 4096));
        assert!(forced_reformat(&cal, 17, 4096));
        assert!(!forced_reformat(&cal, 16, 4096));
        assert!(!forced_reformat(&cal, 7, 512));
    }

    #[test]
    fn plan_overrides_cost() {
        let p = ProblemShape::builder(4096, 4096, 7)
            .layouts(Layout::RowMajor, Layout::RowMajor, Layout::RowMajor)
            .build().unwrap();
        let plan = padding_plan(&p, BlockShape::new(128, 256, 256), 1,
                                &PlatformCapacities::reference(), &Calibration::default());
        assert_eq!(plan.a, PaddingTag::FractalPad);
        assert!(plan.any());
    }

    #[test]
    fn space_and_k1() {
        let plat = PlatformCapacities::reference();
        let cal = Calibration::default();
        assert!(judge_space(128, 256, 256, 2, &plat));
        assert!(!judge_space(128, 256, 512, 2, &plat));
        assert_eq!(fit_k1(128, 256, usize::MAX, 2, &plat, &cal), Some(256));
        assert_eq!(fit_k1(128, 256, 256, 4, &plat, &cal), Some(128));
        assert_eq!(fit_k1(512, 512, usize::MAX, 2, &plat, &cal), None);
    }
}
