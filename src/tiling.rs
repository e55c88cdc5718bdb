// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tile size and kernel variant selection.
//!
//! Selection runs in two steps. First a base tiling is chosen from a table
//! indexed by the (A, B) layout pair; it balances the number of tiles
//! against the unit count and grows tiles while the memory tiers allow.
//! Then an ordered chain of rules is tried, and the first rule that accepts
//! the problem picks the kernel variant:
//!
//! 1. small: one pass, at most one wave of tiles, no reformatting
//! 2. split-K: K is long and there are too few tiles to occupy the units
//! 3. stream-K: the last wave of tiles would leave many units idle
//! 4. padding: the cost model wants at least one operand reformatted
//! 5. common: everything else
//!
//! The order is the tie-break and must not change.

use core::cmp::{max, min};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::cost::{fit_k1, judge_space, padding_plan, PaddingTag};
use crate::error::{Error, Result};
use crate::memory::WorkspaceLayout;
use crate::platform::{MemoryTier, PlatformCapacities};
use crate::problem::{ElementKind, Layout, OperandId, ProblemShape};
use crate::scheduler::{Swizzle, SwizzleDirection};
use crate::util::{ceil_div, round_up_to};

/// Buffering depth of every pipelined tier.
pub const STAGES: usize = 2;

/// Smallest k0 slice the L0 tier is split into.
const MIN_K0: usize = 16;

/// Swizzle band width used by selected decisions.
const SWIZZLE_OFFSET: usize = 3;

/// An `m x n x k` block; used for nominal tiles and for actual tile shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl BlockShape {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        BlockShape { m, n, k }
    }
}

/// Tile shape per memory tier: the L1 "big" tile and the L0 slice of it
/// that sits next to the matrix engine. `l0.m == l1.m` and `l0.n == l1.n`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub l1: BlockShape,
    pub l0: BlockShape,
}

impl TileShape {
    /// Pick the largest L0 k slice that fits double buffered next to `l1`
    /// and check every tier budget.
    pub fn derive(l1: BlockShape, element: ElementKind, platform: &PlatformCapacities)
        -> Result<TileShape>
    {
        if l1.m == 0 || l1.n == 0 || l1.k == 0 {
            return Err(Error::ZeroTile(l1.m, l1.n));
        }
        let elem = element.size_bytes();
        let fits = |k0: usize| {
            l1.m * k0 * elem * STAGES <= platform.capacity(MemoryTier::L0A)
                && k0 * l1.n * elem * STAGES <= platform.capacity(MemoryTier::L0B)
        };
        let mut k0 = l1.k;
        while !fits(k0) && k0 > MIN_K0 {
            k0 = max(MIN_K0, k0 / 2);
        }
        let tile = TileShape { l1, l0: BlockShape::new(l1.m, l1.n, k0) };
        tile.validate(element, platform)?;
        Ok(tile)
    }

    /// Check the footprint of every tier, double buffered where pipelined.
    pub fn validate(&self, element: ElementKind, platform: &PlatformCapacities) -> Result<()> {
        let elem = element.size_bytes();
        let TileShape { l1, l0 } = *self;
        if l0.m != l1.m || l0.n != l1.n || l0.k == 0 || l0.k > l1.k {
            return Err(Error::InvalidDecision(format!("L0 tile {:?} does not slice L1 tile {:?}",
                                                      l0, l1)));
        }
        platform.check(MemoryTier::L1, (l1.m * l1.k + l1.k * l1.n) * elem * STAGES)?;
        platform.check(MemoryTier::L0A, l0.m * l0.k * elem * STAGES)?;
        platform.check(MemoryTier::L0B, l0.k * l0.n * elem * STAGES)?;
        platform.check(MemoryTier::L0C, l0.m * l0.n * 4)?;
        Ok(())
    }
}

/// Kernel execution strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelVariant {
    Common,
    Small,
    Padding,
    SplitK,
    StreamK,
}

impl KernelVariant {
    /// Serial number stored in the tiling key.
    pub fn serial(self) -> u8 {
        match self {
            KernelVariant::Common => 0,
            KernelVariant::Small => 1,
            KernelVariant::Padding => 2,
            KernelVariant::SplitK => 3,
            KernelVariant::StreamK => 4,
        }
    }
}

/// Packed launch key.
///
/// | bits  | field          |
/// |-------|----------------|
/// | 0-3   | layout C       |
/// | 4-7   | layout B       |
/// | 8-11  | layout A       |
/// | 12-15 | padding C      |
/// | 16-19 | padding B      |
/// | 20-23 | padding A      |
/// | 52-55 | element kind   |
/// | 56-63 | kernel serial  |
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TilingKey(pub u64);

impl TilingKey {
    fn field(self, shift: u32) -> u8 {
        ((self.0 >> shift) & 0xf) as u8
    }

    pub fn kernel_serial(self) -> u8 { (self.0 >> 56) as u8 }
    pub fn dtype(self) -> u8 { self.field(52) }
    pub fn padding_a(self) -> u8 { self.field(20) }
    pub fn padding_b(self) -> u8 { self.field(16) }
    pub fn padding_c(self) -> u8 { self.field(12) }
    pub fn layout_a(self) -> u8 { self.field(8) }
    pub fn layout_b(self) -> u8 { self.field(4) }
    pub fn layout_c(self) -> u8 { self.field(0) }
}

impl fmt::Display for TilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The selector's output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TilingDecision {
    pub(crate) problem: ProblemShape,
    pub(crate) tile: TileShape,
    pub(crate) variant: KernelVariant,
    pub(crate) padding: [PaddingTag; 3],
    pub(crate) split: usize,
    pub(crate) units: usize,
    pub(crate) swizzle: Swizzle,
}

impl TilingDecision {
    /// Build a decision by hand instead of selecting one.
    pub fn builder<'a>(problem: &'a ProblemShape, platform: &'a PlatformCapacities,
                       variant: KernelVariant, l1: BlockShape) -> DecisionBuilder<'a>
    {
        DecisionBuilder {
            problem,
            platform,
            variant,
            l1,
            split: 1,
            padding: [PaddingTag::None; 3],
            swizzle: None,
        }
    }

    pub fn problem(&self) -> &ProblemShape { &self.problem }
    pub fn tile(&self) -> TileShape { self.tile }
    pub fn variant(&self) -> KernelVariant { self.variant }
    pub fn split(&self) -> usize { self.split }
    pub fn units(&self) -> usize { self.units }
    pub fn swizzle(&self) -> Swizzle { self.swizzle }

    pub fn padding(&self, id: OperandId) -> PaddingTag {
        self.padding[id as usize]
    }

    pub fn tiling_key(&self) -> TilingKey {
        let p = &self.problem;
        let value = (self.variant.serial() as u64) << 56
            | (p.element.tag() as u64 & 0xf) << 52
            | (self.padding[0].tag() as u64) << 20
            | (self.padding[1].tag() as u64) << 16
            | (self.padding[2].tag() as u64) << 12
            | (p.a.layout.tag() as u64) << 8
            | (p.b.layout.tag() as u64) << 4
            | p.c.layout.tag() as u64;
        TilingKey(value)
    }

    /// Slow tier scratch space the launch needs, in bytes.
    pub fn workspace_bytes(&self) -> usize {
        WorkspaceLayout::of(self).bytes()
    }
}

impl fmt::Display for TilingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.problem;
        let TileShape { l1, l0 } = self.tile;
        writeln!(f, "{:<10}{:?} (key {})", "variant", self.variant, self.tiling_key())?;
        writeln!(f, "{:<10}m={} n={} k={} {:?}/{:?}/{:?} {:?}", "problem",
                 p.m, p.n, p.k, p.a.layout, p.b.layout, p.c.layout, p.element)?;
        writeln!(f, "{:<10}{} x {} x {}", "L1 tile", l1.m, l1.n, l1.k)?;
        writeln!(f, "{:<10}{} x {} x {}", "L0 tile", l0.m, l0.n, l0.k)?;
        writeln!(f, "{:<10}A={:?} B={:?} C={:?}", "padding",
                 self.padding[0], self.padding[1], self.padding[2])?;
        writeln!(f, "{:<10}{}", "split", self.split)?;
        writeln!(f, "{:<10}{}", "units", self.units)?;
        write!(f, "{:<10}{:?}/{}", "swizzle", self.swizzle.direction, self.swizzle.offset)
    }
}

/// Builder returned by [`TilingDecision::builder`].
pub struct DecisionBuilder<'a> {
    problem: &'a ProblemShape,
    platform: &'a PlatformCapacities,
    variant: KernelVariant,
    l1: BlockShape,
    split: usize,
    padding: [PaddingTag; 3],
    swizzle: Option<Swizzle>,
}

impl DecisionBuilder<'_> {
    pub fn split(mut self, split: usize) -> Self {
        self.split = split;
        self
    }

    pub fn padding(mut self, id: OperandId, tag: PaddingTag) -> Self {
        self.padding[id as usize] = tag;
        self
    }

    pub fn swizzle(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = Some(swizzle);
        self
    }

    pub fn build(self) -> Result<TilingDecision> {
        let DecisionBuilder { problem, platform, variant, l1, split, padding, swizzle } = self;
        platform.validate()?;
        let tile = TileShape::derive(l1, problem.element, platform)?;
        let loops_k = ceil_div(problem.k, l1.k);
        if split == 0 || split > loops_k {
            return Err(Error::InvalidDecision(format!(
                "split factor {} outside 1..={} for k={}", split, loops_k, problem.k)));
        }
        if split > 1 && variant != KernelVariant::SplitK {
            return Err(Error::InvalidDecision(format!("{:?} does not split k", variant)));
        }
        if variant == KernelVariant::Small && problem.k > l1.k {
            return Err(Error::InvalidDecision(format!(
                "Small runs one k tile, k={} exceeds k1={}", problem.k, l1.k)));
        }
        let padded_ab = !(padding[0].is_none() && padding[1].is_none());
        match variant {
            KernelVariant::Small | KernelVariant::Common if padded_ab || !padding[2].is_none() =>
                return Err(Error::InvalidDecision(format!("{:?} does not reformat", variant))),
            KernelVariant::SplitK | KernelVariant::StreamK if !padding[2].is_none() =>
                return Err(Error::InvalidDecision(format!("{:?} does not pad C", variant))),
            _ => {}
        }
        if padding[2] != PaddingTag::None && padding[2] != PaddingTag::SimplePad {
            return Err(Error::InvalidDecision("C only takes simple padding".to_string()));
        }
        let tiles = ceil_div(problem.m, l1.m) * ceil_div(problem.n, l1.n);
        let units = match variant {
            KernelVariant::StreamK => platform.units,
            _ => min(tiles * split, platform.units),
        };
        Ok(TilingDecision {
            problem: *problem,
            tile,
            variant,
            padding,
            split,
            units,
            swizzle: swizzle.unwrap_or_else(|| default_swizzle(problem)),
        })
    }
}

fn default_swizzle(problem: &ProblemShape) -> Swizzle {
    let direction = if problem.m > problem.n {
        SwizzleDirection::Zn
    } else {
        SwizzleDirection::Nz
    };
    Swizzle { offset: SWIZZLE_OFFSET, direction }
}

/// Selects tiles and a kernel variant for a problem.
#[derive(Clone, Debug)]
pub struct TilingSelector<'a> {
    platform: &'a PlatformCapacities,
    calibration: &'a Calibration,
}

impl<'a> TilingSelector<'a> {
    pub fn new(platform: &'a PlatformCapacities, calibration: &'a Calibration) -> Self {
        TilingSelector { platform, calibration }
    }

    /// Choose a [`TilingDecision`] for `problem`.
    ///
    /// Pure: equal inputs give equal decisions.
    pub fn select(&self, problem: &ProblemShape) -> Result<TilingDecision> {
        self.platform.validate()?;
        self.calibration.validate()?;
        let tiler = Tiler::new(problem, self.platform, self.calibration);
        let l1 = tiler.base_tiling()?;

        let mut state = SelectionState {
            tiler,
            l1,
            split: 1,
            padding: [PaddingTag::None; 3],
            units: 0,
        };
        let mut chosen = KernelVariant::Common;
        for &(variant, rule) in RULES {
            if rule(&mut state) {
                chosen = variant;
                break;
            }
        }

        let tile = TileShape::derive(state.l1, problem.element, self.platform)?;
        let decision = TilingDecision {
            problem: *problem,
            tile,
            variant: chosen,
            padding: state.padding,
            split: state.split,
            units: max(1, state.units),
            swizzle: default_swizzle(problem),
        };
        log::debug!("selected {:?} for m={} n={} k={}: tile {:?}, split {}, units {}, key {}",
                    decision.variant, problem.m, problem.n, problem.k,
                    decision.tile.l1, decision.split, decision.units, decision.tiling_key());
        Ok(decision)
    }
}

struct SelectionState<'a> {
    tiler: Tiler<'a>,
    l1: BlockShape,
    split: usize,
    padding: [PaddingTag; 3],
    units: usize,
}

type Rule = fn(&mut SelectionState<'_>) -> bool;

/// Rules in priority order; the first that accepts wins.
const RULES: &[(KernelVariant, Rule)] = &[
    (KernelVariant::Small, small_rule),
    (KernelVariant::SplitK, split_k_rule),
    (KernelVariant::StreamK, stream_k_rule),
    (KernelVariant::Padding, padding_rule),
    (KernelVariant::Common, common_rule),
];

fn small_rule(s: &mut SelectionState<'_>) -> bool {
    let t = &s.tiler;
    let plan = padding_plan(t.problem, s.l1, 1, t.platform, t.cal);
    s.padding = [plan.a, plan.b, plan.c];
    s.units = plan.units;
    let tiles = ceil_div(t.m, s.l1.m) * ceil_div(t.n, s.l1.n);
    if !plan.any() && tiles <= t.units && t.k <= s.l1.k {
        s.units = tiles;
        return true;
    }
    false
}

fn split_k_rule(s: &mut SelectionState<'_>) -> bool {
    let t = &s.tiler;
    let sc = &t.cal.split_k;
    let (m1, n1) = t.reduction_tile(sc.tile);
    let blocks = ceil_div(t.m, m1) * ceil_div(t.n, n1);
    let eligible = (blocks <= t.units / 2 && t.k > sc.half_units_min_k)
        || (blocks <= sc.few_blocks && t.k > sc.few_blocks_min_k);
    if !eligible {
        return false;
    }
    let k1 = match fit_k1(m1, n1, sc.tile[2], t.elem, t.platform, t.cal) {
        Some(k1) => k1,
        None => return false,
    };
    let split = min(t.units / blocks, sc.max_split(t.k, t.units));
    let split = min(split, ceil_div(t.k, k1));
    if split < 2 {
        return false;
    }
    let l1 = BlockShape::new(m1, n1, k1);
    let plan = padding_plan(t.problem, l1, split, t.platform, t.cal);
    s.l1 = l1;
    s.split = split;
    s.padding = [plan.a, plan.b, PaddingTag::None];
    s.units = plan.units;
    true
}

fn stream_k_rule(s: &mut SelectionState<'_>) -> bool {
    let t = &s.tiler;
    let sc = &t.cal.stream_k;
    let (m1, n1) = t.reduction_tile(sc.tile);
    let blocks = ceil_div(t.m, m1) * ceil_div(t.n, n1);
    let tail = blocks % t.units;
    let eligible = blocks > t.units
        && blocks < sc.max_waves * t.units
        && tail > 0
        && (tail as f64) < sc.max_tail_fraction * t.units as f64
        && t.k > sc.min_k;
    if !eligible {
        return false;
    }
    let k1 = match fit_k1(m1, n1, sc.tile[2], t.elem, t.platform, t.cal) {
        Some(k1) => k1,
        None => return false,
    };
    let l1 = BlockShape::new(m1, n1, k1);
    let plan = padding_plan(t.problem, l1, 1, t.platform, t.cal);
    s.l1 = l1;
    s.padding = [plan.a, plan.b, PaddingTag::None];
    s.units = t.units;
    true
}

fn padding_rule(s: &mut SelectionState<'_>) -> bool {
    s.padding.iter().any(|tag| !tag.is_none())
}

fn common_rule(s: &mut SelectionState<'_>) -> bool {
    let t = &s.tiler;
    s.padding = [PaddingTag::None; 3];
    s.units = min(ceil_div(t.m, s.l1.m) * ceil_div(t.n, s.l1.n), t.units);
    true
}

/// Base tiling by layout pair.
struct Tiler<'a> {
    problem: &'a ProblemShape,
    platform: &'a PlatformCapacities,
    cal: &'a Calibration,
    m: usize,
    n: usize,
    k: usize,
    units: usize,
    elem: usize,
    align: usize,
}

impl<'a> Tiler<'a> {
    fn new(problem: &'a ProblemShape, platform: &'a PlatformCapacities, cal: &'a Calibration)
        -> Self
    {
        Tiler {
            problem,
            platform,
            cal,
            m: problem.m,
            n: problem.n,
            k: problem.k,
            units: platform.units,
            elem: problem.element.size_bytes(),
            align: cal.tiling.align,
        }
    }

    fn blocks(&self, m1: usize, n1: usize) -> usize {
        ceil_div(self.m, m1) * ceil_div(self.n, n1)
    }

    fn wave_limit(&self, m1: usize, n1: usize) -> usize {
        round_up_to(self.blocks(m1, n1), self.units)
    }

    fn fits(&self, m1: usize, n1: usize, k1: usize) -> bool {
        judge_space(m1, n1, k1, self.elem, self.platform)
    }

    fn ratio(&self) -> f64 {
        let (m, n, k) = (self.m as f64, self.n as f64, self.k as f64);
        (m * k + k * n) / (m * n)
    }

    /// Tile used by the split-K and stream-K rules.
    fn reduction_tile(&self, tile: [usize; 3]) -> (usize, usize) {
        let (la, lb) = (self.problem.a.layout, self.problem.b.layout);
        let transposed = la == Layout::ColumnMajor
            && (lb == Layout::ColumnMajor || self.m > self.n);
        if transposed {
            (tile[1], tile[0])
        } else {
            (tile[0], tile[1])
        }
    }

    /// Shrink `x1` by one alignment unit while the tile count stays within
    /// the waves the current tile already needs, then clamp both tiles to
    /// the padded problem.
    fn balance(&self, x: usize, y: usize, x1: &mut usize, y1: &mut usize, threshold: usize) {
        let align = self.align;
        let waves = round_up_to(ceil_div(x, *x1) * ceil_div(y, *y1), self.units);
        while *x1 > threshold && ceil_div(x, *x1 - align) * ceil_div(y, *y1) <= waves {
            *x1 -= align;
        }
        if x < *x1 {
            *x1 = round_up_to(x, align);
        }
        if y < *y1 {
            *y1 = round_up_to(y, align);
        }
    }

    fn base_tiling(&self) -> Result<BlockShape> {
        let (m1, n1) = match (self.problem.a.layout, self.problem.b.layout) {
            (Layout::RowMajor, Layout::RowMajor) => self.tiling_row_row(),
            (Layout::RowMajor, Layout::ColumnMajor) => self.tiling_row_col(),
            (Layout::ColumnMajor, Layout::RowMajor) => self.tiling_col_row(),
            (Layout::ColumnMajor, Layout::ColumnMajor) => self.tiling_col_col(),
        };
        match fit_k1(m1, n1, usize::MAX, self.elem, self.platform, self.cal) {
            Some(k1) => Ok(BlockShape::new(m1, n1, k1)),
            None => {
                let k1 = self.cal.tiling.k1_candidates.iter().cloned().min().unwrap_or(self.align);
                let need = (m1 * k1 + k1 * n1) * self.elem * STAGES;
                let l1 = self.platform.capacity(MemoryTier::L1);
                if need > l1 {
                    Err(Error::CapacityExceeded { tier: MemoryTier::L1, need, have: l1 })
                } else {
                    Err(Error::CapacityExceeded {
                        tier: MemoryTier::L0C,
                        need: m1 * n1 * 4,
                        have: self.platform.capacity(MemoryTier::L0C),
                    })
                }
            }
        }
    }

    fn tiling_row_row(&self) -> (usize, usize) {
        let tc = &self.cal.tiling;
        let (m, n, k, units, align) = (self.m, self.n, self.k, self.units, self.align);
        let (mut m1, mut n1, k1) = (128, 256, 256);
        if n >= 256 {
            let limit = self.wave_limit(m1, n1);
            self.balance(m, n, &mut m1, &mut n1, tc.balance_threshold);
            let wide = ceil_div(m, 64) * ceil_div(n, 512);
            if wide < limit.saturating_sub(units) && k <= tc.wide_tile_max_k {
                m1 = 64;
                n1 = 512;
            }
        } else {
            m1 = 128;
            n1 = round_up_to(n, align);
            self.balance(m, n, &mut m1, &mut n1, tc.balance_threshold);
            let limit = self.wave_limit(m1, n1).saturating_sub(units);
            let mut m1t = m1;
            while self.fits(m1t + align, n1, k1) {
                m1t += align;
                if self.blocks(m1t, n1) <= limit {
                    m1 = m1t;
                }
            }
        }
        if k >= tc.huge_extent || n > tc.huge_extent {
            m1 = 128;
            n1 = 256;
        }
        (m1, n1)
    }

    fn tiling_row_col(&self) -> (usize, usize) {
        let tc = &self.cal.tiling;
        let (m, n, k, units, align) = (self.m, self.n, self.k, self.units, self.align);
        let (mut m1, mut n1, k1) = (128, 256, 256);
        let threshold = tc.balance_threshold_mixed;
        let ratio = self.ratio();
        if m > n && (ratio > tc.write_bound_ratio || n < 256) {
            m1 = 256;
            n1 = 128;
            self.balance(m, n, &mut m1, &mut n1, threshold);
            self.balance(n, m, &mut n1, &mut m1, threshold);
        } else {
            self.balance(n, m, &mut n1, &mut m1, threshold);
            self.balance(m, n, &mut m1, &mut n1, threshold);
        }
        let limit = self.wave_limit(m1, n1).saturating_sub(units);
        if m < n {
            let mut n1t = n1;
            while self.fits(m1, n1t + align, k1) {
                n1t += align;
                if self.blocks(m1, n1t) <= limit {
                    n1 = n1t;
                }
            }
        } else {
            let mut m1t = m1;
            while self.fits(m1t + align, n1, k1) {
                m1t += align;
                if self.blocks(m1t, n1) <= limit {
                    m1 = m1t;
                }
            }
        }
        if k > tc.huge_extent {
            if m < n || (ratio < tc.write_bound_ratio && n >= 256) {
                m1 = 128;
                n1 = 256;
            } else {
                m1 = 256;
                n1 = 128;
            }
        }
        (m1, n1)
    }

    fn tiling_col_row(&self) -> (usize, usize) {
        let tc = &self.cal.tiling;
        let (m, n, units, align) = (self.m, self.n, self.units, self.align);
        let (mut m1, mut n1) = (128, 256);
        let ratio = self.ratio();
        if m > n && (ratio > tc.write_bound_ratio || n < 256) {
            m1 = 256;
            n1 = 128;
        }
        if m < m1 {
            m1 = round_up_to(m, align);
        }
        if n < n1 {
            n1 = round_up_to(n, align);
        }
        let blocks = self.blocks(m1, n1);
        if blocks <= units / 4 {
            if n1 > align {
                n1 /= 2;
            }
            if m1 > align {
                m1 /= 2;
            }
        } else if blocks <= units / 2 {
            if m1 > n1 {
                m1 /= 2;
            } else if n1 > align {
                n1 /= 2;
            }
        }
        if n >= tc.huge_extent || m >= tc.huge_extent {
            if m < n || (ratio < tc.write_bound_ratio && n >= 256) {
                m1 = 128;
                n1 = 256;
            } else {
                m1 = 256;
                n1 = 128;
            }
        }
        (m1, n1)
    }

    fn tiling_col_col(&self) -> (usize, usize) {
        let tc = &self.cal.tiling;
        let (m, n, k, units, align) = (self.m, self.n, self.k, self.units, self.align);
        let (mut m1, mut n1, k1) = (256, 128, 256);
        if m >= 256 {
            let limit = self.wave_limit(m1, n1);
            self.balance(n, m, &mut n1, &mut m1, tc.balance_threshold);
            let wide = ceil_div(n, 64) * ceil_div(m, 512);
            if wide < limit.saturating_sub(units) && k <= tc.wide_tile_max_k {
                n1 = 64;
                m1 = 512;
            }
        } else {
            n1 = 128;
            m1 = round_up_to(m, align);
            self.balance(n, m, &mut n1, &mut m1, tc.balance_threshold);
            let limit = self.wave_limit(m1, n1).saturating_sub(units);
            let mut n1t = n1;
            while self.fits(n1t + align, m1, k1) {
                n1t += align;
                if self.blocks(m1, n1t) <= limit {
                    n1 = n1t;
                }
            }
        }
        if k >= tc.huge_extent || m > tc.huge_extent {
            m1 = 256;
            n1 = 128;
        }
        // write bound
        if self.ratio() < tc.write_bound_ratio && n >= 256 {
            m1 = 128;
            n1 = 256;
        }
        (m1, n1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(m: usize, n: usize, k: usize) -> ProblemShape {
        ProblemShape::builder(m, n, k).build().unwrap()
    }

    #[test]
    fn derive_splits_k_for_l0() {
        let plat = PlatformCapacities::reference();
        let t = TileShape::derive(BlockShape::new(128, 256, 256), ElementKind::F16, &plat).unwrap();
        // 128 * k0 * 2 * 2 <= 64K and k0 * 256 * 2 * 2 <= 64K
        assert_eq!(t.l0, BlockShape::new(128, 256, 64));
        let t = TileShape::derive(BlockShape::new(128, 256, 128), ElementKind::F32, &plat).unwrap();
        assert_eq!(t.l0.k, 32);
    }

    #[test]
    fn derive_rejects_oversized_tiles() {
        let plat = PlatformCapacities::reference();
        let err = TileShape::derive(BlockShape::new(128, 256, 1024), ElementKind::F16, &plat);
        assert!(matches!(err, Err(Error::CapacityExceeded { tier: MemoryTier::L1, .. })));
        let err = TileShape::derive(BlockShape::new(256, 256, 256), ElementKind::F16, &plat);
        assert!(matches!(err, Err(Error::CapacityExceeded { tier: MemoryTier::L0C, .. })));
        let err = TileShape::derive(BlockShape::new(0, 256, 256), ElementKind::F16, &plat);
        assert!(matches!(err, Err(Error::ZeroTile(0, 256))));
    }

    #[test]
    fn tiling_key_fields() {
        let plat = PlatformCapacities::reference();
        let p = ProblemShape::builder(512, 512, 512)
            .layouts(Layout::ColumnMajor, Layout::RowMajor, Layout::RowMajor)
            .build().unwrap();
        let d = TilingDecision::builder(&p, &plat, KernelVariant::Padding, BlockShape::new(128, 128, 128))
            .padding(OperandId::A, PaddingTag::FractalPad)
            .build().unwrap();
        let key = d.tiling_key();
        assert_eq!(key.kernel_serial(), 2);
        assert_eq!(key.padding_a(), 3);
        assert_eq!(key.padding_b(), 0);
        assert_eq!(key.layout_a(), 1);
        assert_eq!(key.layout_b(), 0);
        assert_eq!(key.to_string(), "0x0200000000300100");
        assert_eq!(key.0, (2u64 << 56) | (3 << 20) | (1 << 8));
    }

    #[test]
    fn builder_validates() {
        let plat = PlatformCapacities::reference();
        let p = problem(256, 256, 1024);
        let tile = BlockShape::new(128, 128, 256);
        assert!(TilingDecision::builder(&p, &plat, KernelVariant::Common, tile).split(2).build().is_err());
        assert!(TilingDecision::builder(&p, &plat, KernelVariant::SplitK, tile).split(5).build().is_err());
        assert!(TilingDecision::builder(&p, &plat, KernelVariant::Small, tile)
                .padding(OperandId::B, PaddingTag::FractalPad).build().is_err());
        let d = TilingDecision::builder(&p, &plat, KernelVariant::SplitK, tile).split(4).build().unwrap();
        assert_eq!(d.units(), 16);
        let d = TilingDecision::builder(&p, &plat.clone().with_units(0), KernelVariant::SplitK, tile).build();
        assert!(matches!(d, Err(Error::NoUnits)));
    }

    #[test]
    fn balance_shrinks_within_wave() {
        let plat = PlatformCapacities::reference().with_units(20);
        let cal = Calibration::default();
        let p = problem(1000, 1000, 64);
        let t = Tiler::new(&p, &plat, &cal);
        let (mut m1, mut n1) = (128, 256);
        // 8 x 4 = 32 tiles -> two waves of 20; shrinking m1 may add tiles up to 40
        t.balance(1000, 1000, &mut m1, &mut n1, 32);
        assert!(t.blocks(m1, n1) <= 40);
        assert!(ceil_div(1000, m1 - 16) * ceil_div(1000, n1) > 40 || m1 <= 32);
        assert_eq!(m1 % 16, 0);
    }

    #[test]
    fn balance_fills_single_wave() {
        let plat = PlatformCapacities::reference().with_units(20);
        let cal = Calibration::default();
        let p = problem(1000, 512, 64);
        let t = Tiler::new(&p, &plat, &cal);
        // 8 x 2 = 16 tiles leave 4 units idle; 112 rows give 18, 96 would give 22
        assert_eq!(t.tiling_row_row(), (112, 256));
        assert_eq!(t.blocks(112, 256), 18);

        let p = problem(128, 128, 128);
        let t = Tiler::new(&p, &plat, &cal);
        let (mut m1, mut n1) = (128, 128);
        t.balance(128, 128, &mut m1, &mut n1, 32);
        assert_eq!((m1, n1), (32, 128));
    }

    #[test]
    fn display_mentions_variant() {
        let plat = PlatformCapacities::reference().with_units(20);
        let cal = Calibration::default();
        let d = TilingSelector::new(&plat, &cal).select(&problem(128, 128, 128)).unwrap();
        let text = d.to_string();
        assert_eq!(d.variant(), KernelVariant::Small);
        // balanced down to four 32 x 128 tiles, one per unit
        assert_eq!((d.tile().l1.m, d.tile().l1.n), (32, 128));
        assert_eq!(d.units(), 4);
        assert!(text.contains("Small"));
        assert!(text.contains("L1 tile"));
    }
}
