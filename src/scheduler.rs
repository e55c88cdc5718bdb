// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task to tile mapping.
//!
//! A task index is turned into a tile coordinate through a swizzle: tiles
//! are visited in bands `offset` tiles wide, and every other band is walked
//! backwards, so neighbouring tasks share rows of A or columns of B.

use core::cmp::min;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::problem::ProblemShape;
use crate::tiling::{BlockShape, TilingDecision};
use crate::util::ceil_div;

/// Band orientation of the swizzle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwizzleDirection {
    /// Bands of `offset` tile rows, walked along the columns.
    Zn,
    /// Bands of `offset` tile columns, walked along the rows.
    Nz,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Swizzle {
    pub offset: usize,
    pub direction: SwizzleDirection,
}

/// Tile row, tile column and reduction slice of one task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockCoord {
    pub row: usize,
    pub col: usize,
    pub split: usize,
}

impl BlockCoord {
    pub fn new(row: usize, col: usize, split: usize) -> Self {
        BlockCoord { row, col, split }
    }
}

/// Maps task indices onto tile coordinates and actual tile shapes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockScheduler {
    m: usize,
    n: usize,
    k: usize,
    tile: BlockShape,
    loops_m: usize,
    loops_n: usize,
    loops_k: usize,
    split: usize,
}

impl BlockScheduler {
    pub fn new(problem: &ProblemShape, tile: BlockShape, split: usize) -> Result<Self> {
        if tile.m == 0 || tile.n == 0 || tile.k == 0 {
            return Err(Error::ZeroTile(tile.m, tile.n));
        }
        let loops_k = ceil_div(problem.k, tile.k);
        if split == 0 || split > loops_k {
            return Err(Error::InvalidDecision(format!(
                "split factor {} outside 1..={}", split, loops_k)));
        }
        Ok(BlockScheduler {
            m: problem.m,
            n: problem.n,
            k: problem.k,
            tile,
            loops_m: ceil_div(problem.m, tile.m),
            loops_n: ceil_div(problem.n, tile.n),
            loops_k,
            split,
        })
    }

    /// Scheduler of a validated decision.
    pub fn of(decision: &TilingDecision) -> Self {
        let tile = decision.tile.l1;
        let p = &decision.problem;
        BlockScheduler {
            m: p.m,
            n: p.n,
            k: p.k,
            tile,
            loops_m: ceil_div(p.m, tile.m),
            loops_n: ceil_div(p.n, tile.n),
            loops_k: ceil_div(p.k, tile.k),
            split: decision.split,
        }
    }

    /// `ceil(m / m1) * ceil(n / n1) * split`.
    #[inline]
    pub fn total_tasks(&self) -> usize {
        self.tiles() * self.split
    }

    /// Output tiles, ignoring the split.
    #[inline]
    pub fn tiles(&self) -> usize {
        self.loops_m * self.loops_n
    }

    /// `(tile rows, tile columns, k tiles)`
    pub fn loops(&self) -> (usize, usize, usize) {
        (self.loops_m, self.loops_n, self.loops_k)
    }

    pub fn tile(&self) -> BlockShape {
        self.tile
    }

    /// Coordinate of `task`.
    ///
    /// ***Panics*** if `task >= self.total_tasks()`.
    pub fn coord_of(&self, task: usize, swizzle: Swizzle) -> BlockCoord {
        assert!(task < self.total_tasks(),
                "task {} out of range for {} tasks", task, self.total_tasks());
        let tiles = self.tiles();
        let split = task / tiles;
        let (row, col) = swizzle_coord(task % tiles, self.loops_m, self.loops_n, swizzle);
        BlockCoord { row, col, split }
    }

    /// Element offset and length of reduction slice `slice` along k.
    pub fn k_range(&self, slice: usize) -> (usize, usize) {
        debug_assert!(slice < self.split);
        if self.split == 1 {
            return (0, self.k);
        }
        let per = self.loops_k / self.split;
        let rem = self.loops_k % self.split;
        let (start, len) = if slice < rem {
            ((per + 1) * slice, per + 1)
        } else {
            (slice * per + rem, per)
        };
        let offset = start * self.tile.k;
        let len = if slice == self.split - 1 {
            self.k - offset
        } else {
            len * self.tile.k
        };
        (offset, len)
    }

    /// Shape of the tile at `coord`, truncated at the problem edge.
    pub fn actual_shape_of(&self, coord: BlockCoord) -> BlockShape {
        let m = edge(self.m, self.tile.m, coord.row, self.loops_m);
        let n = edge(self.n, self.tile.n, coord.col, self.loops_n);
        let (_, k) = self.k_range(coord.split);
        BlockShape::new(m, n, k)
    }

    /// Element offsets of the top left corner of `coord` in C.
    #[inline]
    pub fn origin(&self, coord: BlockCoord) -> (usize, usize) {
        (coord.row * self.tile.m, coord.col * self.tile.n)
    }
}

fn edge(dim: usize, tile: usize, index: usize, loops: usize) -> usize {
    if index + 1 == loops {
        dim - index * tile
    } else {
        tile
    }
}

fn swizzle_coord(inner: usize, loops_m: usize, loops_n: usize, swizzle: Swizzle)
    -> (usize, usize)
{
    let offset = swizzle.offset.max(1);
    match swizzle.direction {
        SwizzleDirection::Zn => {
            let (row, col) = band_coord(inner, loops_m, loops_n, offset);
            (row, col)
        }
        SwizzleDirection::Nz => {
            let (col, row) = band_coord(inner, loops_n, loops_m, offset);
            (row, col)
        }
    }
}

/// Walk bands of `offset` along `major`, snaking along `minor`.
fn band_coord(inner: usize, major: usize, minor: usize, offset: usize) -> (usize, usize) {
    let band = inner / (offset * minor);
    let within = inner % (offset * minor);
    let band_width = if band == ceil_div(major, offset) - 1 {
        major - offset * band
    } else {
        offset
    };
    let a = band * offset + within % band_width;
    let mut b = within / band_width;
    if band % 2 == 1 {
        b = minor - 1 - b;
    }
    (a, b)
}

/// The K tiles one unit walks for one output tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSegment {
    /// Index among the stream blocks, in swizzle order.
    pub block: usize,
    pub coord: BlockCoord,
    pub k_tiles: Range<usize>,
    /// Which of the unit's two partial accumulator slots this lands in.
    pub slot: usize,
}

/// Stream-K work split.
///
/// Output tiles are divided into whole waves of "normal" blocks, handed out
/// round robin, and a tail of "stream" blocks. The K tiles of the stream
/// blocks are laid end to end and cut into one contiguous run per unit, so
/// a unit's run may start inside one block and finish in the next. Units
/// hold a partial accumulator per touched block; a fix up pass sums them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamkScheduler {
    base: BlockScheduler,
    swizzle: Swizzle,
    units: usize,
    stream_blocks: usize,
    per_unit: usize,
    remain: usize,
}

impl StreamkScheduler {
    pub fn new(base: BlockScheduler, swizzle: Swizzle, units: usize) -> Self {
        debug_assert!(units > 0);
        let stream_blocks = base.tiles() % units;
        let k_tiles = stream_blocks * base.loops_k;
        StreamkScheduler {
            base,
            swizzle,
            units,
            stream_blocks,
            per_unit: k_tiles / units,
            remain: k_tiles % units,
        }
    }

    pub fn base(&self) -> &BlockScheduler {
        &self.base
    }

    pub fn normal_blocks(&self) -> usize {
        self.base.tiles() - self.stream_blocks
    }

    pub fn stream_blocks(&self) -> usize {
        self.stream_blocks
    }

    /// Normal blocks of `unit`, in the order it runs them.
    pub fn normal_tasks(&self, unit: usize) -> impl Iterator<Item = BlockCoord> + '_ {
        (unit..self.normal_blocks())
            .step_by(self.units)
            .map(move |task| self.base.coord_of(task, self.swizzle))
    }

    /// Global K tile run `[start, end)` of `unit` over the stream blocks.
    pub fn run_of(&self, unit: usize) -> Range<usize> {
        let (start, len) = if unit < self.remain {
            (unit * (self.per_unit + 1), self.per_unit + 1)
        } else {
            (unit * self.per_unit + self.remain, self.per_unit)
        };
        start..start + len
    }

    pub fn coord_of_stream(&self, block: usize) -> BlockCoord {
        self.base.coord_of(self.normal_blocks() + block, self.swizzle)
    }

    /// Stream segments of `unit`; at most two, since a run is never longer
    /// than one block's K tiles.
    pub fn segments(&self, unit: usize) -> Vec<StreamSegment> {
        let lk = self.base.loops_k;
        let run = self.run_of(unit);
        let mut out = Vec::new();
        let mut pos = run.start;
        while pos < run.end {
            let block = pos / lk;
            let end = min(run.end, (block + 1) * lk);
            out.push(StreamSegment {
                block,
                coord: self.coord_of_stream(block),
                k_tiles: pos - block * lk..end - block * lk,
                slot: out.len(),
            });
            pos = end;
        }
        debug_assert!(out.len() <= 2);
        out
    }

    /// Whether `unit`'s run crosses a block boundary.
    pub fn is_cross(&self, unit: usize) -> bool {
        let run = self.run_of(unit);
        let lk = self.base.loops_k;
        !run.is_empty() && run.start % lk + run.len() > lk
    }

    /// `(unit, slot)` of every partial that makes up stream block `block`.
    pub fn contributors(&self, block: usize) -> Vec<(usize, usize)> {
        let lk = self.base.loops_k;
        let span = block * lk..(block + 1) * lk;
        (0..self.units)
            .filter_map(|unit| {
                let run = self.run_of(unit);
                if run.start < span.end && span.start < run.end {
                    let slot = if run.start >= span.start { 0 } else { 1 };
                    Some((unit, slot))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Element offset and length along k of K tiles `k_tiles`.
    pub fn k_extent(&self, k_tiles: &Range<usize>) -> (usize, usize) {
        let k1 = self.base.tile.k;
        let start = k_tiles.start * k1;
        let end = min(self.base.k, k_tiles.end * k1);
        (start, end - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sched(m: usize, n: usize, k: usize, tile: BlockShape, split: usize) -> BlockScheduler {
        let p = ProblemShape::builder(m, n, k).build().unwrap();
        BlockScheduler::new(&p, tile, split).unwrap()
    }

    const ZN: Swizzle = Swizzle { offset: 3, direction: SwizzleDirection::Zn };
    const NZ: Swizzle = Swizzle { offset: 3, direction: SwizzleDirection::Nz };

    #[test]
    fn zn_order() {
        let s = sched(4 * 16, 3 * 16, 16, BlockShape::new(16, 16, 16), 1);
        let order: Vec<_> = (0..12).map(|t| {
            let c = s.coord_of(t, ZN);
            (c.row, c.col)
        }).collect();
        // band of three rows, then the last row walked backwards
        assert_eq!(order, vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1),
                               (0, 2), (1, 2), (2, 2), (3, 2), (3, 1), (3, 0)]);
    }

    #[test]
    fn nz_is_a_permutation() {
        let s = sched(100, 250, 16, BlockShape::new(16, 16, 16), 1);
        let seen: HashSet<_> = (0..s.total_tasks()).map(|t| s.coord_of(t, NZ)).collect();
        assert_eq!(seen.len(), s.total_tasks());
        assert!(seen.iter().all(|c| c.row < 7 && c.col < 16));
    }

    #[test]
    #[should_panic]
    fn out_of_range_task() {
        let s = sched(32, 32, 16, BlockShape::new(16, 16, 16), 1);
        s.coord_of(4, ZN);
    }

    #[test]
    fn edge_shapes() {
        let s = sched(100, 40, 16, BlockShape::new(32, 16, 16), 1);
        assert_eq!(s.actual_shape_of(BlockCoord::new(3, 2, 0)), BlockShape::new(4, 8, 16));
        assert_eq!(s.actual_shape_of(BlockCoord::new(2, 1, 0)), BlockShape::new(32, 16, 16));
    }

    #[test]
    fn split_slices_cover_k() {
        // 10 k tiles over 4 slices: 3, 3, 2, 2 with a short last tile
        let s = sched(16, 16, 150, BlockShape::new(16, 16, 16), 4);
        let ranges: Vec<_> = (0..4).map(|i| s.k_range(i)).collect();
        assert_eq!(ranges, vec![(0, 48), (48, 48), (96, 32), (128, 22)]);
        assert_eq!(s.total_tasks(), 4);
        assert_eq!(s.coord_of(3, ZN), BlockCoord::new(0, 0, 3));
    }

    #[test]
    fn split_beyond_k_tiles_is_rejected() {
        let p = ProblemShape::builder(16, 16, 32).build().unwrap();
        assert!(BlockScheduler::new(&p, BlockShape::new(16, 16, 16), 3).is_err());
    }

    #[test]
    fn stream_runs() {
        // 5 tiles on 4 units: 4 normal, 1 stream block of 10 k tiles
        let base = sched(5 * 16, 16, 160, BlockShape::new(16, 16, 16), 1);
        let sk = StreamkScheduler::new(base, ZN, 4);
        assert_eq!(sk.normal_blocks(), 4);
        assert_eq!(sk.stream_blocks(), 1);
        let runs: Vec<_> = (0..4).map(|u| sk.run_of(u)).collect();
        assert_eq!(runs, vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(sk.contributors(0), vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
        assert!(!sk.is_cross(1));
    }

    #[test]
    fn stream_runs_cross_blocks() {
        // 7 tiles on 4 units: 3 stream blocks of 4 k tiles, 3 per unit
        let base = sched(7 * 16, 16, 64, BlockShape::new(16, 16, 16), 1);
        let sk = StreamkScheduler::new(base, ZN, 4);
        assert_eq!(sk.stream_blocks(), 3);
        let seg = sk.segments(1);
        assert_eq!(seg.len(), 2);
        assert_eq!((seg[0].block, seg[0].k_tiles.clone(), seg[0].slot), (0, 3..4, 0));
        assert_eq!((seg[1].block, seg[1].k_tiles.clone(), seg[1].slot), (1, 0..2, 1));
        assert!(sk.is_cross(1));
        assert_eq!(sk.contributors(1), vec![(1, 1), (2, 0)]);
        let total: usize = (0..4).flat_map(|u| sk.segments(u)).map(|s| s.k_tiles.len()).sum();
        assert_eq!(total, 12);
    }
}
