// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The matrix engine: a three stage pipeline through L1 and L0.
//!
//! ```text
//!  loader ──L1 ring──▶ splitter ──L0 ring──▶ mmad ──▶ output target
//!   (GM→L1)            (L1→L0, k0 slices)    (L0C accumulator)
//! ```
//!
//! Each ring holds [`STAGES`] slots that travel by value through a free and
//! a ready channel, so a producer stalls only when both slots of its own
//! tier are in use downstream.

use std::cmp::min;
use std::panic::resume_unwind;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::aligned_alloc::{Alloc, BUFFER_ALIGN};
use crate::engine::LaunchContext;
use crate::kernel::{Element, TileCopy, TileEpilogue, TileMmad};
use crate::memory::AccTile;
use crate::pointer::Ptr;
use crate::scheduler::BlockCoord;
use crate::sync::Aborted;
use crate::tiling::{BlockShape, STAGES};
use crate::util::ceil_div;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Prefetching,
    Ready,
    Consuming,
}

/// A tier buffer and the job it currently holds.
pub(crate) struct Slot<P> {
    tier: &'static str,
    index: usize,
    state: SlotState,
    pub(crate) data: P,
}

impl<P> Slot<P> {
    fn enter(&mut self, state: SlotState) {
        dprint!("{} slot {}: {:?} -> {:?}", self.tier, self.index, self.state, state);
        self.state = state;
    }
}

/// A ring of tier slots with one producer and one consumer.
pub(crate) struct StageRing<P> {
    producer: Producer<P>,
    consumer: Consumer<P>,
}

pub(crate) struct Producer<P> {
    free: Receiver<Slot<P>>,
    ready: Sender<Slot<P>>,
}

pub(crate) struct Consumer<P> {
    free: Sender<Slot<P>>,
    ready: Receiver<Slot<P>>,
}

impl<P> StageRing<P> {
    pub(crate) fn new(tier: &'static str, payloads: Vec<P>) -> Self {
        let depth = payloads.len();
        let (free_tx, free_rx) = bounded(depth);
        let (ready_tx, ready_rx) = bounded(depth);
        for (index, data) in payloads.into_iter().enumerate() {
            let slot = Slot { tier, index, state: SlotState::Idle, data };
            // the channel has room for every slot
            let _ = free_tx.try_send(slot);
        }
        StageRing {
            producer: Producer { free: free_rx, ready: ready_tx },
            consumer: Consumer { free: free_tx, ready: ready_rx },
        }
    }

    pub(crate) fn split(self) -> (Producer<P>, Consumer<P>) {
        (self.producer, self.consumer)
    }
}

impl<P> Producer<P> {
    /// Wait for an idle slot; `None` once the consumer is gone.
    pub(crate) fn acquire(&self) -> Option<Slot<P>> {
        let mut slot = self.free.recv().ok()?;
        slot.enter(SlotState::Prefetching);
        Some(slot)
    }

    pub(crate) fn publish(&self, mut slot: Slot<P>) -> bool {
        slot.enter(SlotState::Ready);
        self.ready.send(slot).is_ok()
    }
}

impl<P> Consumer<P> {
    /// Next filled slot; `None` once the producer is done and the ring
    /// is empty.
    pub(crate) fn next(&self) -> Option<Slot<P>> {
        let mut slot = self.ready.recv().ok()?;
        slot.enter(SlotState::Consuming);
        Some(slot)
    }

    pub(crate) fn release(&self, mut slot: Slot<P>) {
        slot.enter(SlotState::Idle);
        // a finished producer no longer needs slots back
        let _ = self.free.send(slot);
    }
}

/// Where the finished accumulator of a job goes.
#[derive(Copy, Clone, Debug)]
pub(crate) enum OutputTarget {
    /// `α acc` straight into C.
    Direct,
    /// Epilogue staging slot of the unit, drained by its vector engine.
    Staged(usize),
    /// Raw accumulator into a workspace tile, reduced later.
    Workspace(AccTile),
}

/// One output tile (or part of its K range) for the matrix engine.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TileJob {
    pub(crate) coord: BlockCoord,
    /// Actual rows and columns of the tile, and the K extent to run.
    pub(crate) shape: BlockShape,
    pub(crate) k_offset: usize,
    pub(crate) target: OutputTarget,
}

struct L1Tile<E> {
    a: Alloc<E>,
    b: Alloc<E>,
    job: usize,
    k_len: usize,
    first: bool,
    last: bool,
}

struct L0Tile<E> {
    a: Alloc<E>,
    b: Alloc<E>,
    job: usize,
    k_len: usize,
    first: bool,
    last: bool,
}

impl<E: Element> L1Tile<E> {
    fn new(tile: BlockShape) -> Self {
        L1Tile {
            a: Alloc::filled(tile.m * tile.k, BUFFER_ALIGN, E::zero()),
            b: Alloc::filled(tile.k * tile.n, BUFFER_ALIGN, E::zero()),
            job: 0, k_len: 0, first: false, last: false,
        }
    }
}

impl<E: Element> L0Tile<E> {
    fn new(tile: BlockShape) -> Self {
        L0Tile {
            a: Alloc::filled(tile.m * tile.k, BUFFER_ALIGN, E::zero()),
            b: Alloc::filled(tile.k * tile.n, BUFFER_ALIGN, E::zero()),
            job: 0, k_len: 0, first: false, last: false,
        }
    }
}

/// Run `jobs` of `unit` through the three stage pipeline.
pub(crate) fn run_matrix_engine<E: Element>(cx: &LaunchContext<'_, E>, unit: usize,
                                            jobs: &[TileJob]) -> Result<(), Aborted>
{
    let tile = cx.decision.tile;
    let (l1_tx, l1_rx) = StageRing::new("L1", (0..STAGES).map(|_| L1Tile::<E>::new(tile.l1)).collect()).split();
    let (l0_tx, l0_rx) = StageRing::new("L0", (0..STAGES).map(|_| L0Tile::<E>::new(tile.l0)).collect()).split();

    let res = crossbeam::scope(|s| {
        s.spawn(move |_| {
            let _guard = cx.flags.abort.on_panic();
            load(cx, jobs, l1_tx)
        });
        s.spawn(move |_| {
            let _guard = cx.flags.abort.on_panic();
            split_k0(cx, jobs, l1_rx, l0_tx)
        });
        accumulate(cx, unit, jobs, l0_rx)
    });
    match res {
        Ok(r) => r,
        Err(payload) => resume_unwind(payload),
    }
}

/// Single pass for jobs whose K extent fits one L1 tile: every stage runs
/// in turn on the engine thread with one slot per tier.
pub(crate) fn run_single_pass<E: Element>(cx: &LaunchContext<'_, E>, unit: usize,
                                          jobs: &[TileJob]) -> Result<(), Aborted>
{
    let tile = cx.decision.tile;
    let mut l1 = L1Tile::<E>::new(tile.l1);
    let mut l0 = L0Tile::<E>::new(tile.l0);
    let mut acc = Alloc::filled(tile.l1.m * tile.l1.n, BUFFER_ALIGN, 0f32);
    let (k1, k0, n1) = (tile.l1.k, tile.l0.k, tile.l1.n);
    wait_prologue(cx)?;
    for (index, job) in jobs.iter().enumerate() {
        debug_assert!(job.shape.k <= k1, "single pass job spans several k tiles");
        let (m, n, k) = (job.shape.m, job.shape.n, job.shape.k);
        let (row, col) = cx.scheduler.origin(job.coord);
        unsafe {
            cx.prims.gm_to_l1(&cx.a, row, job.k_offset, m, k, &mut l1.a, k1);
            cx.prims.gm_to_l1(&cx.b, job.k_offset, col, k, n, &mut l1.b, n1);
        }
        zero(&mut acc);
        for ks in (0..k).step_by(k0) {
            let kl = min(k0, k - ks);
            cx.prims.l1_to_l0(&l1.a[ks..], k1, &mut l0.a, k0, m, kl);
            cx.prims.l1_to_l0(&l1.b[ks * n1..], n1, &mut l0.b, n1, kl, n);
            cx.prims.mmad(&mut acc, n1, &l0.a, k0, &l0.b, n1, m, n, kl);
        }
        dprint!("unit {} job {} {:?} done", unit, index, job.coord);
        emit(cx, unit, job, &mut acc)?;
    }
    Ok(())
}

fn wait_prologue<E: Element>(cx: &LaunchContext<'_, E>) -> Result<(), Aborted> {
    if cx.reformats() {
        cx.flags.prologue.wait_all(&cx.flags.abort)?;
    }
    Ok(())
}

fn zero(acc: &mut [f32]) {
    for x in acc {
        *x = 0.;
    }
}

/// GM → L1, one slot per (job, k tile).
fn load<E: Element>(cx: &LaunchContext<'_, E>, jobs: &[TileJob], ring: Producer<L1Tile<E>>)
    -> Result<(), Aborted>
{
    wait_prologue(cx)?;
    let l1 = cx.decision.tile.l1;
    for (index, job) in jobs.iter().enumerate() {
        let (m, n) = (job.shape.m, job.shape.n);
        let (row, col) = cx.scheduler.origin(job.coord);
        let k_tiles = ceil_div(job.shape.k, l1.k);
        for kt in 0..k_tiles {
            let k_start = kt * l1.k;
            let k_len = min(l1.k, job.shape.k - k_start);
            let kk = job.k_offset + k_start;
            let mut slot = match ring.acquire() {
                Some(slot) => slot,
                None => return Err(Aborted),
            };
            let t = &mut slot.data;
            unsafe {
                cx.prims.gm_to_l1(&cx.a, row, kk, m, k_len, &mut t.a, l1.k);
                cx.prims.gm_to_l1(&cx.b, kk, col, k_len, n, &mut t.b, l1.n);
            }
            t.job = index;
            t.k_len = k_len;
            t.first = kt == 0;
            t.last = kt + 1 == k_tiles;
            if !ring.publish(slot) {
                return Err(Aborted);
            }
        }
    }
    Ok(())
}

/// L1 → L0 in k0 slices.
fn split_k0<E: Element>(cx: &LaunchContext<'_, E>, jobs: &[TileJob], input: Consumer<L1Tile<E>>,
                        output: Producer<L0Tile<E>>) -> Result<(), Aborted>
{
    let (k1, k0, n1) = (cx.decision.tile.l1.k, cx.decision.tile.l0.k, cx.decision.tile.l1.n);
    while let Some(src) = input.next() {
        let t = &src.data;
        let shape = jobs[t.job].shape;
        for ks in (0..t.k_len).step_by(k0) {
            let kl = min(k0, t.k_len - ks);
            let mut slot = output.acquire().ok_or(Aborted)?;
            let d = &mut slot.data;
            cx.prims.l1_to_l0(&t.a[ks..], k1, &mut d.a, k0, shape.m, kl);
            cx.prims.l1_to_l0(&t.b[ks * n1..], n1, &mut d.b, n1, kl, shape.n);
            d.job = t.job;
            d.k_len = kl;
            d.first = t.first && ks == 0;
            d.last = t.last && ks + kl == t.k_len;
            if !output.publish(slot) {
                return Err(Aborted);
            }
        }
        input.release(src);
    }
    Ok(())
}

/// Multiply-accumulate into L0C and emit finished tiles.
fn accumulate<E: Element>(cx: &LaunchContext<'_, E>, unit: usize, jobs: &[TileJob],
                          input: Consumer<L0Tile<E>>) -> Result<(), Aborted>
{
    let tile = cx.decision.tile;
    let (k0, n1) = (tile.l0.k, tile.l1.n);
    let mut acc = Alloc::filled(tile.l1.m * tile.l1.n, BUFFER_ALIGN, 0f32);
    let mut emitted = 0;
    while let Some(slot) = input.next() {
        let t = &slot.data;
        let job = &jobs[t.job];
        if t.first {
            zero(&mut acc);
        }
        cx.prims.mmad(&mut acc, n1, &t.a, k0, &t.b, n1, job.shape.m, job.shape.n, t.k_len);
        let last = t.last;
        input.release(slot);
        if last {
            dprint!("unit {} job {} {:?} done", unit, emitted, job.coord);
            emit(cx, unit, job, &mut acc)?;
            emitted += 1;
        }
    }
    if emitted == jobs.len() { Ok(()) } else { Err(Aborted) }
}

/// Hand the accumulator of a finished job to its target.
fn emit<E: Element>(cx: &LaunchContext<'_, E>, unit: usize, job: &TileJob, acc: &mut [f32])
    -> Result<(), Aborted>
{
    let n1 = cx.decision.tile.l1.n;
    let (m, n) = (job.shape.m, job.shape.n);
    let (row, col) = cx.scheduler.origin(job.coord);
    match job.target {
        OutputTarget::Direct => unsafe {
            let part = AccTile::row_major(Ptr::new(acc.as_mut_ptr()), n1);
            cx.prims.apply(cx.epilogue, &[part], &cx.c, row, col, m, n);
        },
        OutputTarget::Staged(slot) => {
            let pair = &cx.flags.pairs[unit];
            pair.free[slot].wait(&cx.flags.abort)?;
            unsafe {
                cx.prims.l0c_to_gm(acc, n1, &cx.workspace.staging(unit, slot, n1), m, n);
            }
            pair.ready[slot].set();
        }
        OutputTarget::Workspace(dst) => unsafe {
            cx.prims.l0c_to_gm(acc, n1, &dst, m, n);
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cycles_slots_in_order() {
        let (tx, rx) = StageRing::new("test", vec![0usize; STAGES]).split();
        let mut seen = Vec::new();
        crossbeam::scope(|s| {
            s.spawn(move |_| {
                for value in 0..7 {
                    let mut slot = tx.acquire().unwrap();
                    slot.data = value;
                    assert!(tx.publish(slot));
                }
            });
            while let Some(slot) = rx.next() {
                seen.push((slot.index, slot.data));
                rx.release(slot);
            }
        }).unwrap();
        let values: Vec<_> = seen.iter().map(|&(_, v)| v).collect();
        assert_eq!(values, (0..7).collect::<Vec<_>>());
        // slots alternate
        assert!(seen.windows(2).all(|w| w[0].0 != w[1].0));
    }

    #[test]
    fn producer_stops_when_consumer_leaves() {
        let (tx, rx) = StageRing::new("test", vec![(); STAGES]).split();
        drop(rx);
        assert!(tx.acquire().is_some());
        assert!(tx.acquire().is_some());
        assert!(tx.acquire().is_none());
    }
}
