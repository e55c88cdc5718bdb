// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//!
//! Tiled matrix multiplication for a device made of many parallel units
//! and a tiered, capacity limited on-chip memory.
//!
//! The crate computes `C ← act(α A B + β C)` and `y ← α A x + β y` in three
//! layers:
//!
//! - the **tiling selector** picks L1 and L0 tile shapes, per operand
//!   reformatting and a kernel variant from a bandwidth cost model;
//! - the **block scheduler** maps a linear task index to a tile coordinate
//!   with a swizzled traversal, optionally splitting K;
//! - the **pipeline** streams tiles through double buffered tiers, with a
//!   matrix engine and a vector engine per unit that hand tiles over
//!   through flags.
//!
//! ## Matrix Representation
//!
//! Operands are slices with a layout and a leading dimension:
//!
//! - [`MatRef::row_major`]`(data, rows, cols)` is packed row major, element
//!   *i, j* at `data[i * cols + j]`;
//! - [`MatRef::col_major`] is the transpose of that;
//! - [`MatRef::with_ld`] sets a leading dimension larger than the packed
//!   one.
//!
//! Views are checked when a launch starts; no engine runs on an invalid
//! operand.
//!
//! ## Device Model
//!
//! A [`Device`] is a [`PlatformCapacities`] (unit count and tier budgets)
//! plus the [`Calibration`] of the cost model. On the host, every unit is a
//! pair of threads. The unit count of [`PlatformCapacities::host`] is the
//! number of physical cores, or `TILEGEMM_NUM_UNITS` when set.
//!
//! Element types are `f32`, and `f16`/`bf16` from the `half` crate; all
//! accumulation is in `f32`.
//!
//! ```
//! use tilegemm::{Device, MatMut, MatRef, PlatformCapacities};
//!
//! let device = Device::new(PlatformCapacities::reference().with_units(4));
//! let a = [1., 2., 3., 4.];
//! let b = [5., 6., 7., 8.];
//! let mut c = [0f32; 4];
//! device.gemm(1., MatRef::row_major(&a, 2, 2), MatRef::row_major(&b, 2, 2),
//!             0., MatMut::row_major(&mut c, 2, 2)).unwrap();
//! assert_eq!(c, [19., 22., 43., 50.]);
//! ```

#![doc(html_root_url = "https://docs.rs/tilegemm/0.1/")]

#[macro_use] mod debugmacros;

mod aligned_alloc;
mod calibration;
mod cost;
mod engine;
mod error;
mod gemm;
mod kernel;
mod memory;
mod pipeline;
mod platform;
mod pointer;
mod problem;
mod scheduler;
mod sync;
mod tiling;
mod util;

pub use crate::calibration::{
    BandwidthFit, Calibration, PaddingCalibration, ShortOuterFit, SplitCalibration, SplitFactor,
    SplitStep, StreamCalibration, TilingCalibration,
};
pub use crate::cost::{
    bandwidth, fit_k1, forced_reformat, judge_space, padding_plan, PaddingPlan, PaddingTag,
};
pub use crate::engine::{kernel_for, Common, LaunchContext, MatmulKernel, Padding, Small, SplitK, StreamK};
pub use crate::error::{Error, Result};
pub use crate::gemm::{Device, LaunchReport, MatMut, MatRef};
pub use crate::kernel::{
    Activation, Element, Epilogue, Portable, Primitives, TileCopy, TileEpilogue, TileMmad,
};
pub use crate::memory::{AccTile, GlobalView, PaddedOperand, Storage, WorkspaceLayout};
pub use crate::pipeline::SlotState;
pub use crate::platform::{MemoryTier, PlatformCapacities};
pub use crate::problem::{ElementKind, Layout, Operand, OperandId, ProblemBuilder, ProblemShape,
                         MAX_DIM};
pub use crate::scheduler::{
    BlockCoord, BlockScheduler, StreamSegment, StreamkScheduler, Swizzle, SwizzleDirection,
};
pub use crate::tiling::{
    BlockShape, DecisionBuilder, KernelVariant, TileShape, TilingDecision, TilingKey,
    TilingSelector,
};

pub use half::{bf16, f16};
