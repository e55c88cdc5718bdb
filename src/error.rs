// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types.
//!
//! Only configuration errors are recoverable. They are reported before any
//! engine thread is started; out of range coordinates and offsets are
//! programmer errors and panic instead.

use thiserror::Error;

use crate::platform::MemoryTier;

#[derive(Debug, Error)]
pub enum Error {
    #[error("problem has an empty dimension: m={m}, n={n}, k={k}")]
    EmptyProblem { m: usize, n: usize, k: usize },

    #[error("operand {operand}: leading dimension {ld} is smaller than the minor extent {extent}")]
    InvalidStride { operand: char, ld: usize, extent: usize },

    #[error("operand {operand}: buffer holds {len} elements, view needs {need}")]
    BufferTooSmall { operand: char, len: usize, need: usize },

    #[error("operand shapes do not agree: {0}")]
    ShapeMismatch(String),

    #[error("tile shape has a zero dimension: {0}x{1}")]
    ZeroTile(usize, usize),

    #[error("{tier:?} budget exceeded: need {need} bytes, have {have} bytes")]
    CapacityExceeded { tier: MemoryTier, need: usize, have: usize },

    #[error("platform has no parallel units")]
    NoUnits,

    #[error("size {0} exceeds the representable limit")]
    ExceedsLimits(usize),

    #[error("decision does not fit the problem: {0}")]
    InvalidDecision(String),

    #[error("calibration value out of range: {0}")]
    InvalidCalibration(String),

    #[error("failed to parse calibration: {0}")]
    Calibration(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
