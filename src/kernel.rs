// Copyright 2016 - 2021 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Element types and the low level tile primitives.
//!
//! The pipeline never touches numbers itself; it moves tiles through the
//! tiers with [`TileCopy`], multiplies resident tiles with [`TileMmad`] and
//! finishes output tiles with [`TileEpilogue`]. [`Portable`] is the
//! reference implementation in plain Rust.

use core::fmt::Debug;
use core::ops::Range;
use core::ptr::copy_nonoverlapping;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::memory::{AccTile, GlobalView};
use crate::problem::ElementKind;

/// Matrix element; accumulation is always in `f32`.
pub trait Element : Copy + Send + Sync + Debug + PartialEq + 'static {
    const KIND: ElementKind;
    fn zero() -> Self;
    fn to_acc(self) -> f32;
    fn from_acc(x: f32) -> Self;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;
    fn zero() -> Self { 0. }
    fn to_acc(self) -> f32 { self }
    fn from_acc(x: f32) -> Self { x }
}

impl Element for f16 {
    const KIND: ElementKind = ElementKind::F16;
    fn zero() -> Self { f16::ZERO }
    fn to_acc(self) -> f32 { self.to_f32() }
    fn from_acc(x: f32) -> Self { f16::from_f32(x) }
}

impl Element for bf16 {
    const KIND: ElementKind = ElementKind::Bf16;
    fn zero() -> Self { bf16::ZERO }
    fn to_acc(self) -> f32 { self.to_f32() }
    fn from_acc(x: f32) -> Self { bf16::from_f32(x) }
}

/// Elementwise function applied last in the epilogue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Relu,
    /// tanh approximation
    Gelu,
    Silu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.),
            Activation::Gelu => {
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1. + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
            }
            Activation::Silu => x / (1. + (-x).exp()),
        }
    }
}

impl Default for Activation {
    fn default() -> Self { Activation::Identity }
}

/// `C ← act(α acc + β C)`
///
/// When `beta` is zero, C is not read and may hold anything, NaN included.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Epilogue {
    pub alpha: f32,
    pub beta: f32,
    pub activation: Activation,
}

impl Epilogue {
    pub fn new(alpha: f32, beta: f32) -> Self {
        Epilogue { alpha, beta, activation: Activation::Identity }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Whether the matrix engine can write C itself: no read of C and no
    /// activation, only the α scale.
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.beta == 0. && self.activation == Activation::Identity
    }

    #[inline(always)]
    pub fn apply(&self, acc: f32, c: f32) -> f32 {
        let mut x = self.alpha * acc;
        if self.beta != 0. {
            x += self.beta * c;
        }
        self.activation.apply(x)
    }
}

impl Default for Epilogue {
    fn default() -> Self { Epilogue::new(1., 0.) }
}

/// Data movement between tiers.
pub trait TileCopy<E: Element> : Sync {
    /// Copy the `rows x cols` block of `src` at `(row, col)` into `dst`,
    /// row major with leading dimension `ld`.
    ///
    /// ***Safety***: the block is inside `src` and `src` is readable.
    unsafe fn gm_to_l1(&self, src: &GlobalView<E>, row: usize, col: usize,
                       rows: usize, cols: usize, dst: &mut [E], ld: usize);

    /// Copy a `rows x cols` block between two row major tier buffers.
    fn l1_to_l0(&self, src: &[E], src_ld: usize, dst: &mut [E], dst_ld: usize,
                rows: usize, cols: usize);

    /// Write a `rows x cols` accumulator block to an `f32` workspace tile.
    ///
    /// ***Safety***: `dst` covers the block and no one else accesses it.
    unsafe fn l0c_to_gm(&self, acc: &[f32], acc_ld: usize, dst: &AccTile,
                        rows: usize, cols: usize);

    /// Rewrite rows `rows` of `src` into the padded storage behind `dst`.
    ///
    /// ***Safety***: both views have the same logical shape; the rows of
    /// `dst` are not accessed by anyone else.
    unsafe fn reformat(&self, src: &GlobalView<E>, dst: &GlobalView<E>, rows: Range<usize>);
}

/// Matrix engine arithmetic.
pub trait TileMmad<E: Element> : Sync {
    /// `acc[m x n] += a[m x k] b[k x n]`, all row major.
    fn mmad(&self, acc: &mut [f32], acc_ld: usize,
            a: &[E], a_ld: usize, b: &[E], b_ld: usize,
            m: usize, n: usize, k: usize);
}

/// Vector engine arithmetic.
pub trait TileEpilogue<E: Element> : Sync {
    /// `C[row.., col..] ← ep(Σ parts)` over a `rows x cols` block; `parts`
    /// are addressed relative to the block.
    ///
    /// ***Safety***: the block is inside `dst`, `parts` cover it, and no
    /// one else writes them.
    unsafe fn apply(&self, ep: &Epilogue, parts: &[AccTile], dst: &GlobalView<E>,
                    row: usize, col: usize, rows: usize, cols: usize);
}

/// Everything a launch needs from a backend.
pub trait Primitives<E: Element> : TileCopy<E> + TileMmad<E> + TileEpilogue<E> {}

impl<E: Element, P> Primitives<E> for P
    where P: TileCopy<E> + TileMmad<E> + TileEpilogue<E>
{}

/// Reference primitives in portable Rust.
#[derive(Copy, Clone, Debug, Default)]
pub struct Portable;

impl<E: Element> TileCopy<E> for Portable {
    unsafe fn gm_to_l1(&self, src: &GlobalView<E>, row: usize, col: usize,
                       rows: usize, cols: usize, dst: &mut [E], ld: usize)
    {
        debug_assert!(row + rows <= src.rows() && col + cols <= src.cols());
        debug_assert!(rows == 0 || (rows - 1) * ld + cols <= dst.len());
        if let Some((_, 1)) = src.strides() {
            // rows are contiguous, copy a row at a time
            for i in 0..rows {
                copy_nonoverlapping(src.at(row + i, col), dst.as_mut_ptr().add(i * ld), cols);
            }
        } else {
            for i in 0..rows {
                for j in 0..cols {
                    dst[i * ld + j] = src.read(row + i, col + j);
                }
            }
        }
    }

    fn l1_to_l0(&self, src: &[E], src_ld: usize, dst: &mut [E], dst_ld: usize,
                rows: usize, cols: usize)
    {
        for i in 0..rows {
            dst[i * dst_ld..i * dst_ld + cols]
                .copy_from_slice(&src[i * src_ld..i * src_ld + cols]);
        }
    }

    unsafe fn l0c_to_gm(&self, acc: &[f32], acc_ld: usize, dst: &AccTile,
                        rows: usize, cols: usize)
    {
        for i in 0..rows {
            for j in 0..cols {
                *dst.at(i, j) = acc[i * acc_ld + j];
            }
        }
    }

    unsafe fn reformat(&self, src: &GlobalView<E>, dst: &GlobalView<E>, rows: Range<usize>) {
        debug_assert_eq!((src.rows(), src.cols()), (dst.rows(), dst.cols()));
        for i in rows {
            for j in 0..src.cols() {
                dst.write(i, j, src.read(i, j));
            }
        }
    }
}

impl<E: Element> TileMmad<E> for Portable {
    fn mmad(&self, acc: &mut [f32], acc_ld: usize,
            a: &[E], a_ld: usize, b: &[E], b_ld: usize,
            m: usize, n: usize, k: usize)
    {
        for i in 0..m {
            let acc_row = &mut acc[i * acc_ld..i * acc_ld + n];
            for l in 0..k {
                let x = a[i * a_ld + l].to_acc();
                let b_row = &b[l * b_ld..l * b_ld + n];
                for (c, y) in acc_row.iter_mut().zip(b_row) {
                    *c += x * y.to_acc();
                }
            }
        }
    }
}

impl<E: Element> TileEpilogue<E> for Portable {
    unsafe fn apply(&self, ep: &Epilogue, parts: &[AccTile], dst: &GlobalView<E>,
                    row: usize, col: usize, rows: usize, cols: usize)
    {
        for i in 0..rows {
            for j in 0..cols {
                let acc = parts.iter().fold(0., |s, p| s + *p.at(i, j));
                let c = if ep.beta != 0. {
                    dst.read(row + i, col + j).to_acc()
                } else {
                    0.
                };
                dst.write(row + i, col + j, E::from_acc(ep.apply(acc, c)));
            }
        }
    }
}
