// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tuned constants of the tiling heuristics.
//!
//! Every threshold the selector consults lives here. The defaults were
//! measured on the reference device; other hardware generations should load
//! their own set with [`Calibration::from_json_str`]. Missing fields fall
//! back to the defaults.

use serde::{Deserialize, Serialize};

use std::mem::size_of;

use crate::error::{Error, Result};

fn invalid(field: &str, why: &str) -> Error {
    Error::InvalidCalibration(format!("{}: {}", field, why))
}

fn nonzero(field: &str, value: usize) -> Result<()> {
    if value == 0 { Err(invalid(field, "must not be zero")) } else { Ok(()) }
}

fn finite(field: &str, values: &[f64]) -> Result<()> {
    if values.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(invalid(field, "must be finite"))
    }
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0. {
        Ok(())
    } else {
        Err(invalid(field, "must be finite and positive"))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub bandwidth: BandwidthFit,
    pub padding: PaddingCalibration,
    pub split_k: SplitCalibration,
    pub stream_k: StreamCalibration,
    pub tiling: TilingCalibration,
}

impl Calibration {
    /// Parse and [`validate`](Calibration::validate) a calibration set.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cal: Calibration = serde_json::from_str(s)?;
        cal.validate()?;
        Ok(cal)
    }

    /// Reject values the heuristics divide by, align to or scale with:
    /// zero alignments and counts, and non-finite or non-positive rates.
    pub fn validate(&self) -> Result<()> {
        let bw = &self.bandwidth;
        finite("bandwidth.poly", &bw.poly)?;
        finite("bandwidth.full_row", &[bw.full_row, bw.collapse, bw.cap])?;
        nonzero("bandwidth.full_row_align", bw.full_row_align)?;
        for &(align, factor) in &bw.alignment_bonus {
            nonzero("bandwidth.alignment_bonus", align)?;
            finite("bandwidth.alignment_bonus", &[factor])?;
        }
        for short in &bw.short_outer {
            nonzero("bandwidth.short_outer.align", short.align)?;
            finite("bandwidth.short_outer.coeffs", &short.coeffs)?;
        }

        let pad = &self.padding;
        positive("padding.reformat_bandwidth", pad.reformat_bandwidth)?;
        positive("padding.reformat_bandwidth_cold", pad.reformat_bandwidth_cold)?;
        positive("padding.padded_bandwidth", pad.padded_bandwidth)?;
        positive("padding.few_tiles_penalty", pad.few_tiles_penalty)?;
        finite("padding.head_cost",
               &[pad.head_cost_base, pad.head_cost_per_unit, pad.both_padded_extra])?;
        nonzero("padding.strip_rows", pad.strip_rows)?;
        nonzero("padding.strip_align", pad.strip_align)?;
        nonzero("padding.reformat_workers_per_unit", pad.reformat_workers_per_unit)?;
        nonzero("padding.override_align", pad.override_align)?;
        nonzero("padding.c_align", pad.c_align)?;
        // a strip row holds at least one element of the widest kind
        if pad.strip_bytes < pad.strip_rows * size_of::<f32>() {
            return Err(invalid("padding.strip_bytes", "smaller than one element per strip row"));
        }

        for &(name, tile) in &[("split_k.tile", self.split_k.tile),
                               ("stream_k.tile", self.stream_k.tile)] {
            for &dim in &tile {
                nonzero(name, dim)?;
            }
        }
        finite("stream_k.max_tail_fraction", &[self.stream_k.max_tail_fraction])?;

        let t = &self.tiling;
        nonzero("tiling.align", t.align)?;
        for &k1 in &t.k1_candidates {
            nonzero("tiling.k1_candidates", k1)?;
        }
        finite("tiling.write_bound_ratio", &[t.write_bound_ratio])?;
        // balancing steps a tile down by `align` while it stays above the threshold
        if t.balance_threshold < t.align || t.balance_threshold_mixed < t.align {
            return Err(invalid("tiling.balance_threshold", "below tiling.align"));
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Achieved transfer bandwidth (GB/s per unit) as a function of the used
/// inner extent of a tile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthFit {
    /// Polynomial coefficients `a0..a6` in the used inner extent.
    pub poly: [f64; 7],
    /// Bandwidth when a whole aligned row is used.
    pub full_row: f64,
    pub full_row_max: usize,
    pub full_row_align: usize,
    /// Logical inner extent from which strided access collapses.
    pub collapse_stride: usize,
    pub collapse: f64,
    /// `(alignment, factor)`, first match wins.
    pub alignment_bonus: Vec<(usize, f64)>,
    pub cap: f64,
    /// Corrections for short outer extents, first matching alignment wins.
    pub short_outer: Vec<ShortOuterFit>,
}

/// Multiplier polynomial applied when fewer than `below` rows are moved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShortOuterFit {
    pub align: usize,
    pub below: usize,
    /// Coefficients `b0, b1, ...` in the outer extent.
    pub coeffs: Vec<f64>,
}

impl Default for BandwidthFit {
    fn default() -> Self {
        BandwidthFit {
            poly: [
                0.1,
                0.312849910814454512664184,
                -0.002146456956750821074703,
                0.000007301215580838747961,
                -0.000000006738536427145036,
                -0.000000000012456944162142,
                0.000000000000020146121020,
            ],
            full_row: 60.,
            full_row_max: 128,
            full_row_align: 16,
            collapse_stride: 65536,
            collapse: 1.,
            alignment_bonus: vec![
                (256, 100. / 30.),
                (128, 80. / 30.),
                (64, 50. / 30.),
                (16, 40. / 30.),
            ],
            cap: 80.,
            short_outer: vec![
                ShortOuterFit {
                    align: 256,
                    below: 16,
                    coeffs: vec![
                        0.016102868630357251855667,
                        0.113578920178116271610946,
                        -0.003332381309698882569659,
                    ],
                },
                ShortOuterFit {
                    align: 32,
                    below: 32,
                    coeffs: vec![
                        0.035130178145161221336945,
                        0.045309519479127147167929,
                        -0.000298086120946179481978,
                    ],
                },
                ShortOuterFit {
                    align: 1,
                    below: 64,
                    coeffs: vec![
                        0.003942641759904389614499,
                        0.038963259596073690493867,
                        -0.000469676727179688081274,
                        0.000001809180573350345869,
                    ],
                },
            ],
        }
    }
}

/// Constants of the reformat ("padding") cost comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingCalibration {
    /// Vector engine copy bandwidth while the operand stays in L2.
    pub reformat_bandwidth: f64,
    /// Vector engine copy bandwidth once the operand spills out of L2.
    pub reformat_bandwidth_cold: f64,
    /// Matrix engine load bandwidth from a reformatted operand.
    pub padded_bandwidth: f64,
    /// Penalty divisor applied when few tiles feed many units.
    pub few_tiles_penalty: f64,
    pub strip_rows: usize,
    pub strip_bytes: usize,
    pub strip_align: usize,
    pub reformat_workers_per_unit: usize,
    /// Both inner axes above this launch as many units as the reformat needs.
    pub wide_inner: usize,
    pub head_cost_base: f64,
    pub head_cost_per_unit: f64,
    pub both_padded_extra: f64,
    pub override_tiny_inner: usize,
    pub override_small_inner: usize,
    pub override_align: usize,
    pub override_min_outer: usize,
    pub c_min_elements: usize,
    pub c_min_n: usize,
    pub c_align: usize,
}

impl Default for PaddingCalibration {
    fn default() -> Self {
        PaddingCalibration {
            reformat_bandwidth: 30.,
            reformat_bandwidth_cold: 10.,
            padded_bandwidth: 80.,
            few_tiles_penalty: 1.5,
            strip_rows: 16,
            strip_bytes: 48 * 1024,
            strip_align: 16,
            reformat_workers_per_unit: 2,
            wide_inner: 192,
            head_cost_base: 1.,
            head_cost_per_unit: 7.,
            both_padded_extra: 2.,
            override_tiny_inner: 8,
            override_small_inner: 32,
            override_align: 16,
            override_min_outer: 512,
            c_min_elements: 2048 * 2048,
            c_min_n: 256,
            c_align: 128,
        }
    }
}

/// Upper bound of the split factor once K reaches `min_k`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitStep {
    pub min_k: usize,
    pub factor: SplitFactor,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SplitFactor {
    Fixed(usize),
    AllUnits,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitCalibration {
    /// L1 tile `[m1, n1, k1]`; transposed for column-major A.
    pub tile: [usize; 3],
    pub base_factor: usize,
    /// Ascending by `min_k`; the last matching step wins.
    pub steps: Vec<SplitStep>,
    /// Fire when blocks <= units / 2 and k exceeds this.
    pub half_units_min_k: usize,
    /// Fire when blocks <= `few_blocks` and k exceeds `few_blocks_min_k`.
    pub few_blocks: usize,
    pub few_blocks_min_k: usize,
}

impl Default for SplitCalibration {
    fn default() -> Self {
        SplitCalibration {
            tile: [128, 256, 256],
            base_factor: 2,
            steps: vec![
                SplitStep { min_k: 1025, factor: SplitFactor::Fixed(4) },
                SplitStep { min_k: 2049, factor: SplitFactor::Fixed(8) },
                SplitStep { min_k: 4097, factor: SplitFactor::Fixed(16) },
                SplitStep { min_k: 12288, factor: SplitFactor::AllUnits },
            ],
            half_units_min_k: 5120,
            few_blocks: 2,
            few_blocks_min_k: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCalibration {
    pub tile: [usize; 3],
    /// Blocks must stay below this many waves of units.
    pub max_waves: usize,
    /// Tail blocks must leave at least this fraction of units idle.
    pub max_tail_fraction: f64,
    pub min_k: usize,
}

impl Default for StreamCalibration {
    fn default() -> Self {
        StreamCalibration {
            tile: [128, 256, 256],
            max_waves: 8,
            max_tail_fraction: 0.8,
            min_k: 3072,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingCalibration {
    /// Tile dimensions are multiples of this.
    pub align: usize,
    /// Tried largest first.
    pub k1_candidates: Vec<usize>,
    /// Strides from here on defeat the bandwidth tuned tiles.
    pub huge_extent: usize,
    /// `(mk + kn) / mn` below this is write bound.
    pub write_bound_ratio: f64,
    pub balance_threshold: usize,
    pub balance_threshold_mixed: usize,
    /// Wide 64 x 512 tiles are only used when k is at most this.
    pub wide_tile_max_k: usize,
}

impl Default for TilingCalibration {
    fn default() -> Self {
        TilingCalibration {
            align: 16,
            k1_candidates: vec![1024, 512, 256, 128],
            huge_extent: 65536,
            write_bound_ratio: 0.1,
            balance_threshold: 32,
            balance_threshold_mixed: 64,
            wide_tile_max_k: 128,
        }
    }
}

impl SplitCalibration {
    /// Largest split factor allowed for reduction length `k`.
    pub fn max_split(&self, k: usize, units: usize) -> usize {
        let mut factor = self.base_factor;
        for step in &self.steps {
            if k >= step.min_k {
                factor = match step.factor {
                    SplitFactor::Fixed(f) => f,
                    SplitFactor::AllUnits => units,
                };
            }
        }
        factor
    }
}
