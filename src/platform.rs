// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//!
//! Platform capacities and host detection

use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One level of the on-chip memory hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Shared cache in front of global memory
    L2,
    /// Per-unit staging buffer for big tiles
    L1,
    /// Left operand buffer next to the matrix engine
    L0A,
    /// Right operand buffer next to the matrix engine
    L0B,
    /// Matrix engine accumulator
    L0C,
    /// Vector engine unified buffer
    Ub,
}

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Unit count and byte capacity of every memory tier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformCapacities {
    pub units: usize,
    pub l2_bytes: usize,
    pub l1_bytes: usize,
    pub l0a_bytes: usize,
    pub l0b_bytes: usize,
    pub l0c_bytes: usize,
    pub ub_bytes: usize,
}

impl Default for PlatformCapacities {
    fn default() -> Self {
        PlatformCapacities::reference()
    }
}

impl PlatformCapacities {
    /// The reference device: 24 units, 512 KiB L1, 64 KiB L0A/L0B,
    /// 128 KiB L0C, 192 KiB UB and a 192 MiB L2.
    pub const fn reference() -> Self {
        PlatformCapacities {
            units: 24,
            l2_bytes: 192 * MIB,
            l1_bytes: 512 * KIB,
            l0a_bytes: 64 * KIB,
            l0b_bytes: 64 * KIB,
            l0c_bytes: 128 * KIB,
            ub_bytes: 192 * KIB,
        }
    }

    /// Reference tiers with one unit per physical core of this host.
    ///
    /// The unit count can be overridden with `TILEGEMM_NUM_UNITS`; it is read
    /// once per process.
    pub fn host() -> Self {
        HOST.clone()
    }

    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn with_capacity(mut self, tier: MemoryTier, bytes: usize) -> Self {
        *self.capacity_mut(tier) = bytes;
        self
    }

    pub fn capacity(&self, tier: MemoryTier) -> usize {
        match tier {
            MemoryTier::L2 => self.l2_bytes,
            MemoryTier::L1 => self.l1_bytes,
            MemoryTier::L0A => self.l0a_bytes,
            MemoryTier::L0B => self.l0b_bytes,
            MemoryTier::L0C => self.l0c_bytes,
            MemoryTier::Ub => self.ub_bytes,
        }
    }

    fn capacity_mut(&mut self, tier: MemoryTier) -> &mut usize {
        match tier {
            MemoryTier::L2 => &mut self.l2_bytes,
            MemoryTier::L1 => &mut self.l1_bytes,
            MemoryTier::L0A => &mut self.l0a_bytes,
            MemoryTier::L0B => &mut self.l0b_bytes,
            MemoryTier::L0C => &mut self.l0c_bytes,
            MemoryTier::Ub => &mut self.ub_bytes,
        }
    }

    /// Fail with a configuration error if `need` bytes do not fit `tier`.
    pub(crate) fn check(&self, tier: MemoryTier, need: usize) -> Result<()> {
        let have = self.capacity(tier);
        if need > have {
            Err(Error::CapacityExceeded { tier, need, have })
        } else {
            Ok(())
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.units == 0 {
            Err(Error::NoUnits)
        } else {
            Ok(())
        }
    }
}

static HOST: Lazy<PlatformCapacities> = Lazy::new(|| {
    let var = ::std::env::var("TILEGEMM_NUM_UNITS").ok();
    let units = match var {
        Some(s) if !s.is_empty() => {
            if let Ok(nu) = usize::from_str(&s) {
                1.max(nu)
            } else {
                log::warn!("Failed to parse TILEGEMM_NUM_UNITS={:?}", s);
                1
            }
        }
        _otherwise => num_cpus::get_physical(),
    };
    PlatformCapacities::reference().with_units(units)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_by_tier() {
        let p = PlatformCapacities::reference().with_capacity(MemoryTier::L0A, 32 * KIB);
        assert_eq!(p.capacity(MemoryTier::L0A), 32 * KIB);
        assert_eq!(p.capacity(MemoryTier::L1), 512 * KIB);
        assert!(p.check(MemoryTier::L0A, 32 * KIB).is_ok());
        assert!(matches!(p.check(MemoryTier::L0A, 32 * KIB + 1),
                         Err(Error::CapacityExceeded { tier: MemoryTier::L0A, .. })));
    }

    #[test]
    fn host_has_units() {
        assert!(PlatformCapacities::host().units >= 1);
        assert!(matches!(PlatformCapacities::reference().with_units(0).validate(),
                         Err(Error::NoUnits)));
    }

    #[test]
    fn partial_json() {
        let p: PlatformCapacities = serde_json::from_str(r#"{"units": 20}"#).unwrap();
        assert_eq!(p, PlatformCapacities::reference().with_units(20));
    }
}
