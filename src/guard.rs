//! # Stack Guards
//!
//! Catches stack overflows by making the lowest [`GUARD_BYTES`] of a stack
//! inaccessible through the memory protection unit. A task that runs off the
//! bottom of its stack then takes a fault instead of quietly overwriting
//! whatever lives below it.
//!
//! The ARMv6-M MPU has no regions smaller than 256 bytes, and a region must be
//! aligned to its size. So a guard is a 256-byte region with only one of its
//! eight 32-byte sub-regions enabled: the one that holds the bottom of the
//! stack. Every stack is aligned to 32 bytes, so that sub-region lines up with
//! the guard exactly.
//!
//! Regions are scarce (eight on a Cortex-M0+, one of them taken by the runtime
//! for the main stack), so only a handful of stacks can be guarded at once.

use crate::config::{GUARD_BYTES, MPU_REGIONS, MPU_RESERVED_REGIONS};

/// `log2(256) - 1`, the SIZE field for a 256-byte region.
const REGION_SIZE_FIELD: u32 = 7;
const REGION_BYTES: usize = 256;
const SUBREGIONS: usize = 8;

const RASR_ENABLE: u32 = 1;
const RASR_SIZE_LSB: u32 = 1;
const RASR_SRD_LSB: u32 = 8;
/// AP = 0b000 (no access), XN = 1.
const RASR_NO_ACCESS: u32 = 1 << 28;

const RBAR_VALID: u32 = 1 << 4;
const RBAR_ADDR_MASK: u32 = !(REGION_BYTES as u32 - 1);

/// MPU register values for one guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRegion {
    base: u32,
    rasr: u32,
}

impl GuardRegion {
    /// The region that blocks `bottom .. bottom + GUARD_BYTES`.
    pub fn covering(bottom: usize) -> GuardRegion {
        assert_eq!(bottom % GUARD_BYTES, 0, "stack bottom not guard-aligned");
        let base = bottom & !(REGION_BYTES - 1);
        let sub = (bottom - base) / (REGION_BYTES / SUBREGIONS);
        let srd = !(1u32 << sub) & 0xff;

        GuardRegion {
            base: base as u32 & RBAR_ADDR_MASK,
            rasr: RASR_ENABLE
                | (REGION_SIZE_FIELD << RASR_SIZE_LSB)
                | (srd << RASR_SRD_LSB)
                | RASR_NO_ACCESS,
        }
    }

    /// RBAR value that writes this region into MPU slot `region`.
    pub fn rbar(&self, region: u8) -> u32 {
        self.base | RBAR_VALID | (region as u32 & 0xf)
    }

    pub fn rasr(&self) -> u32 {
        self.rasr
    }

    /// Whether an access to `addr` would trap.
    pub fn blocks(&self, addr: usize) -> bool {
        let base = self.base as usize;
        if addr < base || addr >= base + REGION_BYTES {
            return false;
        }
        let sub = (addr - base) / (REGION_BYTES / SUBREGIONS);
        let srd = (self.rasr >> RASR_SRD_LSB) & 0xff;
        srd & (1 << sub) == 0
    }
}

/// Which MPU regions the scheduler has handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardSlots {
    used: u8,
}

impl GuardSlots {
    pub const fn new() -> Self {
        Self { used: 0 }
    }

    /// Number of regions available for stack guards.
    pub const fn capacity() -> u8 {
        MPU_REGIONS - MPU_RESERVED_REGIONS
    }

    /// Lowest free region for which `in_use` (the hardware's own view) also
    /// says free.
    pub fn claim(&mut self, in_use: impl Fn(u8) -> bool) -> Option<u8> {
        let region = (0..Self::capacity()).find(|&r| self.used & (1 << r) == 0 && !in_use(r))?;
        self.used |= 1 << region;
        Some(region)
    }

    pub fn release(&mut self, region: u8) {
        debug_assert!(self.used & (1 << region) != 0, "guard region {} not claimed", region);
        self.used &= !(1 << region);
    }

    pub fn in_use(&self) -> u32 {
        self.used.count_ones()
    }
}
