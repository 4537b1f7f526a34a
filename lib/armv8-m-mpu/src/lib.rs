// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level helpers for the ARMv8-M protected memory system.
//!
//! The MPU helpers work on either security bank: pass the usual
//! `cortex_m::peripheral::MPU::PTR` for the bank of the current security state,
//! or [`MPU_NS_PTR`] to reach the non-secure bank from secure code.
//!
//! The [`sau`] module covers the Security Attribution Unit, which
//! `cortex-m` 0.7 only exposes on some targets.
//!
//! Everything here is ARM-only; on other targets the crate is empty.

#![no_std]
#![cfg(target_arch = "arm")]

use cortex_m::peripheral::mpu::RegisterBlock;

/// Non-secure alias of the MPU, visible to secure code only.
pub const MPU_NS_PTR: *const RegisterBlock = 0xE002_ED90 as *const _;

/// Disable the MPU and use the default memory map
///
/// The default memory map applies to accesses from both privileged and
/// unprivileged software.
///
/// This is the same behavior as when the MPU is not implemented.
pub unsafe fn disable_mpu(mpu: &RegisterBlock) {
    const DISABLE: u32 = 0b000;

    // From the ARMv8m MPU manual
    //
    // Any outstanding memory transactions must be forced to complete by
    // executing a DMB instruction and the MPU disabled before it can be
    // configured
    cortex_m::asm::dmb();
    mpu.ctrl.write(DISABLE);
}

/// Enable the MPU and set the default memory map as background region for privileged
/// software access if `privileged_default_memmap_access` is set to true.
///
/// If no regions are configured for the MPU, and
/// `privileged_default_memmap_access == true`, then only privileged software
/// may run.
///
/// If `privileged_default_memmap_access == false` then any memory access to a
/// location not covered by a configure region will cause a fault, regardless
/// of whether that access is made by by privileged software or not.
pub unsafe fn enable_mpu(
    mpu: &RegisterBlock,
    privileged_default_memmap_access: bool,
) {
    const ENABLE: u32 = 0b001;
    let privdefena: u32 = if privileged_default_memmap_access {
        0b100
    } else {
        0b000
    };

    mpu.ctrl.write(ENABLE | privdefena);
    // From the ARMv8m MPU manual
    //
    // The final step is to enable the MPU by writing to MPU_CTRL. Code
    // should then execute a memory barrier to ensure that the register
    // updates are seen by any subsequent memory accesses. An Instruction
    // Synchronization Barrier (ISB) ensures the updated configuration
    // [is] used by any subsequent instructions.
    cortex_m::asm::dmb();
    cortex_m::asm::isb();
}

/// Loads one region slot. The MPU must be disabled; RBAR and RLAR cannot be
/// written together, and a live MPU would briefly see a mismatched pair.
pub unsafe fn write_region(mpu: &RegisterBlock, rnr: u32, rbar: u32, rlar: u32) {
    mpu.rnr.write(rnr);
    mpu.rbar.write(rbar);
    mpu.rlar.write(rlar);
}

/// Loads both MAIR registers. Bytes 0-3 land in MAIR0 in little-endian order,
/// 4-7 in MAIR1.
pub unsafe fn set_mair(mpu: &RegisterBlock, mairs: [u8; 8]) {
    let [a, b, c, d, e, f, g, h] = mairs;
    mpu.mair[0].write(u32::from_le_bytes([a, b, c, d]));
    mpu.mair[1].write(u32::from_le_bytes([e, f, g, h]));
}

/// Number of region slots the MPU implements, from MPU_TYPE.DREGION.
pub fn region_count(mpu: &RegisterBlock) -> u32 {
    (mpu._type.read() >> 8) & 0xFF
}

pub mod sau {
    //! Security Attribution Unit.
    //!
    //! Regions are loaded with the SAU disabled and then switched on with
    //! [`enable`]. Addresses not covered by an enabled region are secure.

    use core::ptr::{read_volatile, write_volatile};

    const CTRL: *mut u32 = 0xE000_EDD0 as *mut u32;
    const TYPE: *const u32 = 0xE000_EDD4 as *const u32;
    const RNR: *mut u32 = 0xE000_EDD8 as *mut u32;
    const RBAR: *mut u32 = 0xE000_EDDC as *mut u32;
    const RLAR: *mut u32 = 0xE000_EDE0 as *mut u32;

    const CTRL_ENABLE: u32 = 1 << 0;
    const RLAR_ENABLE: u32 = 1 << 0;
    const RLAR_NSC: u32 = 1 << 1;

    /// Number of regions the SAU implements. Zero means there is no SAU
    /// (or TrustZone is not implemented at all).
    pub unsafe fn region_count() -> u8 {
        (read_volatile(TYPE) & 0xFF) as u8
    }

    pub unsafe fn disable() {
        cortex_m::asm::dmb();
        write_volatile(CTRL, 0);
    }

    pub unsafe fn enable() {
        write_volatile(CTRL, CTRL_ENABLE);
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    /// Programs region `rnr` to cover `base..=limit` (both 32-byte granular).
    /// `nsc` selects non-secure-callable instead of non-secure.
    pub unsafe fn write_region(rnr: u32, base: u32, limit: u32, nsc: bool) {
        write_volatile(RNR, rnr);
        write_volatile(RBAR, base & !0x1F);
        let mut rlar = (limit & !0x1F) | RLAR_ENABLE;
        if nsc {
            rlar |= RLAR_NSC;
        }
        write_volatile(RLAR, rlar);
    }

    pub unsafe fn clear_region(rnr: u32) {
        write_volatile(RNR, rnr);
        write_volatile(RLAR, 0);
    }
}
