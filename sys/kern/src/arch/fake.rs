// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated hardware, for running the kernel on a development machine.
//!
//! Nothing here runs code on a second core. Tests play both cores from one
//! thread by switching the reported core with [`FakeHardware::set_core`] and
//! calling the kernel's per-core entry points. Core 1's "launch" just reports
//! ready through the FIFO, as the real trampoline would.
//!
//! Time only moves when told to: by [`FakeHardware::advance_us`], by
//! `delay_us`, or by a FIFO wait timing out.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use abi::{CoreId, SecurityState, CORE_COUNT, MPU_REGIONS_PER_TASK};
use num_traits::FromPrimitive;

use super::{Core1Entry, Hardware, SauRegion, CORE1_READY};

const SAU_REGIONS: usize = 8;
const FIFO_VALID: u64 = 1 << 32;

const LIMIT_ENABLE: u32 = 1 << 0;
const LIMIT_NSC: u32 = 1 << 1;

struct RegionRegs {
    rbar: AtomicU32,
    rlar: AtomicU32,
}

impl RegionRegs {
    const fn new() -> Self {
        Self {
            rbar: AtomicU32::new(0),
            rlar: AtomicU32::new(0),
        }
    }
}

/// One MPU bank's registers.
struct MpuBank {
    ctrl: AtomicU32,
    regions: [RegionRegs; MPU_REGIONS_PER_TASK],
    mair: AtomicU64,
}

impl MpuBank {
    const fn new() -> Self {
        Self {
            ctrl: AtomicU32::new(0),
            regions: [const { RegionRegs::new() }; MPU_REGIONS_PER_TASK],
            mair: AtomicU64::new(0),
        }
    }
}

pub struct FakeHardware {
    clock_us: AtomicU64,
    core: AtomicU8,
    locks: AtomicU32,
    irq_masked: [AtomicBool; CORE_COUNT],

    mpu_present: AtomicBool,
    mpu_secure: MpuBank,
    mpu_nonsecure: MpuBank,
    mpu_region_writes: AtomicU32,

    tz_present: AtomicBool,
    sau: [RegionRegs; SAU_REGIONS],
    sau_enabled: AtomicBool,
    security: [AtomicU8; CORE_COUNT],

    tick_works: AtomicBool,
    tick_period_us: AtomicU32,
    tick_acks: AtomicU32,

    core1_answers: AtomicBool,
    core1_launches: AtomicU32,
    core1_resets: AtomicU32,
    fifo: AtomicU64,
}

impl FakeHardware {
    /// Hardware with an MPU, TrustZone, a working timer and a cooperative
    /// core 1, at time zero, running on core 0.
    pub const fn new() -> Self {
        Self {
            clock_us: AtomicU64::new(0),
            core: AtomicU8::new(CoreId::Core0 as u8),
            locks: AtomicU32::new(0),
            irq_masked: [const { AtomicBool::new(false) }; CORE_COUNT],
            mpu_present: AtomicBool::new(true),
            mpu_secure: MpuBank::new(),
            mpu_nonsecure: MpuBank::new(),
            mpu_region_writes: AtomicU32::new(0),
            tz_present: AtomicBool::new(true),
            sau: [const { RegionRegs::new() }; SAU_REGIONS],
            sau_enabled: AtomicBool::new(false),
            security: [const { AtomicU8::new(SecurityState::Secure as u8) };
                CORE_COUNT],
            tick_works: AtomicBool::new(true),
            tick_period_us: AtomicU32::new(0),
            tick_acks: AtomicU32::new(0),
            core1_answers: AtomicBool::new(true),
            core1_launches: AtomicU32::new(0),
            core1_resets: AtomicU32::new(0),
            fifo: AtomicU64::new(0),
        }
    }

    /// Chooses which core subsequent calls appear to come from.
    pub fn set_core(&self, core: CoreId) {
        self.core.store(core as u8, Ordering::Relaxed);
    }

    pub fn advance_us(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }

    pub fn set_time_us(&self, us: u64) {
        self.clock_us.store(us, Ordering::Relaxed);
    }

    pub fn set_mpu_present(&self, present: bool) {
        self.mpu_present.store(present, Ordering::Relaxed);
    }

    pub fn set_tz_present(&self, present: bool) {
        self.tz_present.store(present, Ordering::Relaxed);
    }

    /// Makes `tick_start` fail.
    pub fn break_timer(&self) {
        self.tick_works.store(false, Ordering::Relaxed);
    }

    /// Makes core 1 ignore launches.
    pub fn silence_core1(&self) {
        self.core1_answers.store(false, Ordering::Relaxed);
    }

    pub fn is_locked(&self, id: u8) -> bool {
        self.locks.load(Ordering::Relaxed) & (1 << id) != 0
    }

    pub fn interrupts_enabled(&self, core: CoreId) -> bool {
        !self.irq_masked[core.index()].load(Ordering::Relaxed)
    }

    /// `Some(privdefena)` if the (secure) MPU is enabled.
    pub fn mpu_enabled(&self) -> Option<bool> {
        let ctrl = self.mpu_secure.ctrl.load(Ordering::Relaxed);
        (ctrl & 1 != 0).then_some(ctrl & 0b100 != 0)
    }

    /// `(rbar, rlar)` of a region slot.
    pub fn mpu_region(&self, rnr: usize, non_secure: bool) -> (u32, u32) {
        let r = &self.bank(non_secure).regions[rnr];
        (r.rbar.load(Ordering::Relaxed), r.rlar.load(Ordering::Relaxed))
    }

    pub fn mpu_mair(&self, non_secure: bool) -> [u8; 8] {
        self.bank(non_secure).mair.load(Ordering::Relaxed).to_le_bytes()
    }

    /// Number of region slots written since reset, across both banks.
    pub fn mpu_region_writes(&self) -> u32 {
        self.mpu_region_writes.load(Ordering::Relaxed)
    }

    pub fn sau_region(&self, rnr: usize) -> Option<SauRegion> {
        let r = &self.sau[rnr];
        let limit = r.rlar.load(Ordering::Relaxed);
        (limit & LIMIT_ENABLE != 0).then(|| SauRegion {
            base: r.rbar.load(Ordering::Relaxed),
            limit: limit | 0x1F,
            nsc: limit & LIMIT_NSC != 0,
        })
    }

    pub fn sau_enabled(&self) -> bool {
        self.sau_enabled.load(Ordering::Relaxed)
    }

    /// Tick period, if the tick is running.
    pub fn tick_period_us(&self) -> Option<u32> {
        let p = self.tick_period_us.load(Ordering::Relaxed);
        (p != 0).then_some(p)
    }

    pub fn tick_acks(&self) -> u32 {
        self.tick_acks.load(Ordering::Relaxed)
    }

    pub fn core1_launches(&self) -> u32 {
        self.core1_launches.load(Ordering::Relaxed)
    }

    pub fn core1_resets(&self) -> u32 {
        self.core1_resets.load(Ordering::Relaxed)
    }

    fn bank(&self, non_secure: bool) -> &MpuBank {
        if non_secure {
            &self.mpu_nonsecure
        } else {
            &self.mpu_secure
        }
    }
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for FakeHardware {
    fn core_id(&self) -> CoreId {
        CoreId::from_u8(self.core.load(Ordering::Relaxed))
            .unwrap_or(CoreId::Core0)
    }

    fn now_us(&self) -> u64 {
        self.clock_us.load(Ordering::Relaxed)
    }

    fn delay_us(&self, us: u32) {
        self.advance_us(u64::from(us));
    }

    fn disable_interrupts(&self) -> u32 {
        let core = self.core_id().index();
        let was_masked = self.irq_masked[core].swap(true, Ordering::Relaxed);
        u32::from(!was_masked)
    }

    fn restore_interrupts(&self, saved: u32) {
        if saved != 0 {
            let core = self.core_id().index();
            self.irq_masked[core].store(false, Ordering::Relaxed);
        }
    }

    fn spinlock_try_lock(&self, id: u8) -> bool {
        let bit = 1 << id;
        self.locks.fetch_or(bit, Ordering::Acquire) & bit == 0
    }

    fn spinlock_unlock(&self, id: u8) {
        self.locks.fetch_and(!(1 << id), Ordering::Release);
    }

    fn mpu_present(&self) -> bool {
        self.mpu_present.load(Ordering::Relaxed)
    }

    fn mpu_disable(&self) {
        self.mpu_secure.ctrl.store(0, Ordering::Relaxed);
        self.mpu_nonsecure.ctrl.store(0, Ordering::Relaxed);
    }

    fn mpu_enable(&self, privdefena: bool) {
        let ctrl = 1 | if privdefena { 0b100 } else { 0 };
        self.mpu_secure.ctrl.store(ctrl, Ordering::Relaxed);
        self.mpu_nonsecure.ctrl.store(ctrl, Ordering::Relaxed);
    }

    fn mpu_write_region(&self, rnr: u32, rbar: u32, rlar: u32, non_secure: bool) {
        let r = &self.bank(non_secure).regions[rnr as usize];
        r.rbar.store(rbar, Ordering::Relaxed);
        r.rlar.store(rlar, Ordering::Relaxed);
        self.mpu_region_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn mpu_set_mair(&self, mairs: [u8; 8], non_secure: bool) {
        self.bank(non_secure)
            .mair
            .store(u64::from_le_bytes(mairs), Ordering::Relaxed);
    }

    fn tz_present(&self) -> bool {
        self.tz_present.load(Ordering::Relaxed)
    }

    fn sau_region_count(&self) -> u8 {
        if self.tz_present() {
            SAU_REGIONS as u8
        } else {
            0
        }
    }

    fn sau_write_region(&self, rnr: u8, region: Option<SauRegion>) {
        let r = &self.sau[usize::from(rnr)];
        match region {
            Some(region) => {
                let mut limit = (region.limit & !0x1F) | LIMIT_ENABLE;
                if region.nsc {
                    limit |= LIMIT_NSC;
                }
                r.rbar.store(region.base & !0x1F, Ordering::Relaxed);
                r.rlar.store(limit, Ordering::Relaxed);
            }
            None => r.rlar.store(0, Ordering::Relaxed),
        }
    }

    fn sau_enable(&self, on: bool) {
        self.sau_enabled.store(on, Ordering::Relaxed);
    }

    fn security_state(&self, core: CoreId) -> SecurityState {
        SecurityState::from_u8(self.security[core.index()].load(Ordering::Relaxed))
            .unwrap_or(SecurityState::Transitional)
    }

    fn set_security_state(&self, core: CoreId, state: SecurityState) {
        self.security[core.index()].store(state as u8, Ordering::Relaxed);
    }

    fn tick_start(&self, period_us: u32) -> bool {
        if !self.tick_works.load(Ordering::Relaxed) || period_us == 0 {
            return false;
        }
        self.tick_period_us.store(period_us, Ordering::Relaxed);
        true
    }

    fn tick_ack(&self) {
        self.tick_acks.fetch_add(1, Ordering::Relaxed);
    }

    fn tick_stop(&self) {
        self.tick_period_us.store(0, Ordering::Relaxed);
    }

    fn launch_core1(&self, _entry: Core1Entry, _arg: usize) {
        self.core1_launches.fetch_add(1, Ordering::Relaxed);
        if self.core1_answers.load(Ordering::Relaxed) {
            self.fifo_push(CORE1_READY);
        }
    }

    fn reset_core1(&self) {
        self.core1_resets.fetch_add(1, Ordering::Relaxed);
        self.fifo.store(0, Ordering::Relaxed);
    }

    fn fifo_push(&self, value: u32) {
        self.fifo
            .store(FIFO_VALID | u64::from(value), Ordering::Release);
    }

    fn fifo_pop_timeout(&self, timeout_us: u32) -> Option<u32> {
        let word = self.fifo.swap(0, Ordering::Acquire);
        if word & FIFO_VALID != 0 {
            Some(word as u32)
        } else {
            self.advance_us(u64::from(timeout_us));
            None
        }
    }

    fn wait_for_event(&self) {}

    fn send_event(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinlocks_are_exclusive() {
        let hw = FakeHardware::new();
        assert!(hw.spinlock_try_lock(5));
        assert!(!hw.spinlock_try_lock(5));
        assert!(hw.spinlock_try_lock(6));
        hw.spinlock_unlock(5);
        assert!(hw.spinlock_try_lock(5));
    }

    #[test]
    fn interrupt_masking_nests() {
        let hw = FakeHardware::new();
        let outer = hw.disable_interrupts();
        let inner = hw.disable_interrupts();
        hw.restore_interrupts(inner);
        assert!(!hw.interrupts_enabled(CoreId::Core0));
        hw.restore_interrupts(outer);
        assert!(hw.interrupts_enabled(CoreId::Core0));
    }

    #[test]
    fn masking_is_per_core() {
        let hw = FakeHardware::new();
        let _saved = hw.disable_interrupts();
        hw.set_core(CoreId::Core1);
        assert!(hw.interrupts_enabled(CoreId::Core1));
        assert!(!hw.interrupts_enabled(CoreId::Core0));
    }

    #[test]
    fn silent_core1_times_out() {
        let hw = FakeHardware::new();
        hw.silence_core1();
        fn never(_: usize) -> ! {
            unreachable!()
        }
        hw.launch_core1(never, 0);
        assert_eq!(hw.fifo_pop_timeout(500), None);
        assert_eq!(hw.now_us(), 500);
    }
}
