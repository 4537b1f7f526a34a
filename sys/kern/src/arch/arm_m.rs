// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RP2350, running both Cortex-M33 cores in the secure state.
//!
//! # Timer
//!
//! TIMER0 is a free-running 64-bit microsecond counter, which gives us
//! `now_us` for free. The tick uses its alarm 0, which interrupts core 0
//! only (`TIMER0_IRQ_0`); the board crate routes that interrupt to
//! `Kernel::on_tick_interrupt`. The alarm only compares the low 32 bits of
//! the counter, so each tick re-arms it one period past the *previous*
//! target rather than past "now", which keeps the tick from drifting when
//! the handler is late.
//!
//! # Core 1
//!
//! Out of reset, core 1 sits in the boot ROM waiting for a launch sequence
//! on the inter-core FIFO: `0, 0, 1, VTOR, SP, entry`, each word echoed
//! back. Any mismatch restarts the sequence. The entry we hand over is a
//! trampoline that picks up the real entry and its argument from statics.
//!
//! # Security state
//!
//! The cores run kernel code secure. Which state a core runs *task* code in
//! is decided by the TZ manager before each dispatch; we only record it
//! here, per core, for the manager to read back.

use core::cell::UnsafeCell;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use abi::{CoreId, SecurityState, MPU_REGIONS_PER_TASK};
use armv8_m_mpu::{sau, MPU_NS_PTR};
use cortex_m::peripheral::mpu::RegisterBlock as MpuRegisters;
use num_traits::FromPrimitive;

use super::{Core1Entry, Hardware, SauRegion};
use crate::time::Timestamp;

const SIO_BASE: u32 = 0xD000_0000;
const SIO_CPUID: u32 = SIO_BASE;
const SIO_FIFO_ST: u32 = SIO_BASE + 0x50;
const SIO_FIFO_WR: u32 = SIO_BASE + 0x54;
const SIO_FIFO_RD: u32 = SIO_BASE + 0x58;
const SIO_SPINLOCK0: u32 = SIO_BASE + 0x100;

const FIFO_ST_VLD: u32 = 1 << 0;
const FIFO_ST_RDY: u32 = 1 << 1;

const TIMER0_BASE: u32 = 0x400B_0000;
const TIMER_ALARM0: u32 = TIMER0_BASE + 0x10;
const TIMER_ARMED: u32 = TIMER0_BASE + 0x20;
const TIMER_TIMERAWH: u32 = TIMER0_BASE + 0x24;
const TIMER_TIMERAWL: u32 = TIMER0_BASE + 0x28;
const TIMER_INTR: u32 = TIMER0_BASE + 0x3C;
const TIMER_INTE: u32 = TIMER0_BASE + 0x40;
const TIMER_ALARM0_BIT: u32 = 1 << 0;
const TIMER0_IRQ_0: u32 = 0;

const PSM_FRCE_OFF: u32 = 0x4001_8004;
const PSM_PROC1: u32 = 1 << 24;
const ATOMIC_SET: u32 = 0x2000;
const ATOMIC_CLEAR: u32 = 0x3000;

const SCB_VTOR: u32 = 0xE000_ED08;

/// Words in core 1's startup stack. Core 1 only ever runs the dispatch loop
/// on it; tasks get their own stacks from the arena.
const CORE1_STACK_WORDS: usize = 2048;

#[inline(always)]
fn read_reg(addr: u32) -> u32 {
    // Safety: only called with the fixed register addresses above, which
    // are always mapped on this part.
    unsafe { read_volatile(addr as *const u32) }
}

#[inline(always)]
fn write_reg(addr: u32, value: u32) {
    // Safety: as for `read_reg`.
    unsafe { write_volatile(addr as *mut u32, value) }
}

fn secure_mpu() -> &'static MpuRegisters {
    // Safety: the MPU is a fixed, always-present register block; the kernel
    // only reprograms it from dispatch, under its own lock.
    unsafe { &*cortex_m::peripheral::MPU::PTR }
}

fn nonsecure_mpu() -> &'static MpuRegisters {
    // Safety: as above, through the secure alias of the non-secure bank.
    unsafe { &*MPU_NS_PTR }
}

#[repr(C, align(8))]
struct Core1Stack(UnsafeCell<[u32; CORE1_STACK_WORDS]>);

// Safety: only core 1 ever touches the contents, and only once launched.
unsafe impl Sync for Core1Stack {}

static CORE1_STACK: Core1Stack = Core1Stack(UnsafeCell::new([0; CORE1_STACK_WORDS]));
static CORE1_ENTRY: AtomicUsize = AtomicUsize::new(0);
static CORE1_ARG: AtomicUsize = AtomicUsize::new(0);

/// Where core 1 lands when the boot ROM lets go of it.
extern "C" fn core1_trampoline() -> ! {
    let raw = CORE1_ENTRY.load(Ordering::Acquire);
    let arg = CORE1_ARG.load(Ordering::Acquire);
    // Safety: `launch_core1` stores a `Core1Entry` here before starting the
    // launch sequence, and fn pointers are the size of `usize`.
    let entry: Core1Entry = unsafe { core::mem::transmute::<usize, Core1Entry>(raw) };
    entry(arg)
}

pub struct Rp2350 {
    security: [AtomicU8; 2],
    tick_period_us: AtomicU32,
    next_alarm: AtomicU32,
}

impl Rp2350 {
    pub const fn new() -> Self {
        Self {
            security: [
                AtomicU8::new(SecurityState::Secure as u8),
                AtomicU8::new(SecurityState::Secure as u8),
            ],
            tick_period_us: AtomicU32::new(0),
            next_alarm: AtomicU32::new(0),
        }
    }

    fn drain_fifo(&self) {
        while read_reg(SIO_FIFO_ST) & FIFO_ST_VLD != 0 {
            read_reg(SIO_FIFO_RD);
        }
    }

    fn fifo_pop_blocking(&self) -> u32 {
        while read_reg(SIO_FIFO_ST) & FIFO_ST_VLD == 0 {
            cortex_m::asm::wfe();
        }
        read_reg(SIO_FIFO_RD)
    }
}

impl Default for Rp2350 {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for Rp2350 {
    fn core_id(&self) -> CoreId {
        if read_reg(SIO_CPUID) == 0 {
            CoreId::Core0
        } else {
            CoreId::Core1
        }
    }

    fn now_us(&self) -> u64 {
        // The raw halves aren't latched together; retry if the high half
        // moved underneath us.
        loop {
            let hi = read_reg(TIMER_TIMERAWH);
            let lo = read_reg(TIMER_TIMERAWL);
            if read_reg(TIMER_TIMERAWH) == hi {
                return Timestamp::from([lo, hi]).as_us();
            }
        }
    }

    fn delay_us(&self, us: u32) {
        let start = read_reg(TIMER_TIMERAWL);
        while read_reg(TIMER_TIMERAWL).wrapping_sub(start) < us {}
    }

    fn disable_interrupts(&self) -> u32 {
        let was_enabled = cortex_m::register::primask::read().is_inactive();
        cortex_m::interrupt::disable();
        was_enabled as u32
    }

    fn restore_interrupts(&self, saved: u32) {
        if saved != 0 {
            // Safety: we're only re-enabling interrupts that were enabled
            // when the matching `disable_interrupts` ran.
            unsafe { cortex_m::interrupt::enable() }
        }
    }

    fn spinlock_try_lock(&self, id: u8) -> bool {
        // Reading a spinlock register claims it, returning nonzero, if it
        // was free.
        read_reg(SIO_SPINLOCK0 + 4 * u32::from(id)) != 0
    }

    fn spinlock_unlock(&self, id: u8) {
        cortex_m::asm::dmb();
        write_reg(SIO_SPINLOCK0 + 4 * u32::from(id), 1);
    }

    fn mpu_present(&self) -> bool {
        armv8_m_mpu::region_count(secure_mpu()) as usize >= MPU_REGIONS_PER_TASK
    }

    fn mpu_disable(&self) {
        // Safety: the caller is about to reprogram regions, and runs
        // privileged kernel code that the default map covers.
        unsafe {
            armv8_m_mpu::disable_mpu(secure_mpu());
            armv8_m_mpu::disable_mpu(nonsecure_mpu());
        }
    }

    fn mpu_enable(&self, privdefena: bool) {
        // Safety: regions were loaded with the MPU off.
        unsafe {
            armv8_m_mpu::enable_mpu(secure_mpu(), privdefena);
            armv8_m_mpu::enable_mpu(nonsecure_mpu(), privdefena);
        }
    }

    fn mpu_write_region(&self, rnr: u32, rbar: u32, rlar: u32, non_secure: bool) {
        let mpu = if non_secure { nonsecure_mpu() } else { secure_mpu() };
        // Safety: the MPU is disabled while regions are written.
        unsafe { armv8_m_mpu::write_region(mpu, rnr, rbar, rlar) }
    }

    fn mpu_set_mair(&self, mairs: [u8; 8], non_secure: bool) {
        let mpu = if non_secure { nonsecure_mpu() } else { secure_mpu() };
        // Safety: as for `mpu_write_region`.
        unsafe { armv8_m_mpu::set_mair(mpu, mairs) }
    }

    fn tz_present(&self) -> bool {
        self.sau_region_count() != 0
    }

    fn sau_region_count(&self) -> u8 {
        // Safety: SAU_TYPE is read-only and harmless to read.
        unsafe { sau::region_count() }
    }

    fn sau_write_region(&self, rnr: u8, region: Option<SauRegion>) {
        // Safety: the TZ manager writes regions with the SAU disabled.
        unsafe {
            match region {
                Some(r) => sau::write_region(u32::from(rnr), r.base, r.limit, r.nsc),
                None => sau::clear_region(u32::from(rnr)),
            }
        }
    }

    fn sau_enable(&self, on: bool) {
        // Safety: attribution only affects what non-secure code may touch;
        // the kernel itself runs secure.
        unsafe {
            if on {
                sau::enable();
            } else {
                sau::disable();
            }
        }
    }

    fn security_state(&self, core: CoreId) -> SecurityState {
        SecurityState::from_u8(self.security[core.index()].load(Ordering::Acquire))
            .unwrap_or(SecurityState::Transitional)
    }

    /// Only records the state. Task entries are still called from secure
    /// code with an ordinary branch, so a `NonSecure` task runs secure with
    /// the SAU and non-secure MPU bank set up for it; nothing here issues a
    /// `BLXNS`.
    fn set_security_state(&self, core: CoreId, state: SecurityState) {
        self.security[core.index()].store(state as u8, Ordering::Release);
    }

    fn tick_start(&self, period_us: u32) -> bool {
        if period_us == 0 {
            return false;
        }
        self.tick_period_us.store(period_us, Ordering::Relaxed);
        let target = read_reg(TIMER_TIMERAWL).wrapping_add(period_us);
        self.next_alarm.store(target, Ordering::Relaxed);

        write_reg(TIMER_INTR, TIMER_ALARM0_BIT);
        write_reg(TIMER_INTE + ATOMIC_SET, TIMER_ALARM0_BIT);
        write_reg(TIMER_ALARM0, target);

        let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
        // Safety: the tick handler is installed by the board crate before
        // the kernel is started.
        unsafe {
            nvic.icpr[0].write(1 << TIMER0_IRQ_0);
            nvic.iser[0].write(1 << TIMER0_IRQ_0);
        }
        true
    }

    fn tick_ack(&self) {
        write_reg(TIMER_INTR, TIMER_ALARM0_BIT);
        let period = self.tick_period_us.load(Ordering::Relaxed);
        if period == 0 {
            return;
        }
        let mut target = self.next_alarm.load(Ordering::Relaxed).wrapping_add(period);
        // If we've fallen a whole period behind, skip ahead rather than
        // arming an alarm that's already in the past.
        let now = read_reg(TIMER_TIMERAWL);
        if target.wrapping_sub(now) > period {
            target = now.wrapping_add(period);
        }
        self.next_alarm.store(target, Ordering::Relaxed);
        write_reg(TIMER_ALARM0, target);
    }

    fn tick_stop(&self) {
        self.tick_period_us.store(0, Ordering::Relaxed);
        let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
        // Safety: masking an interrupt can't break anything.
        unsafe { nvic.icer[0].write(1 << TIMER0_IRQ_0) }
        write_reg(TIMER_INTE + ATOMIC_CLEAR, TIMER_ALARM0_BIT);
        write_reg(TIMER_ARMED, TIMER_ALARM0_BIT);
        write_reg(TIMER_INTR, TIMER_ALARM0_BIT);
    }

    fn launch_core1(&self, entry: Core1Entry, arg: usize) {
        CORE1_ENTRY.store(entry as usize, Ordering::Release);
        CORE1_ARG.store(arg, Ordering::Release);

        let stack_top =
            CORE1_STACK.0.get() as u32 + (CORE1_STACK_WORDS * core::mem::size_of::<u32>()) as u32;
        let sequence = [
            0,
            0,
            1,
            read_reg(SCB_VTOR),
            stack_top,
            core1_trampoline as usize as u32,
        ];

        let mut i = 0;
        while i < sequence.len() {
            let cmd = sequence[i];
            if cmd == 0 {
                // Core 1 may have stale words queued for us.
                self.drain_fifo();
                cortex_m::asm::sev();
            }
            self.fifo_push(cmd);
            let response = self.fifo_pop_blocking();
            i = if response == cmd { i + 1 } else { 0 };
        }
    }

    fn reset_core1(&self) {
        write_reg(PSM_FRCE_OFF + ATOMIC_SET, PSM_PROC1);
        while read_reg(PSM_FRCE_OFF) & PSM_PROC1 == 0 {}
        write_reg(PSM_FRCE_OFF + ATOMIC_CLEAR, PSM_PROC1);
        // Back in the boot ROM, core 1 announces itself with a 0.
        self.fifo_pop_blocking();
    }

    fn fifo_push(&self, value: u32) {
        while read_reg(SIO_FIFO_ST) & FIFO_ST_RDY == 0 {}
        write_reg(SIO_FIFO_WR, value);
        cortex_m::asm::sev();
    }

    fn fifo_pop_timeout(&self, timeout_us: u32) -> Option<u32> {
        let start = read_reg(TIMER_TIMERAWL);
        while read_reg(SIO_FIFO_ST) & FIFO_ST_VLD == 0 {
            if read_reg(TIMER_TIMERAWL).wrapping_sub(start) >= timeout_us {
                return None;
            }
        }
        Some(read_reg(SIO_FIFO_RD))
    }

    fn wait_for_event(&self) {
        cortex_m::asm::wfe();
    }

    fn send_event(&self) {
        cortex_m::asm::sev();
    }
}
