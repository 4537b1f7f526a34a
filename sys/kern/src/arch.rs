// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! Unlike a single-target kernel, all hardware access here goes through the
//! [`Hardware`] trait, and the `Kernel` is generic over it. There are two
//! implementations:
//!
//! - `arm_m::Rp2350`, the real thing, only built for ARMv8-M bare metal;
//! - `fake::FakeHardware`, a simulation for running the kernel on a
//!   development machine, built everywhere else.
//!
//! Whichever one applies to the current target is also exported as
//! `DefaultHardware`.

use abi::{CoreId, SecurityState};

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(armv8m, target_os = "none"))] {
        pub mod arm_m;
        pub use arm_m::Rp2350 as DefaultHardware;
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("only ARMv8-M bare-metal targets are supported");
    } else {
        pub mod fake;
        pub use fake::FakeHardware as DefaultHardware;
    }
}

/// Value core 1 pushes through the inter-core FIFO once its dispatch loop is
/// up.
pub const CORE1_READY: u32 = 0xC0DE_0001;

/// Entry point for core 1. Gets the argument given to `launch_core1`.
pub type Core1Entry = fn(usize) -> !;

/// One SAU region, in byte addresses. `limit` is inclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SauRegion {
    pub base: u32,
    pub limit: u32,
    /// Non-secure callable rather than non-secure.
    pub nsc: bool,
}

/// Everything the kernel needs from the chip.
///
/// Methods take `&self` because both cores share one instance; an
/// implementation keeps whatever per-core state it needs in atomics.
pub trait Hardware: Sync + 'static {
    /// Which core is executing the call.
    fn core_id(&self) -> CoreId;

    /// Monotonic microseconds.
    fn now_us(&self) -> u64;

    /// Busy-waits.
    fn delay_us(&self, us: u32);

    /// Masks interrupts on the calling core, returning a token for
    /// `restore_interrupts` that records whether they were enabled.
    fn disable_interrupts(&self) -> u32;

    fn restore_interrupts(&self, saved: u32);

    /// Attempts to claim hardware spinlock `id`. Returns `true` on success.
    fn spinlock_try_lock(&self, id: u8) -> bool;

    fn spinlock_unlock(&self, id: u8);

    fn mpu_present(&self) -> bool;

    /// Disables the MPU (both security banks) ahead of reprogramming.
    fn mpu_disable(&self);

    /// Enables the MPU, with or without the default memory map as background
    /// for privileged code.
    fn mpu_enable(&self, privdefena: bool);

    /// Writes one region slot. `rlar == 0` disables the slot. `non_secure`
    /// selects the non-secure bank.
    fn mpu_write_region(&self, rnr: u32, rbar: u32, rlar: u32, non_secure: bool);

    fn mpu_set_mair(&self, mairs: [u8; 8], non_secure: bool);

    /// Checks whether the TrustZone security extension is implemented.
    fn tz_present(&self) -> bool;

    fn sau_region_count(&self) -> u8;

    /// Programs or (with `None`) disables SAU region `rnr`.
    fn sau_write_region(&self, rnr: u8, region: Option<SauRegion>);

    fn sau_enable(&self, on: bool);

    /// Security state `core` will run task code in.
    fn security_state(&self, core: CoreId) -> SecurityState;

    /// Records the security state `core` is attributed to. This is
    /// bookkeeping for the TZ manager and status queries; it does not branch
    /// into the other world.
    fn set_security_state(&self, core: CoreId, state: SecurityState);

    /// Starts the periodic tick interrupt. Returns `false` if the timer can't
    /// be set up.
    fn tick_start(&self, period_us: u32) -> bool;

    /// Acknowledges a tick interrupt and arms the next one.
    fn tick_ack(&self);

    fn tick_stop(&self);

    /// Starts core 1 running `entry(arg)`.
    fn launch_core1(&self, entry: Core1Entry, arg: usize);

    /// Holds core 1 in reset and releases it to wait for a new launch.
    fn reset_core1(&self);

    fn fifo_push(&self, value: u32);

    /// Pops a word from the inter-core FIFO, waiting at most `timeout_us`.
    fn fifo_pop_timeout(&self, timeout_us: u32) -> Option<u32>;

    /// Sleeps the calling core until an event or interrupt.
    fn wait_for_event(&self);

    /// Wakes any core sleeping in `wait_for_event`.
    fn send_event(&self);
}
