// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! Everything here is fixed when the `Kernel` is constructed. The tick period
//! default comes from the build environment (`KERN_TICK_PERIOD_MS`, see
//! `build.rs`).

include!(concat!(env!("OUT_DIR"), "/consts.rs"));

/// What happens to a task that misses a `Hard` deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HardDeadlinePolicy {
    /// Count the miss and call the miss handler, same as a soft deadline.
    Report,
    /// Additionally suspend the task and record a fault against it.
    Suspend,
}

#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    /// Period of the scheduling tick.
    pub tick_period_ms: u32,
    pub hard_deadline_policy: HardDeadlinePolicy,
    /// Load a task's MPU configuration when dispatching it, if the task asked
    /// for protection. Turning this off leaves configurations stored but
    /// unapplied, which is occasionally useful under a debugger.
    pub enforce_mpu: bool,
    /// How long `start` waits for core 1 to report in.
    pub core1_ready_timeout_us: u32,
    /// Base of the SRAM area carved into per-task stacks. Slot `n` of core `c`
    /// gets the stack at `stack_arena_base + (c * 16 + n) * stack_slot_size`.
    pub stack_arena_base: u32,
    /// Size of each per-task stack slot, and so the largest stack a task can
    /// ask for. Must be a power of two so that the slot can be covered by a
    /// single MPU region.
    pub stack_slot_size: u32,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        tick_period_ms: DEFAULT_TICK_PERIOD_MS,
        hard_deadline_policy: HardDeadlinePolicy::Report,
        enforce_mpu: true,
        core1_ready_timeout_us: 100_000,
        stack_arena_base: 0x2004_0000,
        stack_slot_size: 0x1000,
    };

    pub fn tick_period_us(&self) -> u32 {
        self.tick_period_ms.saturating_mul(1000)
    }

    /// Stack region of a task slot.
    pub fn stack_for(&self, core: abi::CoreId, slot: usize) -> u32 {
        let index = core.index() * abi::MAX_TASKS_PER_CORE + slot;
        self.stack_arena_base + index as u32 * self.stack_slot_size
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::CoreId;

    #[test]
    fn default_tick_comes_from_build() {
        assert_eq!(KernelConfig::DEFAULT.tick_period_ms, DEFAULT_TICK_PERIOD_MS);
        assert_eq!(
            KernelConfig::DEFAULT.tick_period_us(),
            DEFAULT_TICK_PERIOD_MS * 1000
        );
    }

    #[test]
    fn stacks_do_not_collide() {
        let c = KernelConfig::DEFAULT;
        let last0 = c.stack_for(CoreId::Core0, 15);
        let first1 = c.stack_for(CoreId::Core1, 0);
        assert_eq!(first1 - last0, c.stack_slot_size);
        // The whole arena stays below the shared scratch banks.
        assert!(c.stack_for(CoreId::Core1, 15) + c.stack_slot_size <= 0x2008_0000);
    }
}
