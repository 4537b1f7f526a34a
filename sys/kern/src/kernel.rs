// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object and its lifecycle.
//!
//! A `Kernel` is normally a `static`:
//!
//! ```ignore
//! static KERNEL: Kernel<Rp2350> = Kernel::new(Rp2350::new(), KernelConfig::DEFAULT);
//! ```
//!
//! Boot then goes `KERNEL.init()`, `KERNEL.create_task(..)` as needed,
//! `KERNEL.start()`, and finally `KERNEL.dispatch_loop()` on core 0. Core 1
//! enters its own dispatch loop from `start`. The tick interrupt handler
//! calls `KERNEL.on_tick_interrupt()`.
//!
//! Lock ordering: a task table lock may be taken before the stats or trace
//! lock, never after, and no two task table locks are ever held together.
//! The broker, MPU and TZ locks are only taken with no scheduler lock held.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{CoreId, InitPhase, LockCategory, CORE_COUNT};

use crate::arch::{Hardware, CORE1_READY};
use crate::config::KernelConfig;
use crate::err::SchedError;
use crate::mpu::{Mpu, MpuManager};
use crate::spinlock::{SpinlockBroker, Spinlocks};
use crate::sync::{HwSpinLock, HwSpinLockGuard};
use crate::task::TaskTable;
use crate::trace::{Ringbuf, TraceEntry, TraceEvent, TRACE_DEPTH};
use crate::tz::{Tz, TzManager};

/// Counters that aren't per-core.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct KernelStats {
    /// Kept under a lock rather than in an atomic: ARMv8-M Mainline has no
    /// 64-bit atomics.
    pub tick_count: u64,
    pub task_creates: u32,
    pub task_deletes: u32,
    pub deadline_misses: u32,
    pub reclaimed_locks: u32,
}

impl KernelStats {
    const ZERO: Self = Self {
        tick_count: 0,
        task_creates: 0,
        task_deletes: 0,
        deadline_misses: 0,
        reclaimed_locks: 0,
    };
}

pub struct Kernel<H: Hardware> {
    pub(crate) hw: H,
    pub(crate) config: KernelConfig,
    pub(crate) broker: SpinlockBroker<H>,
    pub(crate) mpu: MpuManager,
    pub(crate) tz: TzManager,
    pub(crate) tables: [HwSpinLock<TaskTable<H>>; CORE_COUNT],
    pub(crate) stats: HwSpinLock<KernelStats>,
    pub(crate) next_id: AtomicU32,
    initialized: AtomicBool,
    pub(crate) running: AtomicBool,
    tracing: AtomicBool,
    trace: HwSpinLock<Ringbuf<TRACE_DEPTH>>,
}

impl<H: Hardware> Kernel<H> {
    pub const fn new(hw: H, config: KernelConfig) -> Self {
        Self {
            hw,
            config,
            broker: SpinlockBroker::new(),
            mpu: MpuManager::new(),
            tz: TzManager::new(),
            tables: [
                HwSpinLock::new(TaskTable::new()),
                HwSpinLock::new(TaskTable::new()),
            ],
            stats: HwSpinLock::new(KernelStats::ZERO),
            next_id: AtomicU32::new(1),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            tracing: AtomicBool::new(false),
            trace: HwSpinLock::new(Ringbuf::new()),
        }
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn spinlocks(&self) -> Spinlocks<'_, H> {
        Spinlocks::new(&self.broker, &self.hw)
    }

    pub fn mpu(&self) -> Mpu<'_, H> {
        Mpu::new(&self.mpu, &self.hw, self.spinlocks())
    }

    pub fn tz(&self) -> Tz<'_, H> {
        Tz::new(&self.tz, &self.hw, self.spinlocks())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn table(&self, core: CoreId) -> HwSpinLockGuard<'_, TaskTable<H>, H> {
        self.tables[core.index()].lock(&self.hw)
    }

    /// Brings up the broker (through `Tracking`, if nobody has yet), gives
    /// the scheduler its locks, and initializes the MPU and TZ managers.
    ///
    /// A missing MPU or security extension is logged and otherwise ignored:
    /// tasks then simply run unprotected.
    pub fn init(&self) -> Result<(), SchedError> {
        if self.is_initialized() {
            return Err(SchedError::AlreadyInitialized);
        }
        let locks = self.spinlocks();
        if locks.phase() < InitPhase::Core {
            locks.init_core()?;
        }
        if locks.phase() < InitPhase::Tracking {
            locks.init_tracking()?;
        }

        for (core, name) in CoreId::ALL.iter().zip(["sched-core0", "sched-core1"]) {
            let id = locks.allocate(LockCategory::Scheduler, name)?;
            self.tables[core.index()].bind(id);
        }
        self.stats
            .bind(locks.allocate(LockCategory::Scheduler, "sched-stats")?);
        self.trace
            .bind(locks.allocate(LockCategory::Debug, "kernel-trace")?);

        if let Err(e) = self.mpu().init() {
            klog!("sched: running without memory protection: {}", e);
        }
        if let Err(e) = self.tz().init() {
            klog!("sched: running without trustzone: {}", e);
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Starts the tick and launches core 1 into its dispatch loop.
    pub fn start(&'static self) -> Result<(), SchedError> {
        if !self.is_initialized() {
            return Err(SchedError::NotInitialized);
        }
        if self.is_running() {
            return Err(SchedError::AlreadyRunning);
        }
        if !self.hw.tick_start(self.config.tick_period_us()) {
            return Err(SchedError::TimerUnavailable);
        }

        self.hw
            .launch_core1(core1_main::<H>, self as *const Self as usize);
        match self.hw.fifo_pop_timeout(self.config.core1_ready_timeout_us) {
            Some(CORE1_READY) => (),
            other => {
                klog!("sched: core 1 did not come up ({:?})", other);
                self.hw.tick_stop();
                self.hw.reset_core1();
                return Err(SchedError::Core1Timeout);
            }
        }

        self.running.store(true, Ordering::Release);
        self.trace_event(line!(), TraceEvent::Started);
        self.hw.send_event();
        Ok(())
    }

    /// Stops the tick and core 1. Whatever task is mid-invocation on either
    /// core finishes that invocation.
    pub fn stop(&self) -> Result<(), SchedError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedError::NotRunning);
        }
        self.hw.tick_stop();
        self.hw.reset_core1();
        self.trace_event(line!(), TraceEvent::Stopped);
        Ok(())
    }

    /// Runs tasks on the calling core forever.
    pub fn dispatch_loop(&self) -> ! {
        loop {
            if !self.run_pending_tasks() {
                self.hw.wait_for_event();
            }
        }
    }

    /// Body of the tick interrupt handler.
    pub fn on_tick_interrupt(&self) {
        self.hw.tick_ack();
        self.tick();
    }

    pub fn enable_tracing(&self, on: bool) {
        self.tracing.store(on, Ordering::Release);
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing.load(Ordering::Acquire)
    }

    /// Copies the trace, oldest entry first, into `out`.
    pub fn trace_snapshot(&self, out: &mut [TraceEntry]) -> usize {
        self.trace.lock(&self.hw).snapshot(out)
    }

    pub fn clear_trace(&self) {
        self.trace.lock(&self.hw).clear();
    }

    pub(crate) fn trace_event(&self, line: u32, event: TraceEvent) {
        if self.is_tracing() {
            self.trace.lock(&self.hw).entry(line as u16, event);
        }
    }
}

/// Where core 1 starts. `arg` is the kernel's address.
fn core1_main<H: Hardware>(arg: usize) -> ! {
    // Safety: `start` passes a `&'static Kernel<H>`.
    let kernel = unsafe { &*(arg as *const Kernel<H>) };
    kernel.hw.fifo_push(CORE1_READY);
    kernel.dispatch_loop()
}
