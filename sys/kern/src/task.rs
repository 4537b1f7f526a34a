// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use core::ffi::c_void;

use abi::{
    Affinity, CoreId, DeadlineInfo, DeadlineKind, FaultReason, Priority,
    TaskId, TaskInfo, TaskKind, TaskState, MAX_TASKS_PER_CORE, TASK_NAME_LEN,
};

use crate::arch::Hardware;
use crate::err::{SchedError, SpinlockError};
use crate::kernel::Kernel;
use crate::spinlock::Save;
use crate::time::Timestamp;
use crate::util::FixedName;

/// Something a task can run.
///
/// Implemented for any `Fn(&TaskContext<'_, H>) + Sync` closure, which is the
/// usual way to write a task: whatever state the task needs is captured by
/// the closure, and so lives exactly as long as the task's entry.
pub trait Runnable<H: Hardware>: Sync {
    fn run(&self, cx: &TaskContext<'_, H>);
}

impl<H: Hardware, F> Runnable<H> for F
where
    F: Fn(&TaskContext<'_, H>) + Sync,
{
    fn run(&self, cx: &TaskContext<'_, H>) {
        self(cx)
    }
}

/// Opaque parameter pointer handed to a foreign entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Params(pub *mut c_void);

// The kernel never dereferences the pointer; it only hands it back to the
// entry that came with it, on whichever core the task is placed on. Making
// that safe is the foreign caller's contract.
unsafe impl Send for Params {}
unsafe impl Sync for Params {}

impl Params {
    pub const NULL: Self = Self(core::ptr::null_mut());
}

/// A task's entry point.
pub enum Entry<H: Hardware> {
    Native(&'static dyn Runnable<H>),
    /// A C function and its parameter pointer, as passed through the C ABI.
    Foreign {
        func: extern "C" fn(*mut c_void),
        params: Params,
    },
}

impl<H: Hardware> Clone for Entry<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for Entry<H> {}

impl<H: Hardware> Entry<H> {
    fn params(&self) -> Params {
        match self {
            Entry::Native(_) => Params::NULL,
            Entry::Foreign { params, .. } => *params,
        }
    }

    fn invoke(&self, cx: &TaskContext<'_, H>) {
        match self {
            Entry::Native(r) => r.run(cx),
            Entry::Foreign { func, params } => func(params.0),
        }
    }
}

/// Called with the id of a task that missed its deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MissHandler {
    Native(fn(TaskId)),
    Foreign(extern "C" fn(i32)),
}

impl MissHandler {
    pub(crate) fn call(self, task: TaskId) {
        match self {
            MissHandler::Native(f) => f(task),
            MissHandler::Foreign(f) => f(task.to_raw()),
        }
    }
}

/// Deadline record of a task.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Deadline {
    pub kind: DeadlineKind,
    pub period_ms: u32,
    pub deadline_ms: u32,
    pub budget_us: u32,
    pub misses: u32,
    pub budget_overruns: u32,
    pub last_start: Timestamp,
    pub last_completion: Timestamp,
    pub handler: Option<MissHandler>,
}

impl Deadline {
    pub const NONE: Self = Self {
        kind: DeadlineKind::None,
        period_ms: 0,
        deadline_ms: 0,
        budget_us: 0,
        misses: 0,
        budget_overruns: 0,
        last_start: Timestamp::ZERO,
        last_completion: Timestamp::ZERO,
        handler: None,
    };

    /// Wake time for the next period, for periodic tasks.
    pub fn next_release(&self) -> Option<Timestamp> {
        (self.kind != DeadlineKind::None && self.period_ms != 0)
            .then(|| self.last_start.plus_ms(self.period_ms))
    }

    pub fn info(&self) -> DeadlineInfo {
        let mut info = DeadlineInfo::new(self.kind, self.handler.is_some());
        info.last_start_us = self.last_start.as_us();
        info.last_completion_us = self.last_completion.as_us();
        info.period_ms = self.period_ms;
        info.deadline_ms = self.deadline_ms;
        info.budget_us = self.budget_us;
        info.misses = self.misses;
        info.budget_overruns = self.budget_overruns;
        info
    }
}

/// Task control block.
pub(crate) struct Tcb<H: Hardware> {
    pub id: TaskId,
    pub name: FixedName<TASK_NAME_LEN>,
    pub entry: Option<Entry<H>>,
    pub stack_base: u32,
    pub stack_size: u32,
    pub priority: Priority,
    pub kind: TaskKind,
    pub affinity: Affinity,
    pub state: TaskState,

    pub run_count: u32,
    pub total_runtime_us: u64,
    pub last_run_time_us: u64,
    pub deadline: Deadline,

    /// Load the task's MPU configuration when dispatching it.
    pub mpu_enabled: bool,
    /// Load the task's TrustZone configuration when dispatching it.
    pub tz_configured: bool,
    pub is_secure: bool,
    pub fault_count: u32,
    pub fault_reason: FaultReason,

    /// Set by a task-local delay; the task is Blocked until then.
    pub wake_at: Option<Timestamp>,
    /// Suspension requested while the task was running.
    pub suspend_pending: bool,
}

impl<H: Hardware> Clone for Tcb<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for Tcb<H> {}

impl<H: Hardware> Tcb<H> {
    pub const EMPTY: Self = Self {
        id: TaskId::NONE,
        name: FixedName::EMPTY,
        entry: None,
        stack_base: 0,
        stack_size: 0,
        priority: Priority::Idle,
        kind: TaskKind::OneShot,
        affinity: Affinity::Any,
        state: TaskState::Inactive,
        run_count: 0,
        total_runtime_us: 0,
        last_run_time_us: 0,
        deadline: Deadline::NONE,
        mpu_enabled: false,
        tz_configured: false,
        is_secure: false,
        fault_count: 0,
        fault_reason: FaultReason::None,
        wake_at: None,
        suspend_pending: false,
    };

    pub fn is_live(&self) -> bool {
        self.state != TaskState::Inactive
    }

    pub fn is_ready_on(&self, core: CoreId) -> bool {
        self.state == TaskState::Ready && self.affinity.allows(core)
    }

    pub fn fault(&mut self, reason: FaultReason) {
        self.fault_count = self.fault_count.saturating_add(1);
        self.fault_reason = reason;
    }

    pub fn info(&self, core: CoreId) -> TaskInfo {
        TaskInfo {
            total_runtime_us: self.total_runtime_us,
            last_run_time_us: self.last_run_time_us,
            id: self.id.0,
            stack_base: self.stack_base,
            stack_size: self.stack_size,
            run_count: self.run_count,
            fault_count: self.fault_count,
            deadline_misses: self.deadline.misses,
            name: self.name.to_padded(),
            priority: self.priority as u8,
            kind: self.kind as u8,
            affinity: self.affinity as i8,
            state: self.state as u8,
            core: core as u8,
            mpu_enabled: self.mpu_enabled as u8,
            is_secure: self.is_secure as u8,
            fault_reason: self.fault_reason as u8,
        }
    }
}

/// One core's task slots and dispatch bookkeeping.
pub(crate) struct TaskTable<H: Hardware> {
    pub slots: [Tcb<H>; MAX_TASKS_PER_CORE],
    /// Task the dispatch loop will run next, or is running.
    pub current: Option<usize>,
    /// Task whose entry is executing right now.
    pub in_flight: Option<usize>,
    /// Where the next round-robin scan starts from (exclusive).
    pub last_scheduled: usize,
    /// Rescan once the in-flight task returns, rather than rerunning it.
    pub reschedule: bool,
    pub context_switches: u32,
}

impl<H: Hardware> TaskTable<H> {
    pub const fn new() -> Self {
        Self {
            slots: [Tcb::EMPTY; MAX_TASKS_PER_CORE],
            current: None,
            in_flight: None,
            last_scheduled: MAX_TASKS_PER_CORE - 1,
            reschedule: false,
            context_switches: 0,
        }
    }

    pub fn find(&self, id: TaskId) -> Option<usize> {
        if !id.is_some() {
            return None;
        }
        self.slots.iter().position(|t| t.is_live() && t.id == id)
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|t| !t.is_live())
    }

    /// Chooses the task `core` should run next, and remembers it as the
    /// starting point of the next round-robin scan.
    pub fn select_next(&mut self, core: CoreId) -> Option<usize> {
        let (index, _) =
            priority_scan(self.last_scheduled, &self.slots, |t| t.is_ready_on(core))?;
        self.last_scheduled = index;
        Some(index)
    }

    /// Makes `index` the current task. Returns whether that was a switch.
    pub fn install(&mut self, index: usize) -> bool {
        uassert!(index < MAX_TASKS_PER_CORE);
        if self.current == Some(index) {
            return false;
        }
        self.current = Some(index);
        self.context_switches = self.context_switches.wrapping_add(1);
        true
    }

    /// Moves Blocked tasks whose wake time has passed back to Ready.
    pub fn wake_sleepers(&mut self, now: Timestamp) {
        for t in self.slots.iter_mut() {
            if t.state == TaskState::Blocked && t.wake_at.map_or(true, |w| w <= now) {
                t.wake_at = None;
                t.state = TaskState::Ready;
            }
        }
    }

    /// Frees slot `index`.
    pub fn vacate(&mut self, index: usize) {
        self.slots[index] = Tcb::EMPTY;
        if self.current == Some(index) {
            self.current = None;
        }
    }
}

/// Scans the task table to find a prioritized candidate.
///
/// Scans `tasks` for the next task, after `previous`, that satisfies `pred`.
/// If more than one task satisfies `pred`, returns the most important one. If
/// multiple tasks with the same priority satisfy `pred`, prefers the first
/// one in order after `previous`, mod `tasks.len()`. Finally, if no tasks
/// satisfy `pred`, returns `None`.
///
/// This is both passes of the dispatch decision at once: the highest ready
/// priority wins, and round-robin order breaks ties within it.
pub(crate) fn priority_scan<H: Hardware>(
    previous: usize,
    tasks: &[Tcb<H>],
    pred: impl Fn(&Tcb<H>) -> bool,
) -> Option<(usize, &Tcb<H>)> {
    let mut pos = previous;
    let mut choice: Option<(usize, &Tcb<H>)> = None;
    for _step_no in 0..tasks.len() {
        pos = pos.wrapping_add(1);
        if pos >= tasks.len() {
            pos = 0;
        }
        let t = &tasks[pos];
        if !pred(t) {
            continue;
        }

        if let Some((_, best_task)) = choice {
            if !t.priority.is_more_important_than(best_task.priority) {
                continue;
            }
        }

        choice = Some((pos, t));
    }

    choice
}

/// Everything needed to create a task.
pub struct TaskDef<'a, H: Hardware> {
    pub name: &'a str,
    pub entry: Entry<H>,
    pub stack_size: u32,
    pub priority: Priority,
    pub affinity: Affinity,
    pub kind: TaskKind,
}

impl<'a, H: Hardware> TaskDef<'a, H> {
    /// A persistent, normal-priority task that may run on either core.
    pub fn new(name: &'a str, runnable: &'static dyn Runnable<H>) -> Self {
        Self {
            name,
            entry: Entry::Native(runnable),
            stack_size: 1024,
            priority: Priority::Normal,
            affinity: Affinity::Any,
            kind: TaskKind::Persistent,
        }
    }

    pub fn priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn affinity(self, affinity: Affinity) -> Self {
        Self { affinity, ..self }
    }

    pub fn kind(self, kind: TaskKind) -> Self {
        Self { kind, ..self }
    }

    pub fn stack_size(self, stack_size: u32) -> Self {
        Self { stack_size, ..self }
    }
}

/// What a running task gets to see of the kernel.
pub struct TaskContext<'a, H: Hardware> {
    kernel: &'a Kernel<H>,
    id: TaskId,
    core: CoreId,
    params: Params,
}

impl<'a, H: Hardware> TaskContext<'a, H> {
    pub(crate) fn new(kernel: &'a Kernel<H>, id: TaskId, core: CoreId, entry: &Entry<H>) -> Self {
        Self {
            kernel,
            id,
            core,
            params: entry.params(),
        }
    }

    pub(crate) fn invoke(&self, entry: &Entry<H>) {
        entry.invoke(self)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn params(&self) -> *mut c_void {
        self.params.0
    }

    pub fn kernel(&self) -> &'a Kernel<H> {
        self.kernel
    }

    pub fn now_us(&self) -> u64 {
        self.kernel.hw().now_us()
    }

    /// Asks for a peer to be dispatched after this invocation returns.
    pub fn yield_now(&self) {
        // Only fails outside a task, and we're in one.
        self.kernel.yield_now().ok();
    }

    /// Blocks this task for `ms` once the current invocation returns; the
    /// core runs other tasks meanwhile.
    pub fn delay(&self, ms: u32) {
        self.kernel.delay(ms).ok();
    }

    /// Stalls the whole core for `ms`.
    pub fn delay_blocking(&self, ms: u32) {
        self.kernel.delay_blocking(ms);
    }

    /// Takes broker lock `id` on behalf of this task.
    pub fn acquire(&self, id: u8) -> Result<Save, SpinlockError> {
        self.kernel.spinlocks().acquire(id, self.id)
    }

    pub fn release(&self, id: u8, save: Save) -> Result<(), SpinlockError> {
        self.kernel.spinlocks().release(id, save)
    }

    /// Suspends this task once the current invocation returns.
    pub fn suspend(&self) -> Result<(), SchedError> {
        self.kernel.suspend_task(self.id)
    }
}
