// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Each core has a table of 16 task slots. Tasks never move between tables;
//! a task that may run anywhere lives on core 0.
//!
//! Two things drive scheduling:
//!
//! - The *tick* (`tick`), every 10 ms by default. It touches only state: it
//!   wakes sleepers and, for each core, picks the task that core should run
//!   next. Picking is a priority scan with round-robin among equals (see
//!   `task::priority_scan`), so peers of equal priority trade places at tick
//!   granularity.
//!
//! - Each core's *dispatch loop* (`run_pending_tasks`). This is the only
//!   place task code runs. A dispatch goes pick → apply MPU → apply TZ → run
//!   → account, with no kernel lock held across the run.
//!
//! If the tick comes around while a task is mid-invocation, that core is
//! left alone and its dispatcher picks again once the invocation returns.

use abi::{
    CoreId, DeadlineInfo, DeadlineKind, FaultReason, SchedulerStats,
    SecurityState, TaskId, TaskInfo, TaskKind, TaskState,
};

use crate::arch::Hardware;
use crate::config::HardDeadlinePolicy;
use crate::err::SchedError;
use crate::kernel::Kernel;
use crate::mpu;
use crate::sync::HwSpinLockGuard;
use crate::task::{Deadline, MissHandler, TaskContext, TaskDef, TaskTable, Tcb};
use crate::time::Timestamp;
use crate::trace::TraceEvent;
use crate::tz::{NsWindow, TzTaskConfig};
use crate::util::FixedName;

/// What's left to do once the dispatcher has dropped the table lock after an
/// invocation.
struct Aftermath {
    missed: Option<Option<MissHandler>>,
    overran: bool,
    completed: bool,
    suspended_for: Option<FaultReason>,
}

impl<H: Hardware> Kernel<H> {
    fn now(&self) -> Timestamp {
        Timestamp::from(self.hw.now_us())
    }

    /// Finds the table holding `id`, returning it locked.
    fn locate(
        &self,
        id: TaskId,
    ) -> Result<(CoreId, HwSpinLockGuard<'_, TaskTable<H>, H>, usize), SchedError> {
        for core in CoreId::ALL {
            let table = self.table(core);
            if let Some(index) = table.find(id) {
                return Ok((core, table, index));
            }
        }
        Err(SchedError::NotFound)
    }

    /// Applies `f` to `id`'s control block.
    fn with_task<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut Tcb<H>) -> Result<R, SchedError>,
    ) -> Result<R, SchedError> {
        let (_, mut table, index) = self.locate(id)?;
        f(&mut table.slots[index])
    }

    pub fn create_task(&self, def: TaskDef<'_, H>) -> Result<TaskId, SchedError> {
        if def.stack_size == 0 {
            return Err(SchedError::InvalidArgument);
        }
        if def.stack_size > self.config.stack_slot_size {
            return Err(SchedError::StackTooLarge);
        }
        let core = def.affinity.home_core();
        let id = {
            let mut table = self.table(core);
            let slot = table.first_free().ok_or(SchedError::NoFreeSlot)?;
            let id = TaskId(
                self.next_id
                    .fetch_add(1, core::sync::atomic::Ordering::Relaxed),
            );
            table.slots[slot] = Tcb {
                id,
                name: FixedName::new(def.name),
                entry: Some(def.entry),
                stack_base: self.config.stack_for(core, slot),
                stack_size: def.stack_size,
                priority: def.priority,
                kind: def.kind,
                affinity: def.affinity,
                state: TaskState::Ready,
                ..Tcb::EMPTY
            };
            id
        };
        self.stats.lock(&self.hw).task_creates += 1;
        self.trace_event(line!(), TraceEvent::Created { task: id, core });
        self.hw.send_event();
        Ok(id)
    }

    /// Removes a task that isn't running. Locks it still holds are
    /// reclaimed and its protection settings are forgotten.
    pub fn delete_task(&self, id: TaskId) -> Result<(), SchedError> {
        {
            let (_, mut table, index) = self.locate(id)?;
            if table.in_flight == Some(index) {
                return Err(SchedError::TaskRunning);
            }
            table.vacate(index);
        }
        self.stats.lock(&self.hw).task_deletes += 1;
        self.trace_event(line!(), TraceEvent::Deleted(id));
        self.retire(id);
        Ok(())
    }

    /// Stops `id` from being dispatched. A task that is running right now
    /// finishes its current invocation first.
    pub fn suspend_task(&self, id: TaskId) -> Result<(), SchedError> {
        self.with_task(id, |t| {
            match t.state {
                TaskState::Ready | TaskState::Blocked => {
                    t.state = TaskState::Suspended;
                    t.wake_at = None;
                }
                TaskState::Running => t.suspend_pending = true,
                _ => return Err(SchedError::InvalidState),
            }
            Ok(())
        })?;
        self.trace_event(line!(), TraceEvent::Suspended(id));
        Ok(())
    }

    pub fn resume_task(&self, id: TaskId) -> Result<(), SchedError> {
        self.with_task(id, |t| {
            match t.state {
                TaskState::Suspended => t.state = TaskState::Ready,
                TaskState::Running if t.suspend_pending => {
                    t.suspend_pending = false
                }
                _ => return Err(SchedError::InvalidState),
            }
            Ok(())
        })?;
        self.trace_event(line!(), TraceEvent::Resumed(id));
        self.hw.send_event();
        Ok(())
    }

    /// Has the calling core pick a task afresh once the running task
    /// returns, so that a peer of the same priority goes next.
    pub fn yield_now(&self) -> Result<(), SchedError> {
        let mut table = self.table(self.hw.core_id());
        if table.in_flight.is_none() {
            return Err(SchedError::NoCurrentTask);
        }
        table.reschedule = true;
        Ok(())
    }

    /// From a task: blocks the task for `ms` after the current invocation
    /// returns, letting the core run others meanwhile. From outside any
    /// task: the same as `delay_blocking`.
    pub fn delay(&self, ms: u32) -> Result<(), SchedError> {
        let wake = self.now().plus_ms(ms);
        {
            let mut table = self.table(self.hw.core_id());
            if let Some(index) = table.in_flight {
                table.slots[index].wake_at = Some(wake);
                return Ok(());
            }
        }
        self.delay_blocking(ms);
        Ok(())
    }

    /// Busy-waits for `ms`, holding up the whole core.
    pub fn delay_blocking(&self, ms: u32) {
        let mut remaining = u64::from(ms) * 1000;
        while remaining != 0 {
            let step = remaining.min(u64::from(u32::MAX)) as u32;
            self.hw.delay_us(step);
            remaining -= u64::from(step);
        }
    }

    /// The task executing on the calling core, or else the one it will run
    /// next.
    pub fn get_current_task_id(&self) -> Option<TaskId> {
        let table = self.table(self.hw.core_id());
        table
            .in_flight
            .or(table.current)
            .map(|i| table.slots[i].id)
    }

    pub fn get_current_task(&self, core: CoreId) -> Option<TaskId> {
        let table = self.table(core);
        table.current.map(|i| table.slots[i].id)
    }

    /// Overrides the dispatch decision for `core`. The task must be in that
    /// core's table and runnable there.
    pub fn set_current_task(
        &self,
        core: CoreId,
        id: Option<TaskId>,
    ) -> Result<(), SchedError> {
        let mut table = self.table(core);
        let Some(id) = id else {
            table.current = None;
            return Ok(());
        };
        let index = table.find(id).ok_or(SchedError::NotFound)?;
        let t = &table.slots[index];
        if !t.affinity.allows(core)
            || !matches!(t.state, TaskState::Ready | TaskState::Running)
        {
            return Err(SchedError::InvalidState);
        }
        table.install(index);
        Ok(())
    }

    pub fn get_task_info(&self, id: TaskId) -> Result<TaskInfo, SchedError> {
        let (core, table, index) = self.locate(id)?;
        Ok(table.slots[index].info(core))
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let mut per_core = [0; abi::CORE_COUNT];
        for core in CoreId::ALL {
            per_core[core.index()] = self.table(core).context_switches;
        }
        let total = per_core.iter().fold(0u32, |a, &b| a.wrapping_add(b));
        let k = *self.stats.lock(&self.hw);
        let mut stats = SchedulerStats::new(k.tick_count, per_core, total);
        stats.task_creates = k.task_creates;
        stats.task_deletes = k.task_deletes;
        stats.deadline_misses = k.deadline_misses;
        stats.reclaimed_locks = k.reclaimed_locks;
        stats.running = self.is_running() as u8;
        stats.tracing = self.is_tracing() as u8;
        stats
    }

    /// Sets `id`'s deadline, clearing its miss counters. The miss handler,
    /// if any, is kept.
    pub fn set_deadline(
        &self,
        id: TaskId,
        kind: DeadlineKind,
        period_ms: u32,
        deadline_ms: u32,
        budget_us: u32,
    ) -> Result<(), SchedError> {
        if kind != DeadlineKind::None && deadline_ms == 0 {
            return Err(SchedError::InvalidArgument);
        }
        self.with_task(id, |t| {
            t.deadline = Deadline {
                kind,
                period_ms,
                deadline_ms,
                budget_us,
                handler: t.deadline.handler,
                ..Deadline::NONE
            };
            Ok(())
        })
    }

    pub fn set_deadline_miss_handler(
        &self,
        id: TaskId,
        handler: Option<MissHandler>,
    ) -> Result<(), SchedError> {
        self.with_task(id, |t| {
            t.deadline.handler = handler;
            Ok(())
        })
    }

    pub fn get_deadline_info(&self, id: TaskId) -> Result<DeadlineInfo, SchedError> {
        self.with_task(id, |t| Ok(t.deadline.info()))
    }

    /// Gives `id` the default four-region MPU configuration and turns on
    /// protection for it.
    pub fn set_mpu_protection(
        &self,
        id: TaskId,
        stack_base: u32,
        stack_size: u32,
        code_base: u32,
        code_size: u32,
    ) -> Result<(), SchedError> {
        self.with_task(id, |_| Ok(()))?;
        let config = mpu::create_default_config(
            id, stack_base, stack_size, code_base, code_size,
        )?;
        self.mpu().configure_task(&config)?;
        self.with_task(id, |t| {
            t.mpu_enabled = true;
            Ok(())
        })
    }

    /// Attributes `id` to a security state. A non-secure task's code and data
    /// windows are attributed non-secure while it runs; `functions` are the
    /// registry indices of the secure functions it may call.
    pub fn set_security(
        &self,
        id: TaskId,
        state: SecurityState,
        code: Option<NsWindow>,
        data: Option<NsWindow>,
        functions: &[u8],
    ) -> Result<(), SchedError> {
        self.with_task(id, |_| Ok(()))?;
        let mut config = TzTaskConfig::new(id, state).with_windows(code, data);
        for &f in functions {
            config.allow(f)?;
        }
        self.tz().configure_task(&config)?;
        self.with_task(id, |t| {
            t.tz_configured = true;
            t.is_secure = state == SecurityState::Secure;
            Ok(())
        })
    }

    /// Picks the task `core` should run next and advances its round-robin
    /// position.
    pub fn get_next_task(&self, core: CoreId) -> Option<TaskId> {
        let mut table = self.table(core);
        table.select_next(core).map(|i| table.slots[i].id)
    }

    /// The scheduling tick. Updates state only; never runs task code.
    pub fn tick(&self) {
        let now = self.now();
        self.stats.lock(&self.hw).tick_count += 1;
        for core in CoreId::ALL {
            let mut table = self.table(core);
            table.wake_sleepers(now);
            if table.in_flight.is_some() {
                table.reschedule = true;
                continue;
            }
            self.reselect(core, &mut table);
        }
        self.hw.send_event();
    }

    fn reselect(&self, core: CoreId, table: &mut TaskTable<H>) {
        let from = table.current.map_or(TaskId::NONE, |i| table.slots[i].id);
        if let Some(index) = table.select_next(core) {
            if table.install(index) {
                let to = table.slots[index].id;
                self.trace_event(line!(), TraceEvent::Switch { core, from, to });
            }
        }
    }

    /// Runs one task invocation on the calling core, if there's anything to
    /// run. Returns whether something ran.
    pub fn run_pending_tasks(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let core = self.hw.core_id();
        let start = self.now();

        let (index, id, entry, protect, secure) = {
            let mut table = self.table(core);
            if table.in_flight.is_some() {
                return false;
            }
            table.wake_sleepers(start);
            let current = table.current;
            let index = match current.filter(|&i| table.slots[i].is_ready_on(core)) {
                Some(i) => i,
                None => {
                    self.reselect(core, &mut table);
                    match table.current {
                        Some(i) if table.slots[i].is_ready_on(core) => i,
                        _ => return false,
                    }
                }
            };
            table.in_flight = Some(index);
            let t = &mut table.slots[index];
            t.state = TaskState::Running;
            t.run_count = t.run_count.wrapping_add(1);
            t.deadline.last_start = start;
            let Some(entry) = t.entry else {
                crate::fail::die("live task without an entry");
            };
            (
                index,
                t.id,
                entry,
                t.mpu_enabled && self.config.enforce_mpu,
                t.tz_configured,
            )
        };
        self.trace_event(line!(), TraceEvent::Dispatch { task: id, core });

        let mut fault = None;
        if protect {
            if let Err(e) = self.mpu().apply_task_settings(id) {
                klog!("sched: MPU apply failed for task {}: {}", id.0, e);
                fault = Some(FaultReason::MpuConfig);
            }
        }
        if secure {
            if let Err(e) = self.tz().apply_task_settings(id) {
                klog!("sched: TZ apply failed for task {}: {}", id.0, e);
                fault = Some(FaultReason::SecurityConfig);
            }
        }

        TaskContext::new(self, id, core, &entry).invoke(&entry);

        let end = self.now();
        if protect {
            self.mpu().reset_task_settings().ok();
        }
        if secure {
            self.tz().reset_task_settings().ok();
        }

        let after = self.account(core, index, id, start, end, fault);

        if let Some(reason) = fault {
            self.trace_event(line!(), TraceEvent::Fault { task: id, reason });
        }
        if after.overran {
            self.trace_event(line!(), TraceEvent::BudgetOverrun(id));
        }
        if let Some(handler) = after.missed {
            self.stats.lock(&self.hw).deadline_misses += 1;
            self.trace_event(line!(), TraceEvent::DeadlineMiss(id));
            if let Some(handler) = handler {
                handler.call(id);
            }
        }
        if let Some(reason) = after.suspended_for {
            klog!("sched: task {} suspended: {:?}", id.0, reason);
            self.trace_event(line!(), TraceEvent::Suspended(id));
        }
        if after.completed {
            self.trace_event(line!(), TraceEvent::Completed(id));
            self.retire(id);
        }
        true
    }

    /// Records the outcome of an invocation and decides the task's next
    /// state.
    fn account(
        &self,
        core: CoreId,
        index: usize,
        id: TaskId,
        start: Timestamp,
        end: Timestamp,
        fault: Option<FaultReason>,
    ) -> Aftermath {
        let mut after = Aftermath {
            missed: None,
            overran: false,
            completed: false,
            suspended_for: None,
        };
        let mut table = self.table(core);
        table.in_flight = None;

        let t = &mut table.slots[index];
        // Running tasks can't be deleted, so the slot is still ours.
        uassert!(t.id == id);
        if let Some(reason) = fault {
            t.fault(reason);
        }

        let runtime = end.since(start);
        t.last_run_time_us = runtime;
        t.total_runtime_us = t.total_runtime_us.saturating_add(runtime);

        let d = &mut t.deadline;
        d.last_completion = end;
        if d.budget_us != 0 && runtime > u64::from(d.budget_us) {
            d.budget_overruns = d.budget_overruns.wrapping_add(1);
            after.overran = true;
        }
        let mut hard_stop = false;
        if d.kind != DeadlineKind::None && runtime > u64::from(d.deadline_ms) * 1000 {
            d.misses = d.misses.wrapping_add(1);
            after.missed = Some(d.handler);
            hard_stop = d.kind == DeadlineKind::Hard
                && self.config.hard_deadline_policy == HardDeadlinePolicy::Suspend;
        }

        if hard_stop {
            t.fault(FaultReason::HardDeadline);
        }

        // A returned one-shot completes whatever its deadline did.
        if t.kind == TaskKind::OneShot {
            t.state = TaskState::Completed;
            after.completed = true;
        } else if hard_stop {
            t.state = TaskState::Suspended;
            t.suspend_pending = false;
            t.wake_at = None;
            after.suspended_for = Some(FaultReason::HardDeadline);
        } else if t.suspend_pending {
            t.suspend_pending = false;
            t.state = TaskState::Suspended;
            t.wake_at = None;
        } else if t.wake_at.is_some() {
            t.state = TaskState::Blocked;
        } else {
            match t.deadline.next_release() {
                Some(release) if release > end => {
                    t.wake_at = Some(release);
                    t.state = TaskState::Blocked;
                }
                _ => t.state = TaskState::Ready,
            }
        }

        if after.completed {
            table.vacate(index);
        }
        if table.reschedule {
            table.reschedule = false;
            self.reselect(core, &mut table);
        }
        after
    }

    /// Cleans up after a task that has ended: reclaims the locks it still
    /// holds and drops its protection settings.
    fn retire(&self, id: TaskId) {
        let reclaimed = self.spinlocks().release_by_task(id);
        if reclaimed != 0 {
            self.stats.lock(&self.hw).reclaimed_locks += reclaimed;
            self.trace_event(
                line!(),
                TraceEvent::Reclaimed {
                    task: id,
                    count: reclaimed,
                },
            );
        }
        self.mpu().remove_task(id);
        self.tz().remove_task(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeHardware;
    use crate::config::KernelConfig;
    use crate::task::Runnable;
    use abi::{Affinity, Priority};
    use std::sync::atomic::{AtomicU32, Ordering};

    type K = Kernel<FakeHardware>;

    fn kernel(config: KernelConfig) -> &'static K {
        let k = Box::leak(Box::new(Kernel::new(FakeHardware::new(), config)));
        k.init().unwrap();
        k
    }

    fn running() -> &'static K {
        let k = kernel(KernelConfig::DEFAULT);
        k.start().unwrap();
        k
    }

    fn nop() -> &'static dyn Runnable<FakeHardware> {
        Box::leak(Box::new(|_: &TaskContext<'_, FakeHardware>| {}))
    }

    fn counter() -> (&'static AtomicU32, &'static dyn Runnable<FakeHardware>) {
        let n: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        let r = Box::leak(Box::new(move |_: &TaskContext<'_, FakeHardware>| {
            n.fetch_add(1, Ordering::Relaxed);
        }));
        (n, r)
    }

    #[test]
    fn ids_count_up_from_one() {
        let k = kernel(KernelConfig::DEFAULT);
        let a = k.create_task(TaskDef::new("a", nop())).unwrap();
        let b = k.create_task(TaskDef::new("b", nop())).unwrap();
        assert_eq!((a, b), (TaskId(1), TaskId(2)));
        let info = k.get_task_info(b).unwrap();
        assert_eq!(info.id, 2);
        assert_eq!(info.name(), "b");
        assert_eq!(info.state(), Some(TaskState::Ready));
        assert_eq!(k.get_stats().task_creates, 2);
    }

    #[test]
    fn full_table_rejects_without_side_effects() {
        let k = kernel(KernelConfig::DEFAULT);
        for _ in 0..abi::MAX_TASKS_PER_CORE {
            k.create_task(TaskDef::new("t", nop()).affinity(Affinity::Core1))
                .unwrap();
        }
        let before = k.get_stats();
        assert_eq!(
            k.create_task(TaskDef::new("t", nop()).affinity(Affinity::Core1)),
            Err(SchedError::NoFreeSlot)
        );
        assert_eq!(k.get_stats(), before);
        // Core 0 still has room.
        k.create_task(TaskDef::new("t", nop()).affinity(Affinity::Core0))
            .unwrap();
    }

    #[test]
    fn stacks_are_checked_and_placed() {
        let k = kernel(KernelConfig::DEFAULT);
        assert_eq!(
            k.create_task(TaskDef::new("big", nop()).stack_size(0x2000)),
            Err(SchedError::StackTooLarge)
        );
        assert_eq!(
            k.create_task(TaskDef::new("none", nop()).stack_size(0)),
            Err(SchedError::InvalidArgument)
        );
        let id = k
            .create_task(TaskDef::new("t", nop()).affinity(Affinity::Core1))
            .unwrap();
        let info = k.get_task_info(id).unwrap();
        assert_eq!(info.stack_base, KernelConfig::DEFAULT.stack_for(CoreId::Core1, 0));
        assert_eq!(info.core(), Some(CoreId::Core1));
    }

    #[test]
    fn nothing_runs_before_start() {
        let k = kernel(KernelConfig::DEFAULT);
        let (n, r) = counter();
        k.create_task(TaskDef::new("t", r)).unwrap();
        assert!(!k.run_pending_tasks());
        assert_eq!(n.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn one_shot_runs_once_and_frees_its_slot() {
        let k = running();
        let (n, r) = counter();
        let id = k
            .create_task(TaskDef::new("once", r).kind(TaskKind::OneShot))
            .unwrap();
        assert!(k.run_pending_tasks());
        assert!(!k.run_pending_tasks());
        assert_eq!(n.load(Ordering::Relaxed), 1);
        assert!(matches!(k.get_task_info(id), Err(SchedError::NotFound)));
        assert_eq!(k.get_current_task(CoreId::Core0), None);
    }

    #[test]
    fn persistent_task_reruns_until_tick() {
        let k = running();
        let (a, ra) = counter();
        let (b, rb) = counter();
        k.create_task(TaskDef::new("a", ra)).unwrap();
        k.create_task(TaskDef::new("b", rb)).unwrap();
        for _ in 0..3 {
            k.run_pending_tasks();
        }
        assert_eq!((a.load(Ordering::Relaxed), b.load(Ordering::Relaxed)), (3, 0));
        k.tick();
        k.run_pending_tasks();
        assert_eq!(b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn yield_hands_over_to_a_peer() {
        let k = running();
        let (b, rb) = counter();
        let ra = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| cx.yield_now()));
        k.create_task(TaskDef::new("a", ra)).unwrap();
        k.create_task(TaskDef::new("b", rb)).unwrap();
        k.run_pending_tasks();
        k.run_pending_tasks();
        assert_eq!(b.load(Ordering::Relaxed), 1);
        assert_eq!(k.yield_now(), Err(SchedError::NoCurrentTask));
    }

    #[test]
    fn task_local_delay_blocks_only_the_task() {
        let k = running();
        let (b, rb) = counter();
        let ra = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| cx.delay(25)));
        let a = k
            .create_task(TaskDef::new("a", ra).priority(Priority::High))
            .unwrap();
        k.create_task(TaskDef::new("b", rb)).unwrap();

        k.run_pending_tasks();
        assert_eq!(
            k.get_task_info(a).unwrap().state(),
            Some(TaskState::Blocked)
        );
        // The core moves on to the lower-priority task meanwhile.
        k.run_pending_tasks();
        assert_eq!(b.load(Ordering::Relaxed), 1);
        assert_eq!(k.hw().now_us(), 0);

        k.hw().advance_ms(25);
        k.tick();
        k.run_pending_tasks();
        assert_eq!(k.get_task_info(a).unwrap().run_count, 2);
    }

    #[test]
    fn delay_outside_a_task_stalls() {
        let k = running();
        k.delay(3).unwrap();
        assert_eq!(k.hw().now_us(), 3_000);
    }

    #[test]
    fn suspend_and_resume() {
        let k = running();
        let (n, r) = counter();
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        k.suspend_task(id).unwrap();
        assert_eq!(k.suspend_task(id), Err(SchedError::InvalidState));
        assert!(!k.run_pending_tasks());
        k.resume_task(id).unwrap();
        assert_eq!(k.resume_task(id), Err(SchedError::InvalidState));
        assert!(k.run_pending_tasks());
        assert_eq!(n.load(Ordering::Relaxed), 1);
        assert_eq!(k.suspend_task(TaskId(99)), Err(SchedError::NotFound));
    }

    #[test]
    fn self_suspension_takes_effect_on_return() {
        let k = running();
        let r = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| {
            cx.suspend().unwrap();
            assert_eq!(
                cx.kernel().get_task_info(cx.id()).unwrap().state(),
                Some(TaskState::Running)
            );
        }));
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        k.run_pending_tasks();
        assert_eq!(
            k.get_task_info(id).unwrap().state(),
            Some(TaskState::Suspended)
        );
    }

    #[test]
    fn running_task_cannot_be_deleted() {
        let k = running();
        let r = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| {
            assert_eq!(
                cx.kernel().delete_task(cx.id()),
                Err(SchedError::TaskRunning)
            );
        }));
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        k.run_pending_tasks();
        k.delete_task(id).unwrap();
        assert!(matches!(k.get_task_info(id), Err(SchedError::NotFound)));
        assert_eq!(k.get_stats().task_deletes, 1);
        assert_eq!(k.delete_task(id), Err(SchedError::NotFound));
    }

    #[test]
    fn current_task_tracks_dispatch() {
        let k = running();
        let seen: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        let r = Box::leak(Box::new(move |cx: &TaskContext<'_, FakeHardware>| {
            let id = cx.kernel().get_current_task_id().unwrap();
            seen.store(id.0, Ordering::Relaxed);
        }));
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        assert_eq!(k.get_current_task_id(), None);
        k.run_pending_tasks();
        assert_eq!(seen.load(Ordering::Relaxed), id.0);
        assert_eq!(k.get_current_task(CoreId::Core0), Some(id));
    }

    #[test]
    fn set_current_task_checks_placement() {
        let k = kernel(KernelConfig::DEFAULT);
        let a = k.create_task(TaskDef::new("a", nop())).unwrap();
        let b = k
            .create_task(TaskDef::new("b", nop()).affinity(Affinity::Core1))
            .unwrap();
        k.set_current_task(CoreId::Core0, Some(a)).unwrap();
        assert_eq!(
            k.set_current_task(CoreId::Core0, Some(b)),
            Err(SchedError::NotFound)
        );
        assert_eq!(k.get_stats().core_context_switches, [1, 0]);
        k.set_current_task(CoreId::Core0, None).unwrap();
        assert_eq!(k.get_current_task(CoreId::Core0), None);
    }

    #[test]
    fn deadline_settings_round_trip() {
        let k = kernel(KernelConfig::DEFAULT);
        let id = k.create_task(TaskDef::new("t", nop())).unwrap();
        assert_eq!(
            k.set_deadline(id, DeadlineKind::Soft, 50, 0, 0),
            Err(SchedError::InvalidArgument)
        );
        fn on_miss(_: TaskId) {}
        k.set_deadline_miss_handler(id, Some(MissHandler::Native(on_miss)))
            .unwrap();
        k.set_deadline(id, DeadlineKind::Hard, 50, 20, 5_000).unwrap();
        let info = k.get_deadline_info(id).unwrap();
        assert_eq!(info.kind(), Some(DeadlineKind::Hard));
        assert_eq!((info.period_ms, info.deadline_ms, info.budget_us), (50, 20, 5_000));
        assert_eq!(info.has_handler, 1);
    }

    #[test]
    fn hard_deadline_policy_suspend() {
        let k = kernel(KernelConfig {
            hard_deadline_policy: HardDeadlinePolicy::Suspend,
            ..KernelConfig::DEFAULT
        });
        k.start().unwrap();
        let r = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| {
            cx.delay_blocking(5)
        }));
        let id = k.create_task(TaskDef::new("slow", r)).unwrap();
        k.set_deadline(id, DeadlineKind::Hard, 0, 2, 0).unwrap();
        k.run_pending_tasks();
        let info = k.get_task_info(id).unwrap();
        assert_eq!(info.state(), Some(TaskState::Suspended));
        assert_eq!(info.fault_reason(), Some(FaultReason::HardDeadline));
        assert_eq!(info.deadline_misses, 1);
    }

    #[test]
    fn late_one_shot_is_retired_under_suspend_policy() {
        let k = kernel(KernelConfig {
            hard_deadline_policy: HardDeadlinePolicy::Suspend,
            ..KernelConfig::DEFAULT
        });
        k.start().unwrap();
        let x = k.spinlocks().allocate(abi::LockCategory::User, "x").unwrap();
        let r = Box::leak(Box::new(move |cx: &TaskContext<'_, FakeHardware>| {
            cx.acquire(x).unwrap();
            cx.delay_blocking(5);
        }));
        let id = k
            .create_task(TaskDef::new("late", r).kind(TaskKind::OneShot))
            .unwrap();
        k.set_deadline(id, DeadlineKind::Hard, 0, 2, 0).unwrap();
        k.run_pending_tasks();

        assert!(matches!(k.get_task_info(id), Err(SchedError::NotFound)));
        assert_eq!(k.spinlocks().get_info(x).unwrap().holder(), TaskId::NONE);
        assert!(!k.hw().is_locked(x));
        assert!(k.hw().interrupts_enabled(CoreId::Core0));
        let stats = k.get_stats();
        assert_eq!(stats.deadline_misses, 1);
        assert_eq!(stats.reclaimed_locks, 1);
        assert_eq!(stats.task_deletes, 0);
    }

    #[test]
    fn budget_overruns_are_counted() {
        let k = running();
        let r = Box::leak(Box::new(|cx: &TaskContext<'_, FakeHardware>| {
            cx.delay_blocking(2)
        }));
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        k.set_deadline(id, DeadlineKind::Soft, 0, 10, 1_000).unwrap();
        k.run_pending_tasks();
        let info = k.get_deadline_info(id).unwrap();
        assert_eq!(info.budget_overruns, 1);
        assert_eq!(info.misses, 0);
        assert_eq!(k.get_task_info(id).unwrap().last_run_time_us, 2_000);
    }

    #[test]
    fn protected_task_gets_its_regions_while_running() {
        let k = running();
        let seen: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        let r = Box::leak(Box::new(move |cx: &TaskContext<'_, FakeHardware>| {
            let (_, rlar) = cx.kernel().hw().mpu_region(0, false);
            seen.store(rlar, Ordering::Relaxed);
        }));
        let id = k.create_task(TaskDef::new("t", r)).unwrap();
        let info = k.get_task_info(id).unwrap();
        k.set_mpu_protection(id, info.stack_base, info.stack_size, 0x1000_0000, 0x1000)
            .unwrap();
        assert_eq!(k.get_task_info(id).unwrap().mpu_enabled, 1);
        k.run_pending_tasks();
        assert_ne!(seen.load(Ordering::Relaxed), 0);
        // Cleared again afterwards.
        assert_eq!(k.hw().mpu_region(0, false), (0, 0));
        assert_eq!(k.get_task_info(id).unwrap().fault_count, 0);
    }

    #[test]
    fn nonsecure_task_runs_nonsecure() {
        let k = running();
        let seen: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(9)));
        let r = Box::leak(Box::new(move |cx: &TaskContext<'_, FakeHardware>| {
            let state = cx.kernel().hw().security_state(cx.core());
            seen.store(state as u32, Ordering::Relaxed);
        }));
        let id = k.create_task(TaskDef::new("ns", r)).unwrap();
        k.set_security(
            id,
            SecurityState::NonSecure,
            Some(NsWindow::new(0x1010_0000, 0x1000)),
            None,
            &[],
        )
        .unwrap();
        k.run_pending_tasks();
        assert_eq!(seen.load(Ordering::Relaxed), SecurityState::NonSecure as u32);
        assert_eq!(
            k.hw().security_state(CoreId::Core0),
            SecurityState::Secure
        );
        assert_eq!(k.get_task_info(id).unwrap().is_secure, 0);
    }

    #[test]
    fn deleting_drops_protection_settings() {
        let k = running();
        let id = k.create_task(TaskDef::new("t", nop())).unwrap();
        let info = k.get_task_info(id).unwrap();
        k.set_mpu_protection(id, info.stack_base, info.stack_size, 0x1000_0000, 0x1000)
            .unwrap();
        k.delete_task(id).unwrap();
        assert!(k.mpu().get_task_config(id).is_none());
    }

    #[test]
    fn tick_counts_and_switches() {
        let k = running();
        k.create_task(TaskDef::new("a", nop())).unwrap();
        k.create_task(TaskDef::new("b", nop())).unwrap();
        for _ in 0..4 {
            k.tick();
        }
        let stats = k.get_stats();
        assert_eq!(stats.tick_count, 4);
        assert_eq!(stats.context_switches, 4);
        assert_eq!(stats.core_context_switches, [4, 0]);
        assert_eq!(stats.running, 1);
    }
}
