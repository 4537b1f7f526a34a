// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and the subsystems that
//! sit on top of it (drivers, the command shell, test harnesses).
//!
//! Everything in here is plain data. The status records at the bottom of the
//! file are `repr(C)` and carry raw integer fields rather than Rust enums so
//! that they can cross the C-ABI boundary byte-for-byte; use the accessor
//! methods to get typed values back out.

#![no_std]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of cores in the system. The kernel is written for exactly two.
pub const CORE_COUNT: usize = 2;

/// Number of task slots in each core's task table.
pub const MAX_TASKS_PER_CORE: usize = 16;

/// Longest task name retained by the kernel, in bytes. Longer names are
/// truncated.
pub const TASK_NAME_LEN: usize = 15;

/// Number of hardware spinlocks in the SIO block.
pub const SPINLOCK_COUNT: usize = 32;

/// Number of MPU regions a task configuration may use. This matches the number
/// of region slots in each core's MPU.
pub const MPU_REGIONS_PER_TASK: usize = 8;

/// Number of per-task MPU configurations the kernel can hold.
pub const MAX_MPU_TASKS: usize = 16;

/// Number of per-task TrustZone configurations the kernel can hold.
pub const MAX_TZ_TASKS: usize = 16;

/// Number of secure functions that can be exposed through NSC veneers.
pub const MAX_SECURE_FUNCTIONS: usize = 16;

/// Raw affinity value meaning "either core".
pub const AFFINITY_ANY: i8 = -1;

/// Value returned across the C ABI when an operation producing a task id
/// fails.
pub const TASK_ID_ERROR: i32 = -1;

/// Names a task for the life of the system.
///
/// Ids are handed out from a monotonic counter starting at 1 and are never
/// reused. `TaskId::NONE` (zero) is the "no task" value, e.g. for a spinlock
/// that nobody currently holds.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const NONE: Self = Self(0);

    /// Checks whether this id could name a real task.
    pub fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Converts a C-ABI task id into a `TaskId`, rejecting the error sentinel
    /// and other non-positive values.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw > 0 {
            Some(Self(raw as u32))
        } else {
            None
        }
    }

    /// Converts to the C-ABI representation.
    pub fn to_raw(self) -> i32 {
        self.0 as i32
    }
}

/// One of the two processor cores.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CoreId {
    Core0 = 0,
    Core1 = 1,
}

impl CoreId {
    pub const ALL: [Self; CORE_COUNT] = [Self::Core0, Self::Core1];

    /// Index of this core, suitable for indexing per-core arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the other core.
    pub const fn other(self) -> Self {
        match self {
            Self::Core0 => Self::Core1,
            Self::Core1 => Self::Core0,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::from_usize(i)
    }
}

/// Which core(s) may execute a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(i8)]
pub enum Affinity {
    Core0 = 0,
    Core1 = 1,
    Any = AFFINITY_ANY,
}

impl Affinity {
    /// Decodes a raw affinity as passed across the C ABI. Anything other than
    /// 0, 1, or `AFFINITY_ANY` is rejected.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::from_i32(raw)
    }

    /// Checks whether a task with this affinity may run on `core`.
    pub fn allows(self, core: CoreId) -> bool {
        match self {
            Self::Any => true,
            Self::Core0 => core == CoreId::Core0,
            Self::Core1 => core == CoreId::Core1,
        }
    }

    /// The core a task with this affinity is placed on at creation. Tasks
    /// that can run anywhere default to core 0.
    pub fn home_core(self) -> CoreId {
        match self {
            Self::Core1 => CoreId::Core1,
            Self::Core0 | Self::Any => CoreId::Core0,
        }
    }
}

/// Scheduling priority of a task.
///
/// Unlike the raw numbers, this type deliberately does not implement
/// `PartialOrd`/`Ord`; use `is_more_important_than` so there's never any doubt
/// about which direction is "better."
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        (self as u8) > (other as u8)
    }
}

/// Whether a task re-enters the ready set after its entry returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum TaskKind {
    /// Runs once; the slot is freed after the entry returns.
    OneShot = 0,
    /// Becomes ready again after each return.
    Persistent = 1,
}

/// Scheduling state of a task slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Default)]
#[repr(u8)]
pub enum TaskState {
    /// Slot is free.
    #[default]
    Inactive = 0,
    Ready = 1,
    Running = 2,
    /// Waiting for a wake time set by a task-local delay.
    Blocked = 3,
    Suspended = 4,
    Completed = 5,
}

/// How seriously a task's deadline is meant.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Default)]
#[repr(u8)]
pub enum DeadlineKind {
    #[default]
    None = 0,
    Soft = 1,
    Hard = 2,
}

/// Last fault recorded against a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Default)]
#[repr(u8)]
pub enum FaultReason {
    #[default]
    None = 0,
    /// The task asked for memory protection but its MPU settings could not
    /// be applied.
    MpuConfig = 1,
    /// The task has a security configuration that could not be applied.
    SecurityConfig = 2,
    /// The task missed a hard deadline and the kernel was configured to
    /// suspend it.
    HardDeadline = 3,
}

/// Access rights conferred by an MPU region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Access {
    NoAccess = 0,
    Read = 1,
    ReadWrite = 2,
    ReadExecute = 3,
    ReadWriteExecute = 4,
}

/// Security attribution of a memory region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum SecurityAttr {
    Secure = 0,
    NonSecure = 1,
    NonSecureCallable = 2,
}

/// Security state of a task or of a core.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum SecurityState {
    Secure = 0,
    NonSecure = 1,
    /// A core that is partway through switching states.
    Transitional = 2,
}

/// Subsystem a hardware spinlock is allocated to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum LockCategory {
    Scheduler = 0,
    I2c = 1,
    Spi = 2,
    Sensor = 3,
    Servo = 4,
    Logging = 5,
    Memory = 6,
    Filesystem = 7,
    Network = 8,
    Fault = 9,
    Debug = 10,
    User = 11,
    /// Marks a free record. Never a valid allocation request.
    Unused = 12,
}

impl LockCategory {
    pub const COUNT: usize = 13;
}

/// Startup phase of the spinlock broker. Phases only ever move forward.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, FromPrimitive,
)]
#[repr(u8)]
pub enum InitPhase {
    /// Nothing has been initialized; only bootstrap claims are possible.
    Uninit = 0,
    /// Records are live and the broker owns its own lock.
    Core = 1,
    /// Bootstrap-claimed locks have been promoted into records.
    Tracking = 2,
    /// Logging is available.
    Full = 3,
}

/// Copies `s` into a NUL-padded fixed buffer, truncating if needed.
pub fn pack_name<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0; N];
    let n = s.len().min(N);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
    buf
}

/// Reads a NUL-padded buffer back out as a string, stopping at the first NUL
/// or at the first byte that makes the contents invalid UTF-8.
pub fn unpack_name(buf: &[u8]) -> &str {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match core::str::from_utf8(&buf[..len]) {
        Ok(s) => s,
        Err(e) => {
            // Truncation may have split a multi-byte character; keep the
            // valid prefix.
            let valid = e.valid_up_to();
            core::str::from_utf8(&buf[..valid]).unwrap_or_default()
        }
    }
}

/// Snapshot of a task control block, as returned by `get_task_info`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TaskInfo {
    pub total_runtime_us: u64,
    pub last_run_time_us: u64,
    pub id: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub run_count: u32,
    pub fault_count: u32,
    pub deadline_misses: u32,
    /// NUL-padded task name.
    pub name: [u8; 16],
    pub priority: u8,
    pub kind: u8,
    pub affinity: i8,
    pub state: u8,
    /// Index of the core whose task table holds this task.
    pub core: u8,
    pub mpu_enabled: u8,
    pub is_secure: u8,
    pub fault_reason: u8,
}

impl TaskInfo {
    pub fn name(&self) -> &str {
        unpack_name(&self.name)
    }

    pub fn priority(&self) -> Option<Priority> {
        Priority::from_u8(self.priority)
    }

    pub fn kind(&self) -> Option<TaskKind> {
        TaskKind::from_u8(self.kind)
    }

    pub fn affinity(&self) -> Option<Affinity> {
        Affinity::from_i8(self.affinity)
    }

    pub fn state(&self) -> Option<TaskState> {
        TaskState::from_u8(self.state)
    }

    pub fn core(&self) -> Option<CoreId> {
        CoreId::from_u8(self.core)
    }

    pub fn fault_reason(&self) -> Option<FaultReason> {
        FaultReason::from_u8(self.fault_reason)
    }
}

/// Scheduler-wide statistics, as returned by `get_stats`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SchedulerStats {
    pub tick_count: u64,
    /// Total context switches; always the sum of `core_context_switches`.
    pub context_switches: u32,
    pub core_context_switches: [u32; CORE_COUNT],
    pub task_creates: u32,
    pub task_deletes: u32,
    pub deadline_misses: u32,
    /// Spinlocks reclaimed from tasks that ended while holding them.
    pub reclaimed_locks: u32,
    pub running: u8,
    pub tracing: u8,
    _pad: [u8; 2],
}

impl SchedulerStats {
    pub fn new(
        tick_count: u64,
        core_context_switches: [u32; CORE_COUNT],
        context_switches: u32,
    ) -> Self {
        Self {
            tick_count,
            context_switches,
            core_context_switches,
            ..Self::default()
        }
    }
}

/// Deadline record of one task, as returned by `get_deadline_info`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct DeadlineInfo {
    pub last_start_us: u64,
    pub last_completion_us: u64,
    pub period_ms: u32,
    pub deadline_ms: u32,
    pub budget_us: u32,
    pub misses: u32,
    pub budget_overruns: u32,
    pub kind: u8,
    pub has_handler: u8,
    _pad: [u8; 2],
}

impl DeadlineInfo {
    pub fn new(kind: DeadlineKind, has_handler: bool) -> Self {
        Self {
            kind: kind as u8,
            has_handler: has_handler as u8,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> Option<DeadlineKind> {
        DeadlineKind::from_u8(self.kind)
    }
}

/// One hardware spinlock's record, as returned by the broker's `get_info`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SpinlockInfo {
    pub total_held_us: u64,
    pub max_held_us: u64,
    pub last_acquired_us: u64,
    pub acquisitions: u32,
    /// Task currently holding the lock, or 0.
    pub holder: u32,
    /// NUL-padded owner name.
    pub owner: [u8; 24],
    pub id: u8,
    pub allocated: u8,
    pub category: u8,
    _pad: [u8; 5],
}

impl SpinlockInfo {
    pub fn new(id: u8, allocated: bool, category: LockCategory) -> Self {
        Self {
            id,
            allocated: allocated as u8,
            category: category as u8,
            ..Self::default()
        }
    }

    pub fn owner(&self) -> &str {
        unpack_name(&self.owner)
    }

    pub fn category(&self) -> Option<LockCategory> {
        LockCategory::from_u8(self.category)
    }

    pub fn holder(&self) -> TaskId {
        TaskId(self.holder)
    }
}

/// TrustZone manager status, as returned by `get_status`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct TzStatus {
    pub secure_tasks: u32,
    pub nonsecure_tasks: u32,
    pub transitional_tasks: u32,
    pub secure_functions: u32,
    pub transitions: u32,
    pub sau_regions: u8,
    pub supported: u8,
    pub enabled: u8,
    /// Security state of the core that asked, as a raw `SecurityState`.
    pub current_state: u8,
}

/// C-ABI form of an MPU region descriptor.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RawRegion {
    pub base: u32,
    pub size: u32,
    pub access: u8,
    pub security: u8,
    /// Bit 0 cacheable, bit 1 bufferable, bit 2 shareable.
    pub flags: u8,
    _pad: u8,
}

impl RawRegion {
    pub fn new(
        base: u32,
        size: u32,
        access: Access,
        security: SecurityAttr,
        flags: u8,
    ) -> Self {
        Self {
            base,
            size,
            access: access as u8,
            security: security as u8,
            flags,
            _pad: 0,
        }
    }

    pub fn access(&self) -> Option<Access> {
        Access::from_u8(self.access)
    }

    pub fn security(&self) -> Option<SecurityAttr> {
        SecurityAttr::from_u8(self.security)
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<TaskInfo>(), 64);
static_assertions::const_assert_eq!(
    core::mem::size_of::<SchedulerStats>(),
    40
);
static_assertions::const_assert_eq!(core::mem::size_of::<DeadlineInfo>(), 40);
static_assertions::const_assert_eq!(core::mem::size_of::<SpinlockInfo>(), 64);
static_assertions::const_assert_eq!(core::mem::size_of::<TzStatus>(), 24);
static_assertions::const_assert_eq!(core::mem::size_of::<RawRegion>(), 12);
