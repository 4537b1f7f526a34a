// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Every kernel component reports caller errors through `Result` with its own
//! error enum. Nothing here is fatal: a kernel *bug* goes through `uassert!`
//! instead. The C-ABI shim collapses all of these to the `-1`/`false`
//! sentinels its callers expect.

use core::fmt;

/// Errors from the spinlock broker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpinlockError {
    /// Lock number is not below 32.
    InvalidId,
    /// `LockCategory::Unused` is not something you can allocate.
    InvalidCategory,
    /// Every hardware lock is claimed.
    NoneAvailable,
    NotAllocated,
    AlreadyAllocated,
    /// The broker's own lock can't be freed or used by clients.
    ReservedForBroker,
    /// The broker has not reached the phase this operation needs.
    NotInitialized,
    /// Phases must be entered in order.
    PhaseOrder,
    TooManyComponents,
    /// Release of a lock that nobody acquired through the broker.
    NotHeld,
    /// Free of a lock that is still held. Release it first.
    Held,
}

/// Errors from the MPU manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MpuError {
    /// This core has no MPU, or the manager isn't initialized.
    Unavailable,
    NoRegions,
    TooManyRegions,
    /// Rounding the region up to a power of two overflowed the address
    /// space.
    RegionTooLarge,
    /// Two regions overlap once aligned.
    Overlap,
    TableFull,
    NoConfig,
    InvalidArgument,
}

/// Errors from the TrustZone manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TzError {
    /// No security extension, or the manager isn't initialized.
    Unavailable,
    /// Tasks can be configured Secure or NonSecure only.
    InvalidState,
    NoConfig,
    TableFull,
    TooManyFunctions,
    UnknownFunction,
    InvalidArgument,
}

/// Errors from the scheduler, including those it passes along from the
/// components it drives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedError {
    NotInitialized,
    AlreadyInitialized,
    AlreadyRunning,
    NotRunning,
    /// The target core's task table is full.
    NoFreeSlot,
    InvalidArgument,
    StackTooLarge,
    NotFound,
    /// The task is in a state that doesn't allow the operation.
    InvalidState,
    /// The task is executing right now.
    TaskRunning,
    /// Called from outside any task.
    NoCurrentTask,
    /// The tick timer could not be started.
    TimerUnavailable,
    /// Core 1 never reported in after launch.
    Core1Timeout,
    Spinlock(SpinlockError),
    Mpu(MpuError),
    Tz(TzError),
}

impl From<SpinlockError> for SchedError {
    fn from(e: SpinlockError) -> Self {
        Self::Spinlock(e)
    }
}

impl From<MpuError> for SchedError {
    fn from(e: MpuError) -> Self {
        Self::Mpu(e)
    }
}

impl From<TzError> for SchedError {
    fn from(e: TzError) -> Self {
        Self::Tz(e)
    }
}

impl fmt::Display for SpinlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidId => "no such spinlock",
            Self::InvalidCategory => "invalid spinlock category",
            Self::NoneAvailable => "no spinlock available",
            Self::NotAllocated => "spinlock not allocated",
            Self::AlreadyAllocated => "spinlock already allocated",
            Self::ReservedForBroker => "spinlock reserved for the broker",
            Self::NotInitialized => "spinlock broker not initialized",
            Self::PhaseOrder => "spinlock broker phase out of order",
            Self::TooManyComponents => "too many spinlock components",
            Self::NotHeld => "spinlock not held",
            Self::Held => "spinlock still held",
        };
        f.write_str(s)
    }
}

impl fmt::Display for MpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unavailable => "MPU unavailable",
            Self::NoRegions => "no MPU regions given",
            Self::TooManyRegions => "too many MPU regions",
            Self::RegionTooLarge => "MPU region too large",
            Self::Overlap => "MPU regions overlap",
            Self::TableFull => "MPU task table full",
            Self::NoConfig => "no MPU configuration for task",
            Self::InvalidArgument => "invalid MPU argument",
        };
        f.write_str(s)
    }
}

impl fmt::Display for TzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unavailable => "TrustZone unavailable",
            Self::InvalidState => "invalid security state",
            Self::NoConfig => "no security configuration for task",
            Self::TableFull => "TrustZone task table full",
            Self::TooManyFunctions => "secure function table full",
            Self::UnknownFunction => "unknown secure function",
            Self::InvalidArgument => "invalid TrustZone argument",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spinlock(e) => write!(f, "{e}"),
            Self::Mpu(e) => write!(f, "{e}"),
            Self::Tz(e) => write!(f, "{e}"),
            other => {
                let s = match other {
                    Self::NotInitialized => "scheduler not initialized",
                    Self::AlreadyInitialized => "scheduler already initialized",
                    Self::AlreadyRunning => "scheduler already running",
                    Self::NotRunning => "scheduler not running",
                    Self::NoFreeSlot => "no free task slot",
                    Self::InvalidArgument => "invalid argument",
                    Self::StackTooLarge => "stack too large",
                    Self::NotFound => "no such task",
                    Self::InvalidState => "task in wrong state",
                    Self::TaskRunning => "task is running",
                    Self::NoCurrentTask => "not called from a task",
                    Self::TimerUnavailable => "tick timer unavailable",
                    Self::Core1Timeout => "core 1 did not start",
                    _ => "kernel error",
                };
                f.write_str(s)
            }
        }
    }
}
