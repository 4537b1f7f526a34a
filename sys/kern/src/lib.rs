// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-core real-time kernel.
//!
//! The kernel runs on a pair of symmetric Cortex-M33 cores sharing SRAM. It
//! is made of four cooperating parts, leaves first:
//!
//! - the [`spinlock`] broker, which hands the 32 SIO hardware spinlocks out to
//!   subsystems and tracks who holds them;
//! - the [`mpu`] manager, which keeps per-task region sets and loads them into
//!   the MPU before a task is dispatched;
//! - the [`tz`] manager, which attributes tasks to a security state and owns
//!   the table of secure functions reachable through NSC veneers;
//! - the scheduler ([`sched`]), which owns the task tables, the tick, and the
//!   per-core dispatch loop that drives the other three.
//!
//! All of this state lives in one [`Kernel`] value, normally a `static`. The
//! hardware is reached through the [`arch::Hardware`] trait so that the whole
//! thing can be run on a development machine against
//! [`arch::fake::FakeHardware`].
//!
//! # Design principles
//!
//! 1. Static configuration. Tables are fixed-size and the kernel never
//!    allocates.
//! 2. User code is never called from the tick, and never with a kernel lock
//!    held. The tick only moves task state around; each core's dispatch loop
//!    is the only place tasks run.
//! 3. A preference for simple and clear algorithms over fast and clever ones.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod fail;
#[macro_use]
pub mod klog;

pub mod arch;
pub mod capi;
pub mod config;
pub mod err;
pub mod kernel;
pub mod mpu;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod task;
pub mod time;
pub mod trace;
pub mod tz;
pub mod util;

pub use abi;
pub use arch::Hardware;
pub use config::{HardDeadlinePolicy, KernelConfig};
pub use err::{MpuError, SchedError, SpinlockError, TzError};
pub use kernel::Kernel;
pub use task::{Entry, MissHandler, Runnable, TaskContext, TaskDef};
