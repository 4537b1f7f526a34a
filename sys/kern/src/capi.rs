// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C ABI for drivers and other foreign components.
//!
//! The kernel is generic over its hardware, so the C surface can only exist
//! for one concrete `static` kernel. The board crate asks for it with
//!
//! ```ignore
//! static KERNEL: Kernel<Rp2350> = Kernel::new(Rp2350::new(), KernelConfig::DEFAULT);
//! kern::kernel_c_api!(c_api, KERNEL);
//! ```
//!
//! which emits a module `c_api` full of `#[no_mangle] extern "C"` functions
//! named `scheduler_*`, `mpu_*`, `tz_*` and `spinlock_*`.
//!
//! Conventions on the C side:
//!
//! - Task ids are `int32_t`; -1 means "none" or "failed".
//! - Enumerations travel as their `uint8_t` discriminants (see `abi`).
//! - Results are written through out-pointers to the `abi` record types;
//!   a null out-pointer makes the call fail.
//! - Every error is folded into `false`, -1 or 0. Rust callers should use the
//!   `Kernel` methods instead, which say what went wrong.

/// Argument conversions used by the generated functions.
#[doc(hidden)]
pub mod support {
    use core::ffi::{c_char, CStr};

    use abi::TaskId;
    use num_traits::FromPrimitive;

    use crate::tz::NsWindow;

    /// Borrows a NUL-terminated UTF-8 string.
    ///
    /// # Safety
    ///
    /// `p` must be null or point to a NUL-terminated string that outlives
    /// `'a`.
    pub unsafe fn str_arg<'a>(p: *const c_char) -> Option<&'a str> {
        if p.is_null() {
            return None;
        }
        CStr::from_ptr(p).to_str().ok()
    }

    /// Borrows `len` elements at `p`. A null `p` is only accepted for an
    /// empty slice.
    ///
    /// # Safety
    ///
    /// A non-null `p` must point to `len` initialized elements that outlive
    /// `'a`.
    pub unsafe fn slice_arg<'a, T>(p: *const T, len: usize) -> Option<&'a [T]> {
        match (p.is_null(), len) {
            (true, 0) => Some(&[]),
            (true, _) => None,
            (false, _) => Some(core::slice::from_raw_parts(p, len)),
        }
    }

    /// Writes `value` to `out`, failing on null.
    ///
    /// # Safety
    ///
    /// A non-null `out` must be valid for writes.
    pub unsafe fn put<T>(out: *mut T, value: T) -> bool {
        if out.is_null() {
            return false;
        }
        out.write(value);
        true
    }

    pub fn task(raw: i32) -> Option<TaskId> {
        TaskId::from_raw(raw)
    }

    pub fn enum_arg<T: FromPrimitive>(raw: u8) -> Option<T> {
        T::from_u8(raw)
    }

    /// A window of zero size is no window.
    pub fn window(base: u32, size: u32) -> Option<NsWindow> {
        (size != 0).then(|| NsWindow::new(base, size))
    }

    pub fn id_or_error<E>(r: Result<TaskId, E>) -> i32 {
        r.map_or(abi::TASK_ID_ERROR, TaskId::to_raw)
    }

    pub fn lock_or_error<E>(r: Result<u8, E>) -> i32 {
        r.map_or(-1, i32::from)
    }
}

/// Emits the C ABI, as module `$name`, for the kernel `static` at `$kernel`.
#[macro_export]
macro_rules! kernel_c_api {
    ($name:ident, $kernel:path) => {
        #[allow(clippy::missing_safety_doc)]
        pub mod $name {
            #[allow(unused_imports)]
            use super::*;

            use core::ffi::{c_char, c_void};

            use $crate::abi::{
                self, Affinity, CoreId, DeadlineInfo, RawRegion, SchedulerStats,
                SpinlockInfo, TaskInfo, TzStatus, MPU_REGIONS_PER_TASK,
            };
            use $crate::capi::support as s;
            use $crate::mpu::{self, TaskMpuConfig};
            use $crate::spinlock::{PhaseCallback, Save};
            use $crate::task::{Entry, MissHandler, Params, TaskDef};
            use $crate::tz::TzTaskConfig;

            // ---- scheduler ----

            #[no_mangle]
            pub extern "C" fn scheduler_init() -> bool {
                $kernel.init().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn scheduler_start() -> bool {
                $kernel.start().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn scheduler_stop() -> bool {
                $kernel.stop().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn scheduler_run_pending_tasks() -> bool {
                $kernel.run_pending_tasks()
            }

            /// For the tick interrupt handler.
            #[no_mangle]
            pub extern "C" fn scheduler_tick() {
                $kernel.on_tick_interrupt()
            }

            #[no_mangle]
            pub unsafe extern "C" fn scheduler_create_task(
                entry: Option<extern "C" fn(*mut c_void)>,
                params: *mut c_void,
                stack_size: u32,
                priority: u8,
                name: *const c_char,
                core_affinity: i32,
                task_type: u8,
            ) -> i32 {
                let (Some(func), Some(name), Some(priority), Some(affinity), Some(kind)) = (
                    entry,
                    s::str_arg(name),
                    s::enum_arg(priority),
                    Affinity::from_raw(core_affinity),
                    s::enum_arg(task_type),
                ) else {
                    return abi::TASK_ID_ERROR;
                };
                s::id_or_error($kernel.create_task(TaskDef {
                    name,
                    entry: Entry::Foreign {
                        func,
                        params: Params(params),
                    },
                    stack_size,
                    priority,
                    affinity,
                    kind,
                }))
            }

            #[no_mangle]
            pub extern "C" fn scheduler_delete_task(id: i32) -> bool {
                s::task(id).is_some_and(|id| $kernel.delete_task(id).is_ok())
            }

            #[no_mangle]
            pub extern "C" fn scheduler_suspend_task(id: i32) -> bool {
                s::task(id).is_some_and(|id| $kernel.suspend_task(id).is_ok())
            }

            #[no_mangle]
            pub extern "C" fn scheduler_resume_task(id: i32) -> bool {
                s::task(id).is_some_and(|id| $kernel.resume_task(id).is_ok())
            }

            #[no_mangle]
            pub extern "C" fn scheduler_yield() {
                $kernel.yield_now().ok();
            }

            #[no_mangle]
            pub extern "C" fn scheduler_delay(ms: u32) {
                $kernel.delay(ms).ok();
            }

            #[no_mangle]
            pub extern "C" fn scheduler_delay_blocking(ms: u32) {
                $kernel.delay_blocking(ms)
            }

            #[no_mangle]
            pub extern "C" fn scheduler_get_current_task_id() -> i32 {
                $kernel
                    .get_current_task_id()
                    .map_or(abi::TASK_ID_ERROR, |id| id.to_raw())
            }

            #[no_mangle]
            pub extern "C" fn scheduler_get_current_task(core: u8) -> i32 {
                CoreId::from_index(usize::from(core))
                    .and_then(|core| $kernel.get_current_task(core))
                    .map_or(abi::TASK_ID_ERROR, |id| id.to_raw())
            }

            /// -1 clears the core's current task.
            #[no_mangle]
            pub extern "C" fn scheduler_set_current_task(core: u8, id: i32) -> bool {
                let Some(core) = CoreId::from_index(usize::from(core)) else {
                    return false;
                };
                let id = match id {
                    abi::TASK_ID_ERROR => None,
                    raw => match s::task(raw) {
                        Some(id) => Some(id),
                        None => return false,
                    },
                };
                $kernel.set_current_task(core, id).is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn scheduler_get_task_info(
                id: i32,
                out: *mut TaskInfo,
            ) -> bool {
                match s::task(id).map(|id| $kernel.get_task_info(id)) {
                    Some(Ok(info)) => s::put(out, info),
                    _ => false,
                }
            }

            #[no_mangle]
            pub unsafe extern "C" fn scheduler_get_stats(out: *mut SchedulerStats) -> bool {
                s::put(out, $kernel.get_stats())
            }

            #[no_mangle]
            pub extern "C" fn scheduler_set_deadline(
                id: i32,
                kind: u8,
                period_ms: u32,
                deadline_ms: u32,
                budget_us: u32,
            ) -> bool {
                let (Some(id), Some(kind)) = (s::task(id), s::enum_arg(kind)) else {
                    return false;
                };
                $kernel
                    .set_deadline(id, kind, period_ms, deadline_ms, budget_us)
                    .is_ok()
            }

            #[no_mangle]
            pub extern "C" fn scheduler_set_deadline_miss_handler(
                id: i32,
                handler: Option<extern "C" fn(i32)>,
            ) -> bool {
                s::task(id).is_some_and(|id| {
                    $kernel
                        .set_deadline_miss_handler(id, handler.map(MissHandler::Foreign))
                        .is_ok()
                })
            }

            #[no_mangle]
            pub unsafe extern "C" fn scheduler_get_deadline_info(
                id: i32,
                out: *mut DeadlineInfo,
            ) -> bool {
                match s::task(id).map(|id| $kernel.get_deadline_info(id)) {
                    Some(Ok(info)) => s::put(out, info),
                    _ => false,
                }
            }

            #[no_mangle]
            pub extern "C" fn scheduler_set_mpu_protection(
                id: i32,
                stack_base: u32,
                stack_size: u32,
                code_base: u32,
                code_size: u32,
            ) -> bool {
                s::task(id).is_some_and(|id| {
                    $kernel
                        .set_mpu_protection(id, stack_base, stack_size, code_base, code_size)
                        .is_ok()
                })
            }

            #[no_mangle]
            pub extern "C" fn scheduler_enable_tracing(on: bool) {
                $kernel.enable_tracing(on)
            }

            // ---- MPU ----

            #[no_mangle]
            pub extern "C" fn mpu_init() -> bool {
                $kernel.mpu().init().is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn mpu_configure_task(
                task: i32,
                regions: *const RawRegion,
                count: u8,
            ) -> bool {
                let (Some(task), Some(raw)) =
                    (s::task(task), s::slice_arg(regions, usize::from(count)))
                else {
                    return false;
                };
                TaskMpuConfig::from_raw(task, raw)
                    .and_then(|config| $kernel.mpu().configure_task(&config))
                    .is_ok()
            }

            #[no_mangle]
            pub extern "C" fn mpu_apply_task_settings(task: i32) -> bool {
                s::task(task).is_some_and(|t| $kernel.mpu().apply_task_settings(t).is_ok())
            }

            #[no_mangle]
            pub extern "C" fn mpu_reset_task_settings() -> bool {
                $kernel.mpu().reset_task_settings().is_ok()
            }

            /// `out` must have room for `MPU_REGIONS_PER_TASK` regions.
            #[no_mangle]
            pub unsafe extern "C" fn mpu_create_default_config(
                task: i32,
                stack_base: u32,
                stack_size: u32,
                code_base: u32,
                code_size: u32,
                out: *mut RawRegion,
                out_count: *mut u8,
            ) -> bool {
                let Some(task) = s::task(task) else {
                    return false;
                };
                match mpu::create_default_config(task, stack_base, stack_size, code_base, code_size) {
                    Ok(config) => write_regions(&config, out, out_count),
                    Err(_) => false,
                }
            }

            /// `out` must have room for `MPU_REGIONS_PER_TASK` regions.
            #[no_mangle]
            pub unsafe extern "C" fn mpu_get_task_config(
                task: i32,
                out: *mut RawRegion,
                out_count: *mut u8,
            ) -> bool {
                match s::task(task).and_then(|t| $kernel.mpu().get_task_config(t)) {
                    Some(config) => write_regions(&config, out, out_count),
                    None => false,
                }
            }

            unsafe fn write_regions(
                config: &TaskMpuConfig,
                out: *mut RawRegion,
                out_count: *mut u8,
            ) -> bool {
                if out.is_null() {
                    return false;
                }
                let out = core::slice::from_raw_parts_mut(out, MPU_REGIONS_PER_TASK);
                for (o, r) in out.iter_mut().zip(config.regions()) {
                    *o = r.to_raw();
                }
                s::put(out_count, config.regions().len() as u8)
            }

            #[no_mangle]
            pub extern "C" fn mpu_is_accessible(address: u32, size: u32, write: bool) -> bool {
                mpu::is_accessible(address, size, write)
            }

            // ---- TrustZone ----

            #[no_mangle]
            pub extern "C" fn tz_init() -> bool {
                $kernel.tz().init().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn tz_is_supported() -> bool {
                $kernel.tz().is_supported()
            }

            #[no_mangle]
            pub extern "C" fn tz_is_enabled() -> bool {
                $kernel.tz().is_enabled()
            }

            #[no_mangle]
            pub extern "C" fn tz_get_security_state() -> u8 {
                $kernel.tz().get_security_state() as u8
            }

            /// Zero-sized windows are omitted.
            #[no_mangle]
            pub unsafe extern "C" fn tz_configure_task(
                task: i32,
                state: u8,
                code_base: u32,
                code_size: u32,
                data_base: u32,
                data_size: u32,
                functions: *const u8,
                function_count: u8,
            ) -> bool {
                let (Some(task), Some(state), Some(functions)) = (
                    s::task(task),
                    s::enum_arg(state),
                    s::slice_arg(functions, usize::from(function_count)),
                ) else {
                    return false;
                };
                let mut config = TzTaskConfig::new(task, state).with_windows(
                    s::window(code_base, code_size),
                    s::window(data_base, data_size),
                );
                if functions.iter().any(|&f| config.allow(f).is_err()) {
                    return false;
                }
                $kernel.tz().configure_task(&config).is_ok()
            }

            #[no_mangle]
            pub extern "C" fn tz_apply_task_settings(task: i32) -> bool {
                s::task(task).is_some_and(|t| $kernel.tz().apply_task_settings(t).is_ok())
            }

            #[no_mangle]
            pub extern "C" fn tz_reset_task_settings() -> bool {
                $kernel.tz().reset_task_settings().is_ok()
            }

            /// Returns the function's registry index, or -1. The callable
            /// veneer address goes to `veneer` if that isn't null.
            #[no_mangle]
            pub unsafe extern "C" fn tz_register_secure_function(
                name: *const c_char,
                function: *const c_void,
                veneer: *mut *const c_void,
            ) -> i32 {
                let Some(name) = s::str_arg(name) else {
                    return -1;
                };
                match $kernel.tz().register_secure_function(name, function as usize) {
                    Ok(v) => {
                        if !veneer.is_null() {
                            s::put(veneer, v.entry() as *const c_void);
                        }
                        i32::from(v.index)
                    }
                    Err(_) => -1,
                }
            }

            #[no_mangle]
            pub unsafe extern "C" fn tz_get_status(out: *mut TzStatus) -> bool {
                s::put(out, $kernel.tz().get_status())
            }

            // ---- spinlocks ----

            #[no_mangle]
            pub extern "C" fn spinlock_manager_init_core() -> bool {
                $kernel.spinlocks().init_core().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn spinlock_init_tracking() -> bool {
                $kernel.spinlocks().init_tracking().is_ok()
            }

            #[no_mangle]
            pub extern "C" fn spinlock_init_full() -> bool {
                $kernel.spinlocks().init_full().is_ok()
            }

            #[no_mangle]
            pub unsafe extern "C" fn spinlock_register_component(
                name: *const c_char,
                callback: Option<extern "C" fn(u8)>,
            ) -> bool {
                let (Some(name), Some(callback)) = (s::str_arg(name), callback) else {
                    return false;
                };
                $kernel
                    .spinlocks()
                    .register_component(name, PhaseCallback::Foreign(callback))
                    .is_ok()
            }

            /// Returns the claimed lock's id, or -1.
            #[no_mangle]
            pub extern "C" fn spinlock_bootstrap_claim(self_tracking: bool) -> i32 {
                $kernel
                    .spinlocks()
                    .bootstrap_claim(self_tracking)
                    .map_or(-1, |l| i32::from(l.id()))
            }

            #[no_mangle]
            pub unsafe extern "C" fn spinlock_register_external(
                id: u8,
                category: u8,
                owner: *const c_char,
            ) -> bool {
                let (Some(category), Some(owner)) = (s::enum_arg(category), s::str_arg(owner))
                else {
                    return false;
                };
                $kernel
                    .spinlocks()
                    .register_external(id, category, owner)
                    .is_ok()
            }

            /// Returns the allocated lock's id, or -1.
            #[no_mangle]
            pub unsafe extern "C" fn spinlock_allocate(category: u8, owner: *const c_char) -> i32 {
                let (Some(category), Some(owner)) = (s::enum_arg(category), s::str_arg(owner))
                else {
                    return -1;
                };
                s::lock_or_error($kernel.spinlocks().allocate(category, owner))
            }

            #[no_mangle]
            pub extern "C" fn spinlock_free(id: u8) -> bool {
                $kernel.spinlocks().free(id).is_ok()
            }

            /// Acquires lock `id` on behalf of `task` (-1 for none). The
            /// saved interrupt state to hand back to `spinlock_release` goes
            /// to `save`.
            #[no_mangle]
            pub unsafe extern "C" fn spinlock_acquire(id: u8, task: i32, save: *mut u32) -> bool {
                if save.is_null() {
                    return false;
                }
                let task = s::task(task).unwrap_or(abi::TaskId::NONE);
                match $kernel.spinlocks().acquire(id, task) {
                    Ok(saved) => s::put(save, saved.into_raw()),
                    Err(_) => false,
                }
            }

            #[no_mangle]
            pub extern "C" fn spinlock_release(id: u8, save: u32) -> bool {
                $kernel.spinlocks().release(id, Save::from_raw(save)).is_ok()
            }

            /// Returns how many locks were released.
            #[no_mangle]
            pub extern "C" fn spinlock_release_by_task(task: i32) -> u32 {
                s::task(task).map_or(0, |t| $kernel.spinlocks().release_by_task(t))
            }

            #[no_mangle]
            pub unsafe extern "C" fn spinlock_get_info(id: u8, out: *mut SpinlockInfo) -> bool {
                match $kernel.spinlocks().get_info(id) {
                    Ok(info) => s::put(out, info),
                    Err(_) => false,
                }
            }

            #[no_mangle]
            pub extern "C" fn spinlock_get_count_by_category(category: u8) -> u32 {
                s::enum_arg(category)
                    .map_or(0, |c| $kernel.spinlocks().count_by_category(c) as u32)
            }

            #[no_mangle]
            pub extern "C" fn spinlock_get_total_count() -> u32 {
                $kernel.spinlocks().total_count() as u32
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::support::*;
    use abi::{TaskId, TaskKind};

    #[test]
    fn null_arguments() {
        unsafe {
            assert_eq!(str_arg(core::ptr::null()), None);
            assert_eq!(slice_arg::<u8>(core::ptr::null(), 0), Some(&[][..]));
            assert_eq!(slice_arg::<u8>(core::ptr::null(), 1), None);
            assert!(!put(core::ptr::null_mut::<u32>(), 5));
        }
    }

    #[test]
    fn strings_must_be_utf8() {
        let good = b"sensor\0";
        let bad = b"\xff\0";
        unsafe {
            assert_eq!(str_arg(good.as_ptr().cast()), Some("sensor"));
            assert_eq!(str_arg(bad.as_ptr().cast()), None);
        }
    }

    #[test]
    fn conversions() {
        assert_eq!(task(-1), None);
        assert_eq!(task(3), Some(TaskId(3)));
        assert_eq!(enum_arg::<TaskKind>(0), Some(TaskKind::OneShot));
        assert_eq!(enum_arg::<TaskKind>(7), None);
        assert_eq!(window(0x1000, 0), None);
        assert_eq!(id_or_error::<()>(Ok(TaskId(4))), 4);
        assert_eq!(id_or_error(Err(())), -1);
        assert_eq!(lock_or_error::<()>(Ok(9)), 9);
    }
}
