// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The C ABI, driven the way a C driver would drive it.
//!
//! There's exactly one kernel behind the C functions, so everything happens
//! in one test, in order.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use kern::abi::{
    DeadlineInfo, DeadlineKind, InitPhase, LockCategory, Priority, RawRegion,
    SchedulerStats, SecurityState, SpinlockInfo, TaskInfo, TaskKind, TzStatus,
    MPU_REGIONS_PER_TASK,
};
use kern::arch::fake::FakeHardware;
use kern::{Kernel, KernelConfig};

static KERNEL: Kernel<FakeHardware> =
    Kernel::new(FakeHardware::new(), KernelConfig::DEFAULT);

kern::kernel_c_api!(c_api, KERNEL);

use c_api::*;

static RUNS: AtomicU32 = AtomicU32::new(0);
static PHASE: AtomicU8 = AtomicU8::new(0xFF);
static MISSED: AtomicI32 = AtomicI32::new(0);

extern "C" fn bump(params: *mut c_void) {
    // Safety: created with a pointer to `RUNS`.
    let runs = unsafe { &*(params as *const AtomicU32) };
    runs.fetch_add(1, Ordering::Relaxed);
}

extern "C" fn phase_changed(phase: u8) {
    PHASE.store(phase, Ordering::Relaxed);
}

extern "C" fn missed(task: i32) {
    MISSED.store(task, Ordering::Relaxed);
}

extern "C" fn stall(_: *mut c_void) {
    KERNEL.hw().advance_ms(2);
}

extern "C" fn secure_service() {}

fn name(s: &'static [u8]) -> *const std::ffi::c_char {
    assert_eq!(s.last(), Some(&0));
    s.as_ptr().cast()
}

#[test]
fn c_surface() {
    unsafe {
        // Components can subscribe before anything is up.
        assert!(spinlock_register_component(name(b"drv\0"), Some(phase_changed)));
        assert!(!spinlock_register_component(name(b"drv\0"), None));
        assert_eq!(spinlock_allocate(LockCategory::User as u8, name(b"early\0")), -1);

        assert!(scheduler_init());
        assert!(!scheduler_init());
        assert_eq!(PHASE.load(Ordering::Relaxed), InitPhase::Tracking as u8);
        assert!(spinlock_init_full());
        assert_eq!(PHASE.load(Ordering::Relaxed), InitPhase::Full as u8);
        assert!(mpu_init());
        assert!(tz_init());

        // Tasks.
        let runs = &RUNS as *const AtomicU32 as *mut c_void;
        let id = scheduler_create_task(
            Some(bump),
            runs,
            1024,
            Priority::Normal as u8,
            name(b"blink\0"),
            0,
            TaskKind::Persistent as u8,
        );
        assert!(id >= 1);
        let entry: Option<extern "C" fn(*mut c_void)> = Some(bump);
        for (affinity, priority, entry) in [(5, 2, entry), (0, 9, entry), (0, 2, None)] {
            assert_eq!(
                scheduler_create_task(entry, runs, 1024, priority, name(b"bad\0"), affinity, 1),
                -1
            );
        }
        assert_eq!(
            scheduler_create_task(Some(bump), runs, 1024, 2, ptr::null(), 0, 1),
            -1
        );

        let mut info = TaskInfo::default();
        assert!(scheduler_get_task_info(id, &mut info));
        assert_eq!(info.id, id as u32);
        assert_eq!(info.name(), "blink");
        assert!(!scheduler_get_task_info(id, ptr::null_mut()));
        assert!(!scheduler_get_task_info(-1, &mut info));

        // Dispatch.
        assert!(!scheduler_run_pending_tasks());
        assert!(scheduler_start());
        assert!(!scheduler_start());
        scheduler_tick();
        assert_eq!(KERNEL.hw().tick_acks(), 1);
        assert!(scheduler_run_pending_tasks());
        assert_eq!(RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler_get_current_task(0), id);
        assert_eq!(scheduler_get_current_task(1), -1);
        assert_eq!(scheduler_get_current_task(2), -1);
        assert_eq!(scheduler_get_current_task_id(), id);
        assert!(scheduler_set_current_task(0, -1));
        assert_eq!(scheduler_get_current_task(0), -1);
        assert!(scheduler_set_current_task(0, id));
        assert!(!scheduler_set_current_task(1, id));

        let mut stats = SchedulerStats::default();
        assert!(scheduler_get_stats(&mut stats));
        assert_eq!(stats.tick_count, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.task_creates, 1);

        // Deadlines.
        assert!(!scheduler_set_deadline(id, DeadlineKind::Soft as u8, 0, 0, 0));
        assert!(!scheduler_set_deadline(id, 7, 0, 5, 0));
        assert!(scheduler_set_deadline(id, DeadlineKind::Soft as u8, 0, 5, 0));
        assert!(scheduler_set_deadline_miss_handler(id, Some(missed)));
        let mut d = DeadlineInfo::default();
        assert!(scheduler_get_deadline_info(id, &mut d));
        assert_eq!(d.kind(), Some(DeadlineKind::Soft));
        assert_eq!(d.has_handler, 1);

        let slow = scheduler_create_task(
            Some(stall),
            ptr::null_mut(),
            1024,
            Priority::Critical as u8,
            name(b"slow\0"),
            0,
            TaskKind::OneShot as u8,
        );
        assert!(scheduler_set_deadline(slow, DeadlineKind::Hard as u8, 0, 1, 0));
        assert!(scheduler_set_deadline_miss_handler(slow, Some(missed)));
        scheduler_tick();
        assert!(scheduler_run_pending_tasks());
        assert_eq!(MISSED.load(Ordering::Relaxed), slow);
        // One-shots are gone once they return.
        assert!(!scheduler_get_task_info(slow, &mut info));
        assert!(scheduler_get_stats(&mut stats));
        assert_eq!(stats.deadline_misses, 1);

        // MPU.
        let mut regions = [RawRegion::default(); MPU_REGIONS_PER_TASK];
        let mut count = 0u8;
        assert!(mpu_create_default_config(
            id,
            info.stack_base,
            1024,
            0x1000_0000,
            0x1000,
            regions.as_mut_ptr(),
            &mut count
        ));
        assert_eq!(count, 4);
        assert!(mpu_configure_task(id, regions.as_ptr(), count));
        assert!(!mpu_configure_task(id, ptr::null(), 1));
        let mut back = [RawRegion::default(); MPU_REGIONS_PER_TASK];
        let mut back_count = 0u8;
        assert!(mpu_get_task_config(id, back.as_mut_ptr(), &mut back_count));
        assert_eq!(back_count, count);
        assert_eq!(back[2], regions[2]);
        assert!(mpu_apply_task_settings(id));
        assert!(mpu_reset_task_settings());
        assert!(mpu_reset_task_settings());
        assert!(!mpu_apply_task_settings(-1));
        assert!(mpu_is_accessible(0x2000_0000, 4, true));
        assert!(mpu_is_accessible(0x1000_0000, 4, false));
        assert!(!mpu_is_accessible(0x1000_0000, 4, true));
        assert!(scheduler_set_mpu_protection(id, info.stack_base, 1024, 0x1000_0000, 0x1000));

        // TrustZone.
        assert!(tz_is_supported());
        assert!(tz_is_enabled());
        assert_eq!(tz_get_security_state(), SecurityState::Secure as u8);
        let mut veneer: *const c_void = ptr::null();
        let f = tz_register_secure_function(
            name(b"service\0"),
            secure_service as *const c_void,
            &mut veneer,
        );
        assert_eq!(f, 0);
        assert!(!veneer.is_null());
        assert_eq!(veneer as usize & 1, 1);
        assert_eq!(
            tz_register_secure_function(name(b"service\0"), secure_service as *const c_void, ptr::null_mut()),
            0
        );
        assert_eq!(
            tz_register_secure_function(ptr::null(), secure_service as *const c_void, ptr::null_mut()),
            -1
        );
        let allowed = [0u8];
        assert!(tz_configure_task(
            id,
            SecurityState::NonSecure as u8,
            0x1010_0000,
            0x1000,
            0x2000_8000,
            0x1000,
            allowed.as_ptr(),
            1
        ));
        let unknown = [5u8];
        assert!(!tz_configure_task(id, SecurityState::NonSecure as u8, 0, 0, 0, 0, unknown.as_ptr(), 1));
        assert!(tz_apply_task_settings(id));
        assert!(tz_reset_task_settings());
        let mut status = TzStatus::default();
        assert!(tz_get_status(&mut status));
        assert_eq!(status.nonsecure_tasks, 1);
        assert_eq!(status.secure_functions, 1);
        assert_eq!(status.supported, 1);

        // Spinlocks.
        let before = spinlock_get_total_count();
        let lock = spinlock_allocate(LockCategory::Sensor as u8, name(b"imu\0"));
        assert!(lock >= 0);
        assert_eq!(spinlock_allocate(LockCategory::Unused as u8, name(b"x\0")), -1);
        assert_eq!(spinlock_get_count_by_category(LockCategory::Sensor as u8), 1);
        assert_eq!(spinlock_get_total_count(), before + 1);

        let mut save = 0u32;
        assert!(!spinlock_acquire(lock as u8, id, ptr::null_mut()));
        assert!(spinlock_acquire(lock as u8, id, &mut save));
        let mut li = SpinlockInfo::default();
        assert!(spinlock_get_info(lock as u8, &mut li));
        assert_eq!(li.holder, id as u32);
        assert_eq!(li.owner(), "imu");
        assert_eq!(spinlock_release_by_task(id), 1);
        assert_eq!(spinlock_release_by_task(id), 0);
        assert!(!spinlock_release(lock as u8, save));

        assert!(spinlock_acquire(lock as u8, -1, &mut save));
        assert!(!spinlock_free(lock as u8));
        assert!(spinlock_release(lock as u8, save));
        assert!(spinlock_free(lock as u8));
        assert!(!spinlock_free(lock as u8));

        let claimed = spinlock_bootstrap_claim(true);
        assert!(claimed >= 0);
        assert!(spinlock_register_external(claimed as u8, LockCategory::I2c as u8, name(b"i2c0\0")));
        assert!(!spinlock_register_external(claimed as u8, LockCategory::I2c as u8, name(b"i2c0\0")));
        assert_eq!(spinlock_get_count_by_category(LockCategory::I2c as u8), 1);

        // Lifecycle.
        assert!(scheduler_suspend_task(id));
        assert!(!scheduler_suspend_task(id));
        assert!(scheduler_resume_task(id));
        assert!(scheduler_delete_task(id));
        assert!(!scheduler_delete_task(id));
        assert!(!scheduler_delete_task(-1));

        scheduler_enable_tracing(true);
        assert!(scheduler_stop());
        assert!(!scheduler_stop());
    }
}
