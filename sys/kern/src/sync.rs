// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-core mutual exclusion for kernel state.
//!
//! A `HwSpinLock<T>` protects a `T` with one of the SIO hardware spinlocks.
//! Locking masks interrupts on the calling core first (so the tick can't
//! come in and try to take the same lock on top of us) and then spins on the
//! hardware lock. The guard undoes both in the opposite order.
//!
//! Which hardware lock to use isn't known until the spinlock broker hands one
//! out, so a `HwSpinLock` starts out *unbound* and is bound at init. An
//! unbound lock only masks interrupts; that's sufficient during bring-up, when
//! core 1 isn't running yet.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::Hardware;

const UNBOUND: u8 = 0xFF;
const NOBODY: u8 = 0xFF;

pub struct HwSpinLock<T> {
    id: AtomicU8,
    /// Index of the core inside the lock, for catching recursion.
    holder: AtomicU8,
    data: UnsafeCell<T>,
}

// As long as the inner type is `Send`, the hardware lock makes sharing the
// cell between cores fine.
unsafe impl<T: Send> Sync for HwSpinLock<T> {}

impl<T> HwSpinLock<T> {
    pub const fn new(initial_value: T) -> Self {
        Self {
            id: AtomicU8::new(UNBOUND),
            holder: AtomicU8::new(NOBODY),
            data: UnsafeCell::new(initial_value),
        }
    }

    /// Binds this cell to hardware spinlock `id`. Must happen before a second
    /// core can touch the cell.
    pub fn bind(&self, id: u8) {
        self.id.store(id, Ordering::Release);
    }

    pub fn bound_id(&self) -> Option<u8> {
        match self.id.load(Ordering::Acquire) {
            UNBOUND => None,
            id => Some(id),
        }
    }

    pub fn lock<'a, H: Hardware>(&'a self, hw: &'a H) -> HwSpinLockGuard<'a, T, H> {
        let saved = hw.disable_interrupts();
        let core = hw.core_id() as u8;

        // With interrupts masked, only this core could have stored its own
        // index here, and only by locking without unlocking.
        if self.holder.load(Ordering::Relaxed) == core {
            crate::fail::die("recursive kernel lock");
        }

        let id = self.bound_id();
        if let Some(id) = id {
            while !hw.spinlock_try_lock(id) {
                core::hint::spin_loop();
            }
        }
        self.holder.store(core, Ordering::Relaxed);

        HwSpinLockGuard {
            lock: self,
            hw,
            id,
            saved,
        }
    }
}

pub struct HwSpinLockGuard<'a, T, H: Hardware> {
    lock: &'a HwSpinLock<T>,
    hw: &'a H,
    id: Option<u8>,
    saved: u32,
}

impl<T, H: Hardware> Deref for HwSpinLockGuard<'_, T, H> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, H: Hardware> DerefMut for HwSpinLockGuard<'_, T, H> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means holding the lock, and `&mut self`
        // means nobody else has this guard's view.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, H: Hardware> Drop for HwSpinLockGuard<'_, T, H> {
    fn drop(&mut self) {
        self.lock.holder.store(NOBODY, Ordering::Relaxed);
        if let Some(id) = self.id {
            self.hw.spinlock_unlock(id);
        }
        self.hw.restore_interrupts(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeHardware;
    use abi::CoreId;

    #[test]
    fn bound_lock_takes_hardware_lock() {
        let hw = FakeHardware::new();
        let cell = HwSpinLock::new(0u32);
        cell.bind(7);
        {
            let mut g = cell.lock(&hw);
            *g += 1;
            assert!(hw.is_locked(7));
            assert!(!hw.interrupts_enabled(CoreId::Core0));
        }
        assert!(!hw.is_locked(7));
        assert!(hw.interrupts_enabled(CoreId::Core0));
        assert_eq!(*cell.lock(&hw), 1);
    }

    #[test]
    fn unbound_lock_only_masks() {
        let hw = FakeHardware::new();
        let cell = HwSpinLock::new(());
        let _g = cell.lock(&hw);
        assert!(!hw.interrupts_enabled(CoreId::Core0));
        assert!((0..32).all(|i| !hw.is_locked(i)));
    }

    #[test]
    #[should_panic(expected = "recursive kernel lock")]
    fn recursion_is_fatal() {
        let hw = FakeHardware::new();
        let cell = HwSpinLock::new(());
        cell.bind(3);
        let _a = cell.lock(&hw);
        let _b = cell.lock(&hw);
    }

    #[test]
    fn other_core_may_lock_after_release() {
        let hw = FakeHardware::new();
        let cell = HwSpinLock::new(5u8);
        cell.bind(2);
        drop(cell.lock(&hw));
        hw.set_core(CoreId::Core1);
        assert_eq!(*cell.lock(&hw), 5);
    }
}
