// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware spinlock broker.
//!
//! The SIO block has 32 hardware spinlocks, shared by every subsystem on both
//! cores. The broker hands them out by category, remembers which subsystem
//! owns each one and which task currently holds it, and keeps hold-time
//! statistics.
//!
//! # Claims and records
//!
//! There are two layers of bookkeeping. The *claim mask* is a single atomic
//! word with one bit per hardware lock; a set bit means someone has the lock,
//! whether or not the broker knows who. The *records* hold the details, and
//! are protected by the broker's own hardware lock.
//!
//! Some clients need a lock before the broker itself is up. They use
//! [`Spinlocks::bootstrap_claim`], which touches only the claim mask and so
//! works at any time. Bootstrap claims that don't track themselves are
//! promoted into records (with a placeholder owner) when the broker reaches
//! `InitPhase::Tracking`; a client can then give its lock a real name with
//! [`Spinlocks::register_external`].
//!
//! # Phases
//!
//! `Uninit` → `Core` → `Tracking` → `Full`, strictly in that order. Each
//! transition notifies registered components, outside the broker lock, so
//! that a callback may call back into the broker.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use abi::{
    CoreId, InitPhase, LockCategory, SpinlockInfo, TaskId, SPINLOCK_COUNT,
};
use num_traits::FromPrimitive;

use crate::arch::Hardware;
use crate::err::SpinlockError;
use crate::sync::HwSpinLock;
use crate::time::Timestamp;
use crate::util::FixedName;

static_assertions::const_assert!(SPINLOCK_COUNT <= 32);

/// Longest owner name retained.
pub const OWNER_NAME_LEN: usize = 23;

/// Most components that can subscribe to phase changes.
pub const MAX_COMPONENTS: usize = 8;

const COMPONENT_NAME_LEN: usize = 16;
const BROKER_OWNER: &str = "spinlock-broker";
const BOOTSTRAP_OWNER: &str = "bootstrap";
const NO_LOCK: u8 = 0xFF;

/// Interrupt state saved by `acquire`, to be handed back to `release`.
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub struct Save(u32);

impl Save {
    /// Rebuilds a token that crossed the C ABI.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn into_raw(self) -> u32 {
        self.0
    }
}

/// A hardware lock claimed through the bootstrap path.
///
/// This is deliberately a different type from a broker-allocated lock id: the
/// broker keeps no statistics on it until it's registered, and locking it is
/// raw hardware access.
#[derive(Debug, Eq, PartialEq)]
pub struct BootstrapLock {
    id: u8,
}

impl BootstrapLock {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn lock<H: Hardware>(&self, hw: &H) -> Save {
        let saved = hw.disable_interrupts();
        while !hw.spinlock_try_lock(self.id) {
            core::hint::spin_loop();
        }
        Save(saved)
    }

    pub fn unlock<H: Hardware>(&self, hw: &H, save: Save) {
        hw.spinlock_unlock(self.id);
        hw.restore_interrupts(save.0);
    }
}

/// Something to call when the broker changes phase.
pub enum PhaseCallback<H: Hardware> {
    Native(fn(&Spinlocks<'_, H>, InitPhase)),
    /// A C component; gets the phase as a raw `InitPhase`.
    Foreign(extern "C" fn(u8)),
}

impl<H: Hardware> Clone for PhaseCallback<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for PhaseCallback<H> {}

struct Subscriber<H: Hardware> {
    name: FixedName<COMPONENT_NAME_LEN>,
    callback: PhaseCallback<H>,
}

impl<H: Hardware> Clone for Subscriber<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for Subscriber<H> {}

#[derive(Copy, Clone, Debug)]
struct LockRecord {
    allocated: bool,
    /// Promoted from a bootstrap claim; may still be registered by name.
    provisional: bool,
    category: LockCategory,
    owner: FixedName<OWNER_NAME_LEN>,
    holder: TaskId,
    /// Set while held through `acquire`.
    held: Option<HeldBy>,
    acquisitions: u32,
    total_held_us: u64,
    max_held_us: u64,
    last_acquired: Timestamp,
}

#[derive(Copy, Clone, Debug)]
struct HeldBy {
    since: Timestamp,
    core: CoreId,
    save: u32,
    /// Broker-wide acquisition order, for unwinding interrupt state.
    seq: u32,
}

impl LockRecord {
    const FREE: Self = Self {
        allocated: false,
        provisional: false,
        category: LockCategory::Unused,
        owner: FixedName::EMPTY,
        holder: TaskId::NONE,
        held: None,
        acquisitions: 0,
        total_held_us: 0,
        max_held_us: 0,
        last_acquired: Timestamp::ZERO,
    };

    fn allocate(category: LockCategory, owner: &str) -> Self {
        Self {
            allocated: true,
            category,
            owner: FixedName::new(owner),
            ..Self::FREE
        }
    }

    /// Folds a finished hold into the statistics and clears the holder.
    fn end_hold(&mut self, now: Timestamp) -> Option<HeldBy> {
        let held = self.held.take()?;
        let dt = now.since(held.since);
        self.total_held_us = self.total_held_us.saturating_add(dt);
        self.max_held_us = self.max_held_us.max(dt);
        self.holder = TaskId::NONE;
        Some(held)
    }
}

struct BrokerState<H: Hardware> {
    records: [LockRecord; SPINLOCK_COUNT],
    subscribers: heapless::Vec<Subscriber<H>, MAX_COMPONENTS>,
    seq: u32,
}

/// Broker state. Reach it through [`Spinlocks`].
pub struct SpinlockBroker<H: Hardware> {
    phase: AtomicU8,
    own: AtomicU8,
    claimed: AtomicU32,
    pending: AtomicU32,
    state: HwSpinLock<BrokerState<H>>,
}

impl<H: Hardware> SpinlockBroker<H> {
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(InitPhase::Uninit as u8),
            own: AtomicU8::new(NO_LOCK),
            claimed: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            state: HwSpinLock::new(BrokerState {
                records: [LockRecord::FREE; SPINLOCK_COUNT],
                subscribers: heapless::Vec::new(),
                seq: 0,
            }),
        }
    }
}

impl<H: Hardware> Default for SpinlockBroker<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sets the lowest clear bit of `mask` and returns its index.
fn claim_first_free(mask: &AtomicU32) -> Option<u8> {
    let mut current = mask.load(Ordering::Relaxed);
    loop {
        let free = !current;
        if free == 0 {
            return None;
        }
        let bit = free.trailing_zeros();
        match mask.compare_exchange_weak(
            current,
            current | 1 << bit,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Some(bit as u8),
            Err(actual) => current = actual,
        }
    }
}

/// The broker's operations, bound to a hardware instance.
pub struct Spinlocks<'a, H: Hardware> {
    broker: &'a SpinlockBroker<H>,
    hw: &'a H,
}

impl<'a, H: Hardware> Spinlocks<'a, H> {
    pub fn new(broker: &'a SpinlockBroker<H>, hw: &'a H) -> Self {
        Self { broker, hw }
    }

    pub fn phase(&self) -> InitPhase {
        InitPhase::from_u8(self.broker.phase.load(Ordering::Acquire))
            .unwrap_or(InitPhase::Uninit)
    }

    /// The lock protecting the broker's own records.
    pub fn broker_lock(&self) -> Option<u8> {
        match self.broker.own.load(Ordering::Acquire) {
            NO_LOCK => None,
            id => Some(id),
        }
    }

    /// Phase `Core`: clears the records and claims the broker's own lock.
    pub fn init_core(&self) -> Result<(), SpinlockError> {
        if self.phase() >= InitPhase::Core {
            return Ok(());
        }
        let own = claim_first_free(&self.broker.claimed)
            .ok_or(SpinlockError::NoneAvailable)?;
        {
            let mut st = self.broker.state.lock(self.hw);
            st.records = [LockRecord::FREE; SPINLOCK_COUNT];
            st.records[usize::from(own)] =
                LockRecord::allocate(LockCategory::Scheduler, BROKER_OWNER);
        }
        self.broker.own.store(own, Ordering::Release);
        self.broker.state.bind(own);
        self.enter(InitPhase::Core);
        Ok(())
    }

    /// Phase `Tracking`: promotes pending bootstrap claims into records.
    pub fn init_tracking(&self) -> Result<(), SpinlockError> {
        match self.phase() {
            InitPhase::Uninit => return Err(SpinlockError::PhaseOrder),
            InitPhase::Core => (),
            _ => return Ok(()),
        }
        let pending = self.broker.pending.swap(0, Ordering::AcqRel);
        {
            let mut st = self.broker.state.lock(self.hw);
            for id in (0..SPINLOCK_COUNT).filter(|i| pending & 1 << i != 0) {
                let rec = &mut st.records[id];
                if !rec.allocated {
                    *rec = LockRecord::allocate(LockCategory::User, BOOTSTRAP_OWNER);
                    rec.provisional = true;
                }
            }
        }
        self.enter(InitPhase::Tracking);
        Ok(())
    }

    /// Phase `Full`: logging is available.
    pub fn init_full(&self) -> Result<(), SpinlockError> {
        match self.phase() {
            InitPhase::Uninit | InitPhase::Core => {
                return Err(SpinlockError::PhaseOrder)
            }
            InitPhase::Tracking => (),
            InitPhase::Full => return Ok(()),
        }
        self.enter(InitPhase::Full);
        klog!(
            "spinlock: broker up, {} of {} locks allocated",
            self.total_count(),
            SPINLOCK_COUNT
        );
        Ok(())
    }

    fn enter(&self, phase: InitPhase) {
        self.broker.phase.store(phase as u8, Ordering::Release);
        let subscribers = self.broker.state.lock(self.hw).subscribers.clone();
        for s in &subscribers {
            self.call(s.callback, phase);
        }
    }

    fn call(&self, callback: PhaseCallback<H>, phase: InitPhase) {
        match callback {
            PhaseCallback::Native(f) => f(self, phase),
            PhaseCallback::Foreign(f) => f(phase as u8),
        }
    }

    /// Subscribes `name` to phase changes, replacing any earlier subscription
    /// under the same name. If the broker is already past `Uninit`, the
    /// callback runs immediately with the current phase.
    pub fn register_component(
        &self,
        name: &str,
        callback: PhaseCallback<H>,
    ) -> Result<(), SpinlockError> {
        let name = FixedName::new(name);
        {
            let mut st = self.broker.state.lock(self.hw);
            if let Some(s) = st.subscribers.iter_mut().find(|s| s.name == name) {
                s.callback = callback;
            } else {
                st.subscribers
                    .push(Subscriber { name, callback })
                    .map_err(|_| SpinlockError::TooManyComponents)?;
            }
        }
        let phase = self.phase();
        if phase > InitPhase::Uninit {
            self.call(callback, phase);
        }
        Ok(())
    }

    /// Claims a hardware lock without going through the records. Works in
    /// any phase. Unless `self_tracking`, the lock is promoted into a record
    /// when the broker reaches `Tracking` (or right away, if it's already
    /// there).
    pub fn bootstrap_claim(&self, self_tracking: bool) -> Option<BootstrapLock> {
        let id = claim_first_free(&self.broker.claimed)?;
        if !self_tracking {
            if self.phase() >= InitPhase::Tracking {
                let mut st = self.broker.state.lock(self.hw);
                let rec = &mut st.records[usize::from(id)];
                *rec = LockRecord::allocate(LockCategory::User, BOOTSTRAP_OWNER);
                rec.provisional = true;
            } else {
                self.broker.pending.fetch_or(1 << id, Ordering::AcqRel);
            }
        }
        Some(BootstrapLock { id })
    }

    /// Brings a lock claimed some other way under full tracking.
    pub fn register_external(
        &self,
        id: u8,
        category: LockCategory,
        owner: &str,
    ) -> Result<(), SpinlockError> {
        self.check_id(id)?;
        if category == LockCategory::Unused {
            return Err(SpinlockError::InvalidCategory);
        }
        let mut st = self.broker.state.lock(self.hw);
        let rec = &mut st.records[usize::from(id)];
        if rec.allocated && !rec.provisional {
            return Err(SpinlockError::AlreadyAllocated);
        }
        *rec = LockRecord::allocate(category, owner);
        self.broker.claimed.fetch_or(1 << id, Ordering::AcqRel);
        self.broker.pending.fetch_and(!(1 << id), Ordering::AcqRel);
        Ok(())
    }

    /// Hands out the lowest unclaimed lock.
    pub fn allocate(
        &self,
        category: LockCategory,
        owner: &str,
    ) -> Result<u8, SpinlockError> {
        if category == LockCategory::Unused {
            return Err(SpinlockError::InvalidCategory);
        }
        self.require_records()?;
        let id = claim_first_free(&self.broker.claimed)
            .ok_or(SpinlockError::NoneAvailable)?;
        let mut st = self.broker.state.lock(self.hw);
        st.records[usize::from(id)] = LockRecord::allocate(category, owner);
        Ok(id)
    }

    /// Returns lock `id` to the pool. A held lock has to be released first.
    pub fn free(&self, id: u8) -> Result<(), SpinlockError> {
        self.check_id(id)?;
        let mut st = self.broker.state.lock(self.hw);
        let rec = &mut st.records[usize::from(id)];
        if !rec.allocated {
            return Err(SpinlockError::NotAllocated);
        }
        if rec.held.is_some() {
            return Err(SpinlockError::Held);
        }
        *rec = LockRecord::FREE;
        self.broker.claimed.fetch_and(!(1 << id), Ordering::AcqRel);
        Ok(())
    }

    /// Spins until lock `id` is ours, then records `task` as its holder.
    /// Interrupts stay masked on this core until `release`.
    pub fn acquire(&self, id: u8, task: TaskId) -> Result<Save, SpinlockError> {
        self.check_id(id)?;
        if !self.broker.state.lock(self.hw).records[usize::from(id)].allocated {
            return Err(SpinlockError::NotAllocated);
        }

        let saved = self.hw.disable_interrupts();
        while !self.hw.spinlock_try_lock(id) {
            core::hint::spin_loop();
        }

        let now = Timestamp::from(self.hw.now_us());
        let core = self.hw.core_id();
        let mut st = self.broker.state.lock(self.hw);
        let seq = st.seq;
        st.seq = seq.wrapping_add(1);
        let rec = &mut st.records[usize::from(id)];
        rec.holder = task;
        rec.held = Some(HeldBy {
            since: now,
            core,
            save: saved,
            seq,
        });
        rec.last_acquired = now;
        rec.acquisitions = rec.acquisitions.wrapping_add(1);
        Ok(Save(saved))
    }

    /// Records the hold time, then releases the hardware lock and restores
    /// the interrupt state saved by `acquire`.
    pub fn release(&self, id: u8, save: Save) -> Result<(), SpinlockError> {
        self.check_id(id)?;
        {
            let now = Timestamp::from(self.hw.now_us());
            let mut st = self.broker.state.lock(self.hw);
            let rec = &mut st.records[usize::from(id)];
            if !rec.allocated {
                return Err(SpinlockError::NotAllocated);
            }
            rec.end_hold(now).ok_or(SpinlockError::NotHeld)?;
        }
        self.hw.spinlock_unlock(id);
        self.hw.restore_interrupts(save.0);
        Ok(())
    }

    /// Releases every lock `task` still holds, leaving the allocations alone.
    /// Returns how many there were.
    pub fn release_by_task(&self, task: TaskId) -> u32 {
        if !task.is_some() || self.phase() < InitPhase::Core {
            return 0;
        }
        let now = Timestamp::from(self.hw.now_us());
        let mut reclaimed: heapless::Vec<(u8, HeldBy), SPINLOCK_COUNT> =
            heapless::Vec::new();
        {
            let mut st = self.broker.state.lock(self.hw);
            for (id, rec) in st.records.iter_mut().enumerate() {
                if rec.allocated && rec.holder == task {
                    if let Some(held) = rec.end_hold(now) {
                        // One entry per record, so this can't overflow.
                        reclaimed.push((id as u8, held)).ok();
                        klog!(
                            "spinlock: reclaimed lock {} ({}) from task {}",
                            id,
                            rec.owner,
                            task.0
                        );
                    }
                }
            }
        }

        let core = self.hw.core_id();
        let mut outermost: Option<HeldBy> = None;
        for &(id, held) in &reclaimed {
            self.hw.spinlock_unlock(id);
            if held.core == core && outermost.map_or(true, |o| held.seq < o.seq) {
                outermost = Some(held);
            }
        }
        // Only the first acquisition saw the interrupt state from before the
        // task started taking locks.
        if let Some(held) = outermost {
            self.hw.restore_interrupts(held.save);
        }
        reclaimed.len() as u32
    }

    pub fn get_info(&self, id: u8) -> Result<SpinlockInfo, SpinlockError> {
        if usize::from(id) >= SPINLOCK_COUNT {
            return Err(SpinlockError::InvalidId);
        }
        let st = self.broker.state.lock(self.hw);
        let rec = &st.records[usize::from(id)];
        if !rec.allocated {
            return Err(SpinlockError::NotAllocated);
        }
        let mut info = SpinlockInfo::new(id, true, rec.category);
        info.owner = rec.owner.to_padded();
        info.holder = rec.holder.0;
        info.acquisitions = rec.acquisitions;
        info.total_held_us = rec.total_held_us;
        info.max_held_us = rec.max_held_us;
        info.last_acquired_us = rec.last_acquired.as_us();
        Ok(info)
    }

    pub fn count_by_category(&self, category: LockCategory) -> usize {
        let st = self.broker.state.lock(self.hw);
        st.records
            .iter()
            .filter(|r| r.allocated && r.category == category)
            .count()
    }

    pub fn total_count(&self) -> usize {
        let st = self.broker.state.lock(self.hw);
        st.records.iter().filter(|r| r.allocated).count()
    }

    fn require_records(&self) -> Result<(), SpinlockError> {
        if self.phase() < InitPhase::Core {
            Err(SpinlockError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Validates an id supplied by a client: in range, records live, and not
    /// the broker's own.
    fn check_id(&self, id: u8) -> Result<(), SpinlockError> {
        if usize::from(id) >= SPINLOCK_COUNT {
            return Err(SpinlockError::InvalidId);
        }
        self.require_records()?;
        if Some(id) == self.broker_lock() {
            return Err(SpinlockError::ReservedForBroker);
        }
        Ok(())
    }
}
