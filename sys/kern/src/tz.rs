// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TrustZone attribution.
//!
//! Each task can be attributed to the secure or the non-secure world. When a
//! non-secure task is dispatched, its code and data windows are marked
//! non-secure in the SAU and the core is switched to run it non-secure; a
//! secure task gets the default attribution, where everything but the veneer
//! pool is secure.
//!
//! The manager also owns the registry of secure functions reachable from the
//! non-secure world. Each registered function gets a veneer in a pool that the
//! SAU marks non-secure callable. A veneer is an `SG` followed by a tail call
//! through a literal holding the secure function's address:
//!
//! ```text
//!   +0  e97f e97f   sg
//!   +4  f8df f000   ldr.w pc, [pc, #0]
//!   +8  <target | 1>
//!   +12 <unused>
//! ```
//!
//! SAU layout while a task is loaded:
//!
//! | Region | Covers |
//! |---|---|
//! | 0 | veneer pool, NSC |
//! | 1 | the task's non-secure code window |
//! | 2 | the task's non-secure data window |
//! | 3.. | unused |

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{
    LockCategory, SecurityState, TaskId, TzStatus, MAX_SECURE_FUNCTIONS,
    MAX_TZ_TASKS,
};

use crate::arch::{Hardware, SauRegion};
use crate::err::TzError;
use crate::spinlock::Spinlocks;
use crate::sync::HwSpinLock;
use crate::util::FixedName;

/// Secure functions a single task may be granted.
pub const MAX_TASK_FUNCTIONS: usize = 8;
pub const FUNCTION_NAME_LEN: usize = 16;

const SAU_VENEERS: u8 = 0;
const SAU_CODE: u8 = 1;
const SAU_DATA: u8 = 2;
const SAU_REGIONS_USED: u8 = 3;

const SG: u32 = 0xE97F_E97F;
const LDR_PC_PC: u32 = 0xF000_F8DF;

/// One NSC veneer.
#[derive(Copy, Clone)]
#[repr(C, align(16))]
struct Veneer([u32; 4]);

impl Veneer {
    const EMPTY: Self = Self([0; 4]);

    fn new(target: u32) -> Self {
        Self([SG, LDR_PC_PC, target | 1, 0])
    }
}

/// The veneer pool. Aligned so that it can be one SAU region on its own.
#[repr(C, align(32))]
struct VeneerPool(UnsafeCell<[Veneer; MAX_SECURE_FUNCTIONS]>);

// Writes only happen with the registry lock held; readers are the hardware.
unsafe impl Sync for VeneerPool {}

impl VeneerPool {
    const SIZE: usize = core::mem::size_of::<[Veneer; MAX_SECURE_FUNCTIONS]>();

    fn base(&self) -> usize {
        self.0.get() as usize
    }

    fn addr_of(&self, index: usize) -> usize {
        self.base() + index * core::mem::size_of::<Veneer>()
    }
}

/// A window of memory to be attributed non-secure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NsWindow {
    pub base: u32,
    pub size: u32,
}

impl NsWindow {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// The SAU region covering this window, widened to 32-byte granules.
    fn sau_region(&self) -> Option<SauRegion> {
        if self.size == 0 {
            return None;
        }
        let last = self.base.checked_add(self.size - 1)?;
        Some(SauRegion {
            base: self.base & !0x1F,
            limit: last | 0x1F,
            nsc: false,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TzTaskConfig {
    pub task: TaskId,
    pub state: SecurityState,
    pub code: Option<NsWindow>,
    pub data: Option<NsWindow>,
    functions: heapless::Vec<u8, MAX_TASK_FUNCTIONS>,
}

impl TzTaskConfig {
    pub const fn new(task: TaskId, state: SecurityState) -> Self {
        Self {
            task,
            state,
            code: None,
            data: None,
            functions: heapless::Vec::new(),
        }
    }

    pub fn with_windows(self, code: Option<NsWindow>, data: Option<NsWindow>) -> Self {
        Self { code, data, ..self }
    }

    /// Grants the task the secure function with registry index `index`.
    pub fn allow(&mut self, index: u8) -> Result<(), TzError> {
        if self.functions.contains(&index) {
            return Ok(());
        }
        self.functions
            .push(index)
            .map_err(|_| TzError::TooManyFunctions)
    }

    pub fn functions(&self) -> &[u8] {
        &self.functions
    }
}

/// A registered secure function's veneer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NscVeneer {
    /// Registry index, as used in `TzTaskConfig::allow`.
    pub index: u8,
    /// Address of the veneer's `SG` instruction.
    pub addr: usize,
}

impl NscVeneer {
    /// The address to branch to from Thumb code.
    pub fn entry(&self) -> usize {
        self.addr | 1
    }
}

#[derive(Copy, Clone, Debug)]
struct SecureFunction {
    name: FixedName<FUNCTION_NAME_LEN>,
    target: usize,
}

struct TzState {
    tasks: [Option<TzTaskConfig>; MAX_TZ_TASKS],
    functions: heapless::Vec<SecureFunction, MAX_SECURE_FUNCTIONS>,
}

pub struct TzManager {
    supported: AtomicBool,
    enabled: AtomicBool,
    transitions: AtomicU32,
    state: HwSpinLock<TzState>,
    pool: VeneerPool,
}

impl TzManager {
    pub const fn new() -> Self {
        Self {
            supported: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            transitions: AtomicU32::new(0),
            state: HwSpinLock::new(TzState {
                tasks: [const { None }; MAX_TZ_TASKS],
                functions: heapless::Vec::new(),
            }),
            pool: VeneerPool(UnsafeCell::new([Veneer::EMPTY; MAX_SECURE_FUNCTIONS])),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Clears the tables and installs the default attribution.
    ///
    /// Without a security extension this succeeds but leaves the manager
    /// disabled, and every later operation fails with `Unavailable`.
    pub fn init<H: Hardware>(&self, hw: &H, lock: u8) -> Result<(), TzError> {
        self.state.bind(lock);
        let mut st = self.state.lock(hw);
        st.tasks = [const { None }; MAX_TZ_TASKS];
        st.functions.clear();
        self.transitions.store(0, Ordering::Relaxed);

        let supported = hw.tz_present() && hw.sau_region_count() >= SAU_REGIONS_USED;
        self.supported.store(supported, Ordering::Release);
        if !supported {
            self.enabled.store(false, Ordering::Release);
            klog!("tz: security extension not available");
            return Ok(());
        }
        self.default_attribution(hw);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn check_enabled(&self) -> Result<(), TzError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(TzError::Unavailable)
        }
    }

    pub fn configure_task<H: Hardware>(
        &self,
        hw: &H,
        config: &TzTaskConfig,
    ) -> Result<(), TzError> {
        self.check_enabled()?;
        if !config.task.is_some() {
            return Err(TzError::InvalidArgument);
        }
        if config.state == SecurityState::Transitional {
            return Err(TzError::InvalidState);
        }
        let mut st = self.state.lock(hw);
        if config
            .functions
            .iter()
            .any(|&f| usize::from(f) >= st.functions.len())
        {
            return Err(TzError::UnknownFunction);
        }
        let slot = match st
            .tasks
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.task == config.task))
        {
            Some(i) => i,
            None => st
                .tasks
                .iter()
                .position(Option::is_none)
                .ok_or(TzError::TableFull)?,
        };
        st.tasks[slot] = Some(config.clone());
        Ok(())
    }

    pub fn get_task_config<H: Hardware>(&self, hw: &H, task: TaskId) -> Option<TzTaskConfig> {
        let st = self.state.lock(hw);
        st.tasks.iter().flatten().find(|c| c.task == task).cloned()
    }

    pub fn remove_task<H: Hardware>(&self, hw: &H, task: TaskId) -> bool {
        let mut st = self.state.lock(hw);
        match st
            .tasks
            .iter_mut()
            .find(|c| c.as_ref().is_some_and(|c| c.task == task))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Attributes `task`'s windows and switches the calling core into the
    /// task's security state.
    pub fn apply_task_settings<H: Hardware>(
        &self,
        hw: &H,
        task: TaskId,
    ) -> Result<(), TzError> {
        self.check_enabled()?;
        let st = self.state.lock(hw);
        let config = st
            .tasks
            .iter()
            .flatten()
            .find(|c| c.task == task)
            .ok_or(TzError::NoConfig)?;

        hw.sau_enable(false);
        self.write_veneer_region(hw);
        let (code, data) = match config.state {
            SecurityState::NonSecure => (
                config.code.and_then(|w| w.sau_region()),
                config.data.and_then(|w| w.sau_region()),
            ),
            _ => (None, None),
        };
        hw.sau_write_region(SAU_CODE, code);
        hw.sau_write_region(SAU_DATA, data);
        for rnr in SAU_REGIONS_USED..hw.sau_region_count() {
            hw.sau_write_region(rnr, None);
        }
        hw.sau_enable(true);

        self.switch_state(hw, config.state);
        Ok(())
    }

    /// Restores the default attribution and the secure state. Harmless to
    /// repeat.
    pub fn reset_task_settings<H: Hardware>(&self, hw: &H) -> Result<(), TzError> {
        self.check_enabled()?;
        let _st = self.state.lock(hw);
        self.default_attribution(hw);
        self.switch_state(hw, SecurityState::Secure);
        Ok(())
    }

    /// Installs a veneer for the secure function at `target`. Registering
    /// the same target again returns the existing veneer.
    pub fn register_secure_function<H: Hardware>(
        &self,
        hw: &H,
        name: &str,
        target: usize,
    ) -> Result<NscVeneer, TzError> {
        self.check_enabled()?;
        if name.is_empty() || target == 0 {
            return Err(TzError::InvalidArgument);
        }
        let mut st = self.state.lock(hw);
        if let Some(i) = st.functions.iter().position(|f| f.target == target) {
            return Ok(NscVeneer {
                index: i as u8,
                addr: self.pool.addr_of(i),
            });
        }
        let index = st.functions.len();
        st.functions
            .push(SecureFunction {
                name: FixedName::new(name),
                target,
            })
            .map_err(|_| TzError::TooManyFunctions)?;

        // Safety: we hold the registry lock, which is what serializes writes
        // to the pool, and `index` is in bounds because the push succeeded.
        unsafe {
            let pool = &mut *self.pool.0.get();
            pool[index] = Veneer::new(target as u32);
        }
        klog!("tz: secure function {} at veneer {}", name, index);
        Ok(NscVeneer {
            index: index as u8,
            addr: self.pool.addr_of(index),
        })
    }

    /// Looks up a registered function's name by registry index.
    pub fn function_name<H: Hardware>(
        &self,
        hw: &H,
        index: u8,
    ) -> Option<FixedName<FUNCTION_NAME_LEN>> {
        let st = self.state.lock(hw);
        st.functions.get(usize::from(index)).map(|f| f.name)
    }

    pub fn get_security_state<H: Hardware>(&self, hw: &H) -> SecurityState {
        hw.security_state(hw.core_id())
    }

    pub fn get_status<H: Hardware>(&self, hw: &H) -> TzStatus {
        let st = self.state.lock(hw);
        let mut status = TzStatus {
            secure_functions: st.functions.len() as u32,
            transitions: self.transitions.load(Ordering::Relaxed),
            sau_regions: hw.sau_region_count(),
            supported: self.is_supported() as u8,
            enabled: self.is_enabled() as u8,
            current_state: hw.security_state(hw.core_id()) as u8,
            ..TzStatus::default()
        };
        for config in st.tasks.iter().flatten() {
            match config.state {
                SecurityState::Secure => status.secure_tasks += 1,
                SecurityState::NonSecure => status.nonsecure_tasks += 1,
                SecurityState::Transitional => status.transitional_tasks += 1,
            }
        }
        status
    }

    fn write_veneer_region<H: Hardware>(&self, hw: &H) {
        let base = self.pool.base() as u32;
        hw.sau_write_region(
            SAU_VENEERS,
            Some(SauRegion {
                base,
                limit: base.wrapping_add(VeneerPool::SIZE as u32 - 1),
                nsc: true,
            }),
        );
    }

    /// Everything secure except the veneer pool.
    fn default_attribution<H: Hardware>(&self, hw: &H) {
        hw.sau_enable(false);
        self.write_veneer_region(hw);
        for rnr in SAU_CODE..hw.sau_region_count() {
            hw.sau_write_region(rnr, None);
        }
        hw.sau_enable(true);
    }

    fn switch_state<H: Hardware>(&self, hw: &H, state: SecurityState) {
        let core = hw.core_id();
        if hw.security_state(core) != state {
            hw.set_security_state(core, state);
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for TzManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The TrustZone manager's operations, bound to a kernel's hardware and
/// broker.
pub struct Tz<'a, H: Hardware> {
    mgr: &'a TzManager,
    hw: &'a H,
    locks: Spinlocks<'a, H>,
}

impl<'a, H: Hardware> Tz<'a, H> {
    pub fn new(mgr: &'a TzManager, hw: &'a H, locks: Spinlocks<'a, H>) -> Self {
        Self { mgr, hw, locks }
    }

    pub fn init(&self) -> Result<(), TzError> {
        let lock = match self.mgr.state.bound_id() {
            Some(id) => id,
            None => self
                .locks
                .allocate(LockCategory::Scheduler, "tz-manager")
                .map_err(|e| {
                    klog!("tz: no spinlock: {}", e);
                    TzError::Unavailable
                })?,
        };
        self.mgr.init(self.hw, lock)
    }

    pub fn is_supported(&self) -> bool {
        self.mgr.is_supported()
    }

    pub fn is_enabled(&self) -> bool {
        self.mgr.is_enabled()
    }

    pub fn configure_task(&self, config: &TzTaskConfig) -> Result<(), TzError> {
        self.mgr.configure_task(self.hw, config)
    }

    pub fn apply_task_settings(&self, task: TaskId) -> Result<(), TzError> {
        self.mgr.apply_task_settings(self.hw, task)
    }

    pub fn reset_task_settings(&self) -> Result<(), TzError> {
        self.mgr.reset_task_settings(self.hw)
    }

    pub fn register_secure_function(
        &self,
        name: &str,
        target: usize,
    ) -> Result<NscVeneer, TzError> {
        self.mgr.register_secure_function(self.hw, name, target)
    }

    pub fn function_name(&self, index: u8) -> Option<FixedName<FUNCTION_NAME_LEN>> {
        self.mgr.function_name(self.hw, index)
    }

    pub fn get_task_config(&self, task: TaskId) -> Option<TzTaskConfig> {
        self.mgr.get_task_config(self.hw, task)
    }

    pub fn remove_task(&self, task: TaskId) -> bool {
        self.mgr.remove_task(self.hw, task)
    }

    pub fn get_security_state(&self) -> SecurityState {
        self.mgr.get_security_state(self.hw)
    }

    pub fn get_status(&self) -> TzStatus {
        self.mgr.get_status(self.hw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeHardware;
    use abi::CoreId;

    const T: TaskId = TaskId(4);

    fn ready() -> (FakeHardware, TzManager) {
        let hw = FakeHardware::new();
        let tz = TzManager::new();
        tz.init(&hw, 9).unwrap();
        (hw, tz)
    }

    fn ns_config() -> TzTaskConfig {
        TzTaskConfig::new(T, SecurityState::NonSecure).with_windows(
            Some(NsWindow::new(0x1010_0000, 0x1000)),
            Some(NsWindow::new(0x2003_0010, 0x100)),
        )
    }

    #[test]
    fn init_installs_veneer_region() {
        let (hw, tz) = ready();
        assert!(tz.is_enabled());
        assert!(hw.sau_enabled());
        let r = hw.sau_region(0).unwrap();
        assert!(r.nsc);
        assert_eq!(r.limit - r.base + 1, VeneerPool::SIZE as u32);
        assert!(hw.sau_region(1).is_none());
    }

    #[test]
    fn nonsecure_task_gets_windows_and_state() {
        let (hw, tz) = ready();
        tz.configure_task(&hw, &ns_config()).unwrap();
        tz.apply_task_settings(&hw, T).unwrap();

        let code = hw.sau_region(1).unwrap();
        assert_eq!((code.base, code.limit), (0x1010_0000, 0x1010_0FFF));
        assert!(!code.nsc);
        // Widened to 32-byte granules.
        let data = hw.sau_region(2).unwrap();
        assert_eq!((data.base, data.limit), (0x2003_0000, 0x2003_011F));

        assert_eq!(tz.get_security_state(&hw), SecurityState::NonSecure);
        assert_eq!(tz.get_status(&hw).transitions, 1);

        // Already non-secure, so no second transition.
        tz.apply_task_settings(&hw, T).unwrap();
        assert_eq!(tz.get_status(&hw).transitions, 1);
    }

    #[test]
    fn secure_task_leaves_windows_secure() {
        let (hw, tz) = ready();
        let config = ns_config();
        let config = TzTaskConfig {
            state: SecurityState::Secure,
            ..config
        };
        tz.configure_task(&hw, &config).unwrap();
        tz.apply_task_settings(&hw, T).unwrap();
        assert!(hw.sau_region(1).is_none());
        assert_eq!(tz.get_security_state(&hw), SecurityState::Secure);
        assert_eq!(tz.get_status(&hw).transitions, 0);
    }

    #[test]
    fn reset_restores_default() {
        let (hw, tz) = ready();
        tz.configure_task(&hw, &ns_config()).unwrap();
        tz.apply_task_settings(&hw, T).unwrap();
        tz.reset_task_settings(&hw).unwrap();
        tz.reset_task_settings(&hw).unwrap();
        assert!(hw.sau_region(1).is_none());
        assert!(hw.sau_region(2).is_none());
        assert!(hw.sau_region(0).is_some());
        assert_eq!(tz.get_security_state(&hw), SecurityState::Secure);
        assert_eq!(tz.get_status(&hw).transitions, 2);
    }

    #[test]
    fn state_is_per_core() {
        let (hw, tz) = ready();
        tz.configure_task(&hw, &ns_config()).unwrap();
        hw.set_core(CoreId::Core1);
        tz.apply_task_settings(&hw, T).unwrap();
        assert_eq!(hw.security_state(CoreId::Core1), SecurityState::NonSecure);
        assert_eq!(hw.security_state(CoreId::Core0), SecurityState::Secure);
    }

    #[test]
    fn transitional_is_not_a_task_state() {
        let (hw, tz) = ready();
        let config = TzTaskConfig::new(T, SecurityState::Transitional);
        assert_eq!(tz.configure_task(&hw, &config), Err(TzError::InvalidState));
    }

    #[test]
    fn apply_without_config_fails() {
        let (hw, tz) = ready();
        assert_eq!(tz.apply_task_settings(&hw, T), Err(TzError::NoConfig));
    }

    extern "C" fn secure_a() {}
    extern "C" fn secure_b() {}

    #[test]
    fn veneers_are_distinct_and_aligned() {
        let (hw, tz) = ready();
        let a = tz
            .register_secure_function(&hw, "a", secure_a as usize)
            .unwrap();
        let b = tz
            .register_secure_function(&hw, "b", secure_b as usize)
            .unwrap();
        assert_ne!(a.addr, b.addr);
        assert_eq!(a.addr % 2, 0);
        assert_eq!(b.addr % 16, 0);
        assert_eq!(b.entry(), b.addr | 1);

        // Same target again is the same veneer.
        let again = tz
            .register_secure_function(&hw, "a-again", secure_a as usize)
            .unwrap();
        assert_eq!(again, a);
        assert_eq!(tz.get_status(&hw).secure_functions, 2);
        assert_eq!(tz.function_name(&hw, 1).unwrap().as_str(), "b");

        // Veneer contents.
        let words = unsafe { (*tz.pool.0.get())[usize::from(a.index)].0 };
        assert_eq!(words[0], SG);
        assert_eq!(words[1], LDR_PC_PC);
        assert_eq!(words[2], secure_a as usize as u32 | 1);
    }

    #[test]
    fn registration_rejects_bad_input() {
        let (hw, tz) = ready();
        assert_eq!(
            tz.register_secure_function(&hw, "", secure_a as usize),
            Err(TzError::InvalidArgument)
        );
        assert_eq!(
            tz.register_secure_function(&hw, "zero", 0),
            Err(TzError::InvalidArgument)
        );
    }

    #[test]
    fn registry_fills_up() {
        let (hw, tz) = ready();
        for i in 1..=MAX_SECURE_FUNCTIONS {
            tz.register_secure_function(&hw, "f", i * 0x100).unwrap();
        }
        assert_eq!(
            tz.register_secure_function(&hw, "f", 0xFFFF_0000),
            Err(TzError::TooManyFunctions)
        );
    }

    #[test]
    fn grants_must_name_registered_functions() {
        let (hw, tz) = ready();
        let mut config = ns_config();
        config.allow(0).unwrap();
        assert_eq!(
            tz.configure_task(&hw, &config),
            Err(TzError::UnknownFunction)
        );
        tz.register_secure_function(&hw, "a", secure_a as usize)
            .unwrap();
        tz.configure_task(&hw, &config).unwrap();
        assert_eq!(tz.get_task_config(&hw, T).unwrap().functions(), &[0]);
    }

    #[test]
    fn status_counts_tasks_by_state() {
        let (hw, tz) = ready();
        tz.configure_task(&hw, &ns_config()).unwrap();
        tz.configure_task(&hw, &TzTaskConfig::new(TaskId(5), SecurityState::Secure))
            .unwrap();
        tz.configure_task(&hw, &TzTaskConfig::new(TaskId(6), SecurityState::Secure))
            .unwrap();
        let status = tz.get_status(&hw);
        assert_eq!(status.secure_tasks, 2);
        assert_eq!(status.nonsecure_tasks, 1);
        assert_eq!(status.sau_regions, 8);
        assert_eq!(status.enabled, 1);

        assert!(tz.remove_task(&hw, TaskId(5)));
        assert_eq!(tz.get_status(&hw).secure_tasks, 1);
    }

    #[test]
    fn absent_extension_is_unavailable_but_init_succeeds() {
        let hw = FakeHardware::new();
        hw.set_tz_present(false);
        let tz = TzManager::new();
        assert_eq!(tz.init(&hw, 9), Ok(()));
        assert!(!tz.is_supported());
        assert_eq!(
            tz.configure_task(&hw, &ns_config()),
            Err(TzError::Unavailable)
        );
        assert_eq!(tz.apply_task_settings(&hw, T), Err(TzError::Unavailable));
        assert_eq!(
            tz.register_secure_function(&hw, "a", 0x100),
            Err(TzError::Unavailable)
        );
        assert_eq!(tz.get_status(&hw).supported, 0);
    }
}
