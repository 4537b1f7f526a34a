// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task memory protection.
//!
//! The MPU manager stores up to `MAX_MPU_TASKS` task configurations of up to
//! eight regions each (one per hardware region slot) and loads a task's
//! regions into the MPU just before the scheduler dispatches it.
//!
//! The MPU is always run with the privileged default memory map as background
//! (PRIVDEFENA), so the kernel itself keeps working whatever is loaded, and
//! resetting a task's settings is just a matter of clearing the region slots.
//!
//! Regions are normalized when a configuration is stored: sizes become powers
//! of two of at least 32 bytes and bases are aligned to the size (see
//! [`align_region`]). `get_task_config` returns the normalized form.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{
    Access, LockCategory, RawRegion, SecurityAttr, TaskId, MAX_MPU_TASKS,
    MPU_REGIONS_PER_TASK,
};
use num_traits::FromPrimitive;

use crate::arch::Hardware;
use crate::err::MpuError;
use crate::spinlock::Spinlocks;
use crate::sync::HwSpinLock;

/// Smallest region the ARMv8-M MPU can describe.
pub const MIN_REGION_SIZE: u32 = 32;

pub const PERIPHERAL_BASE: u32 = 0x4000_0000;
pub const PERIPHERAL_SIZE: u32 = 0x2000_0000;
pub const SHARED_SRAM_BASE: u32 = 0x2008_0000;
pub const SHARED_SRAM_SIZE: u32 = 0x2000;

bitflags::bitflags! {
    /// Memory-type flags of a region. The bit values are the ones used in
    /// `abi::RawRegion::flags`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegionFlags: u8 {
        const CACHEABLE = 1 << 0;
        const BUFFERABLE = 1 << 1;
        const SHAREABLE = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
    pub access: Access,
    pub security: SecurityAttr,
    pub flags: RegionFlags,
}

impl Region {
    /// A secure region with no memory-type flags.
    pub const fn new(base: u32, size: u32, access: Access) -> Self {
        Self {
            base,
            size,
            access,
            security: SecurityAttr::Secure,
            flags: RegionFlags::empty(),
        }
    }

    pub const fn with_flags(self, flags: RegionFlags) -> Self {
        Self { flags, ..self }
    }

    pub const fn with_security(self, security: SecurityAttr) -> Self {
        Self { security, ..self }
    }

    fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    fn overlaps(&self, other: &Self) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }

    pub fn to_raw(&self) -> RawRegion {
        RawRegion::new(
            self.base,
            self.size,
            self.access,
            self.security,
            self.flags.bits(),
        )
    }
}

impl TryFrom<&RawRegion> for Region {
    type Error = MpuError;

    fn try_from(raw: &RawRegion) -> Result<Self, MpuError> {
        let access = Access::from_u8(raw.access).ok_or(MpuError::InvalidArgument)?;
        let security =
            SecurityAttr::from_u8(raw.security).ok_or(MpuError::InvalidArgument)?;
        let flags =
            RegionFlags::from_bits(raw.flags).ok_or(MpuError::InvalidArgument)?;
        Ok(Region {
            base: raw.base,
            size: raw.size,
            access,
            security,
            flags,
        })
    }
}

/// The regions of one task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskMpuConfig {
    pub task: TaskId,
    regions: heapless::Vec<Region, MPU_REGIONS_PER_TASK>,
}

impl TaskMpuConfig {
    pub const fn new(task: TaskId) -> Self {
        Self {
            task,
            regions: heapless::Vec::new(),
        }
    }

    pub fn push(&mut self, region: Region) -> Result<(), MpuError> {
        self.regions.push(region).map_err(|_| MpuError::TooManyRegions)
    }

    pub fn from_regions(task: TaskId, regions: &[Region]) -> Result<Self, MpuError> {
        let mut config = Self::new(task);
        for &r in regions {
            config.push(r)?;
        }
        Ok(config)
    }

    pub fn from_raw(task: TaskId, raw: &[RawRegion]) -> Result<Self, MpuError> {
        let mut config = Self::new(task);
        for r in raw {
            config.push(Region::try_from(r)?)?;
        }
        Ok(config)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

/// Expands `(base, size)` into a region the MPU can describe.
///
/// The size is rounded up to a power of two no smaller than
/// [`MIN_REGION_SIZE`] and the base is masked down to a multiple of it. If
/// that moved the base, the size is doubled once and the base masked again,
/// so that the region is more likely to still cover the top of the request.
pub fn align_region(base: u32, size: u32) -> Result<(u32, u32), MpuError> {
    let mut p = size
        .max(MIN_REGION_SIZE)
        .checked_next_power_of_two()
        .ok_or(MpuError::RegionTooLarge)?;
    let mut aligned = base & !(p - 1);
    if aligned != base {
        p = p.checked_mul(2).ok_or(MpuError::RegionTooLarge)?;
        aligned = base & !(p - 1);
    }
    Ok((aligned, p))
}

/// Register contents for one region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionEncoding {
    pub rbar: u32,
    pub rlar: u32,
    /// This region's byte of the MAIR registers.
    pub mair: u8,
}

/// Computes the RBAR/RLAR/MAIR contents for an aligned region loaded into
/// slot `attridx`.
pub fn encode_region(region: &Region, attridx: u32) -> RegionEncoding {
    uassert!(region.size >= MIN_REGION_SIZE);
    uassert!(region.base & (region.size - 1) == 0);

    let xn = !matches!(
        region.access,
        Access::ReadExecute | Access::ReadWriteExecute
    );
    // ARMv8m has less granularity than ARMv7m for privilege vs
    // non-privilege, so "no access" becomes "privileged access only".
    let ap: u32 = match region.access {
        Access::ReadWrite | Access::ReadWriteExecute => 0b01,
        Access::Read | Access::ReadExecute => 0b11,
        Access::NoAccess => 0b00,
    };
    let sh: u32 = if region.flags.contains(RegionFlags::SHAREABLE) {
        0b10 // outer shareable
    } else {
        0b00
    };
    let mair = match (
        region.flags.contains(RegionFlags::CACHEABLE),
        region.flags.contains(RegionFlags::BUFFERABLE),
    ) {
        // Device-nGnRnE: peripherals.
        (false, false) => 0b0000_0000,
        // Device-nGnRE: writes may be posted.
        (false, true) => 0b0000_0100,
        // Normal, write-through, read/write-allocate.
        (true, false) => 0b1010_1010,
        // Normal, write-back, read/write-allocate.
        (true, true) => 0b1111_1111,
    };

    let limit = (u64::from(region.base) + u64::from(region.size) - 32) as u32;
    let rlar = (limit & !0x1F) | attridx << 1 | 1; // limit | AttrIndx | enable
    let rbar = region.base | sh << 3 | ap << 1 | xn as u32;
    RegionEncoding { rbar, rlar, mair }
}

/// The four-region configuration every protected task starts from: its
/// stack, its code, the peripheral space and the shared SRAM banks.
pub fn create_default_config(
    task: TaskId,
    stack_base: u32,
    stack_size: u32,
    code_base: u32,
    code_size: u32,
) -> Result<TaskMpuConfig, MpuError> {
    if !task.is_some() || stack_size == 0 || code_size == 0 {
        return Err(MpuError::InvalidArgument);
    }
    TaskMpuConfig::from_regions(
        task,
        &[
            Region::new(stack_base, stack_size, Access::ReadWrite)
                .with_flags(RegionFlags::CACHEABLE | RegionFlags::BUFFERABLE),
            Region::new(code_base, code_size, Access::ReadExecute)
                .with_flags(RegionFlags::CACHEABLE | RegionFlags::SHAREABLE),
            Region::new(PERIPHERAL_BASE, PERIPHERAL_SIZE, Access::ReadWrite)
                .with_flags(RegionFlags::SHAREABLE),
            Region::new(SHARED_SRAM_BASE, SHARED_SRAM_SIZE, Access::ReadWrite)
                .with_flags(RegionFlags::all()),
        ],
    )
}

struct Window {
    base: u32,
    end: u64,
    writable: bool,
}

const MEMORY_MAP: [Window; 4] = [
    // XIP flash
    Window {
        base: 0x1000_0000,
        end: 0x1200_0000,
        writable: false,
    },
    // Main SRAM and the two scratch banks
    Window {
        base: 0x2000_0000,
        end: 0x2008_2000,
        writable: true,
    },
    // APB, AHB and USB peripherals
    Window {
        base: PERIPHERAL_BASE,
        end: 0x6000_0000,
        writable: true,
    },
    // SIO
    Window {
        base: 0xD000_0000,
        end: 0xD002_0000,
        writable: true,
    },
];

/// Checks whether `[address, address + size)` lies inside one of the
/// well-known memory windows and, if `write_required`, a writable one.
pub fn is_accessible(address: u32, size: u32, write_required: bool) -> bool {
    let start = u64::from(address);
    let end = start + u64::from(size);
    MEMORY_MAP.iter().any(|w| {
        u64::from(w.base) <= start
            && end <= w.end
            && start < w.end
            && (w.writable || !write_required)
    })
}

pub struct MpuManager {
    ready: AtomicBool,
    table: HwSpinLock<[Option<TaskMpuConfig>; MAX_MPU_TASKS]>,
}

impl MpuManager {
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            table: HwSpinLock::new([const { None }; MAX_MPU_TASKS]),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Clears the table and turns the MPU on with no regions loaded. `lock`
    /// serializes table updates and region programming across cores.
    pub fn init<H: Hardware>(&self, hw: &H, lock: u8) -> Result<(), MpuError> {
        self.table.bind(lock);
        let mut table = self.table.lock(hw);
        *table = [const { None }; MAX_MPU_TASKS];
        if !hw.mpu_present() {
            self.ready.store(false, Ordering::Release);
            return Err(MpuError::Unavailable);
        }
        hw.mpu_disable();
        clear_regions(hw);
        hw.mpu_enable(true);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Normalizes and stores `config`, replacing any earlier configuration of
    /// the same task.
    pub fn configure_task<H: Hardware>(
        &self,
        hw: &H,
        config: &TaskMpuConfig,
    ) -> Result<(), MpuError> {
        if !self.is_ready() {
            return Err(MpuError::Unavailable);
        }
        if !config.task.is_some() {
            return Err(MpuError::InvalidArgument);
        }
        if config.regions.is_empty() {
            return Err(MpuError::NoRegions);
        }

        let mut aligned = TaskMpuConfig::new(config.task);
        for r in &config.regions {
            let (base, size) = align_region(r.base, r.size)?;
            let r = Region { base, size, ..*r };
            if aligned.regions.iter().any(|other| other.overlaps(&r)) {
                return Err(MpuError::Overlap);
            }
            aligned.push(r)?;
        }

        let mut table = self.table.lock(hw);
        let slot = match table
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.task == config.task))
        {
            Some(i) => i,
            None => table
                .iter()
                .position(Option::is_none)
                .ok_or(MpuError::TableFull)?,
        };
        table[slot] = Some(aligned);
        Ok(())
    }

    pub fn get_task_config<H: Hardware>(
        &self,
        hw: &H,
        task: TaskId,
    ) -> Option<TaskMpuConfig> {
        let table = self.table.lock(hw);
        table.iter().flatten().find(|c| c.task == task).cloned()
    }

    /// Forgets `task`'s configuration. Returns whether there was one.
    pub fn remove_task<H: Hardware>(&self, hw: &H, task: TaskId) -> bool {
        let mut table = self.table.lock(hw);
        match table
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

    /// Loads `task`'s regions into the MPU of the calling core.
    pub fn apply_task_settings<H: Hardware>(
        &self,
        hw: &H,
        task: TaskId,
    ) -> Result<(), MpuError> {
        if !self.is_ready() {
            return Err(MpuError::Unavailable);
        }
        let table = self.table.lock(hw);
        let config = table
            .iter()
            .flatten()
            .find(|c| c.task == task)
            .ok_or(MpuError::NoConfig)?;

        // Disable the MPU before making changes. Because regions consist of
        // several registers, there is no order in which we can update them
        // with the MPU enabled that doesn't risk a race.
        hw.mpu_disable();
        clear_regions(hw);

        // Each region uses the MAIR attribute with its own index, so MAIR can
        // be treated as an array parallel to the regions.
        let mut mairs = [[0u8; 8]; 2];
        for (i, region) in config.regions.iter().enumerate() {
            let enc = encode_region(region, i as u32);
            let ns = region.security == SecurityAttr::NonSecure;
            mairs[ns as usize][i] = enc.mair;
            hw.mpu_write_region(i as u32, enc.rbar, enc.rlar, ns);
        }
        hw.mpu_set_mair(mairs[0], false);
        hw.mpu_set_mair(mairs[1], true);
        hw.mpu_enable(true);
        Ok(())
    }

    /// Clears every region slot, leaving the privileged default map in
    /// charge. Repeating this is harmless.
    pub fn reset_task_settings<H: Hardware>(&self, hw: &H) -> Result<(), MpuError> {
        if !self.is_ready() {
            return Err(MpuError::Unavailable);
        }
        let _table = self.table.lock(hw);
        hw.mpu_disable();
        clear_regions(hw);
        hw.mpu_enable(true);
        Ok(())
    }
}

impl Default for MpuManager {
    fn default() -> Self {
        Self::new()
    }
}

fn clear_regions<H: Hardware>(hw: &H) {
    for rnr in 0..MPU_REGIONS_PER_TASK as u32 {
        hw.mpu_write_region(rnr, 0, 0, false);
        hw.mpu_write_region(rnr, 0, 0, true);
    }
}

/// The MPU manager's operations, bound to a kernel's hardware and broker.
pub struct Mpu<'a, H: Hardware> {
    mgr: &'a MpuManager,
    hw: &'a H,
    locks: Spinlocks<'a, H>,
}

impl<'a, H: Hardware> Mpu<'a, H> {
    pub fn new(mgr: &'a MpuManager, hw: &'a H, locks: Spinlocks<'a, H>) -> Self {
        Self { mgr, hw, locks }
    }

    /// Initializes the manager, allocating its spinlock on first use.
    pub fn init(&self) -> Result<(), MpuError> {
        let lock = match self.mgr.table.bound_id() {
            Some(id) => id,
            None => self
                .locks
                .allocate(LockCategory::Scheduler, "mpu-manager")
                .map_err(|e| {
                    klog!("mpu: no spinlock: {}", e);
                    MpuError::Unavailable
                })?,
        };
        self.mgr.init(self.hw, lock)
    }

    pub fn is_ready(&self) -> bool {
        self.mgr.is_ready()
    }

    pub fn configure_task(&self, config: &TaskMpuConfig) -> Result<(), MpuError> {
        self.mgr.configure_task(self.hw, config)
    }

    pub fn apply_task_settings(&self, task: TaskId) -> Result<(), MpuError> {
        self.mgr.apply_task_settings(self.hw, task)
    }

    pub fn reset_task_settings(&self) -> Result<(), MpuError> {
        self.mgr.reset_task_settings(self.hw)
    }

    pub fn get_task_config(&self, task: TaskId) -> Option<TaskMpuConfig> {
        self.mgr.get_task_config(self.hw, task)
    }

    pub fn remove_task(&self, task: TaskId) -> bool {
        self.mgr.remove_task(self.hw, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeHardware;

    const T: TaskId = TaskId(1);

    fn ready() -> (FakeHardware, MpuManager) {
        let hw = FakeHardware::new();
        let mgr = MpuManager::new();
        mgr.init(&hw, 5).unwrap();
        (hw, mgr)
    }

    #[test]
    fn tiny_region_becomes_32_bytes() {
        assert_eq!(align_region(0x2000_0000, 31), Ok((0x2000_0000, 32)));
        assert_eq!(align_region(0x2000_0000, 0), Ok((0x2000_0000, 32)));
    }

    #[test]
    fn unaligned_base_doubles_once() {
        // 0x100 bytes at 0x180: masking to 0x100 moves the base, so the size
        // doubles and the base is masked again.
        let (base, size) = align_region(0x2000_0180, 0x100).unwrap();
        assert_eq!(size, 0x200);
        assert_eq!(base, 0x2000_0000);
        assert_eq!(base % size, 0);
    }

    #[test]
    fn huge_regions_are_rejected() {
        assert_eq!(
            align_region(0, 0x8000_0001),
            Err(MpuError::RegionTooLarge)
        );
        assert_eq!(
            align_region(0x4000_0000, 0x8000_0000),
            Err(MpuError::RegionTooLarge)
        );
    }

    #[test]
    fn encoding_matches_armv8m_layout() {
        let r = Region::new(0x2000_1000, 0x40, Access::ReadWrite)
            .with_flags(RegionFlags::CACHEABLE | RegionFlags::BUFFERABLE);
        let enc = encode_region(&r, 3);
        // XN set, AP=01, SH=00
        assert_eq!(enc.rbar, 0x2000_1000 | 0b01 << 1 | 1);
        assert_eq!(enc.rlar, 0x2000_1020 | 3 << 1 | 1);
        assert_eq!(enc.mair, 0xFF);

        let code = Region::new(0x1000_0000, 0x1000, Access::ReadExecute)
            .with_flags(RegionFlags::SHAREABLE | RegionFlags::CACHEABLE);
        let enc = encode_region(&code, 0);
        assert_eq!(enc.rbar, 0x1000_0000 | 0b10 << 3 | 0b11 << 1);
        assert_eq!(enc.mair, 0xAA);

        let dev = Region::new(PERIPHERAL_BASE, PERIPHERAL_SIZE, Access::ReadWrite);
        assert_eq!(encode_region(&dev, 0).mair, 0x00);
        assert_eq!(encode_region(&dev, 0).rlar & !0x1F, 0x5FFF_FFE0);
    }

    #[test]
    fn round_trip_keeps_aligned_region() {
        let (hw, mgr) = ready();
        let config = TaskMpuConfig::from_regions(
            T,
            &[Region::new(0x2000_1000, 64, Access::ReadWrite)],
        )
        .unwrap();
        mgr.configure_task(&hw, &config).unwrap();
        let back = mgr.get_task_config(&hw, T).unwrap();
        assert_eq!(back.regions().len(), 1);
        assert_eq!(back.regions()[0].base, 0x2000_1000);
        assert_eq!(back.regions()[0].size, 64);
        assert_eq!(back.regions()[0].access, Access::ReadWrite);
    }

    #[test]
    fn stored_config_is_normalized() {
        let (hw, mgr) = ready();
        let config = TaskMpuConfig::from_regions(
            T,
            &[Region::new(0x2000_0010, 20, Access::Read)],
        )
        .unwrap();
        mgr.configure_task(&hw, &config).unwrap();
        let r = mgr.get_task_config(&hw, T).unwrap().regions()[0];
        assert_eq!((r.base, r.size), (0x2000_0000, 64));
    }

    #[test]
    fn overlap_after_alignment_is_rejected() {
        let (hw, mgr) = ready();
        // Disjoint as requested, but the second one grows over the first.
        let config = TaskMpuConfig::from_regions(
            T,
            &[
                Region::new(0x2000_0000, 0x100, Access::ReadWrite),
                Region::new(0x2000_0180, 0x80, Access::ReadWrite),
            ],
        )
        .unwrap();
        assert_eq!(mgr.configure_task(&hw, &config), Err(MpuError::Overlap));
        assert!(mgr.get_task_config(&hw, T).is_none());
    }

    #[test]
    fn empty_and_oversized_configs_are_rejected() {
        let (hw, mgr) = ready();
        assert_eq!(
            mgr.configure_task(&hw, &TaskMpuConfig::new(T)),
            Err(MpuError::NoRegions)
        );
        let mut config = TaskMpuConfig::new(T);
        for i in 0..MPU_REGIONS_PER_TASK as u32 {
            config
                .push(Region::new(0x2000_0000 + i * 0x100, 0x100, Access::Read))
                .unwrap();
        }
        assert_eq!(
            config.push(Region::new(0x2001_0000, 0x100, Access::Read)),
            Err(MpuError::TooManyRegions)
        );
    }

    #[test]
    fn table_fills_up() {
        let (hw, mgr) = ready();
        for id in 1..=MAX_MPU_TASKS as u32 {
            let c = create_default_config(TaskId(id), 0x2004_0000, 0x1000, 0x1000_0000, 0x1000)
                .unwrap();
            mgr.configure_task(&hw, &c).unwrap();
        }
        let c = create_default_config(TaskId(99), 0x2004_0000, 0x1000, 0x1000_0000, 0x1000)
            .unwrap();
        assert_eq!(mgr.configure_task(&hw, &c), Err(MpuError::TableFull));
        // Reconfiguring an existing task still works.
        let c = create_default_config(TaskId(3), 0x2004_0000, 0x1000, 0x1000_0000, 0x1000)
            .unwrap();
        mgr.configure_task(&hw, &c).unwrap();
        assert!(mgr.remove_task(&hw, TaskId(3)));
        assert!(!mgr.remove_task(&hw, TaskId(3)));
    }

    #[test]
    fn apply_programs_each_region_in_order() {
        let (hw, mgr) = ready();
        let c = create_default_config(T, 0x2004_0000, 0x1000, 0x1000_0000, 0x4000)
            .unwrap();
        mgr.configure_task(&hw, &c).unwrap();
        mgr.apply_task_settings(&hw, T).unwrap();

        assert_eq!(hw.mpu_enabled(), Some(true));
        let (rbar0, rlar0) = hw.mpu_region(0, false);
        assert_eq!(rbar0 & !0x1F, 0x2004_0000);
        assert_eq!(rlar0, 0x2004_0FE0 | 1);
        let (_, rlar3) = hw.mpu_region(3, false);
        assert_eq!(rlar3, (0x2008_1FE0) | 3 << 1 | 1);
        // Slots past the configuration stay disabled.
        assert_eq!(hw.mpu_region(4, false), (0, 0));
        assert_eq!(hw.mpu_mair(false), [0xFF, 0xAA, 0x00, 0xFF, 0, 0, 0, 0]);
    }

    #[test]
    fn nonsecure_regions_go_to_the_nonsecure_bank() {
        let (hw, mgr) = ready();
        let c = TaskMpuConfig::from_regions(
            T,
            &[
                Region::new(0x2000_0000, 0x400, Access::ReadWrite),
                Region::new(0x2001_0000, 0x400, Access::ReadWrite)
                    .with_security(SecurityAttr::NonSecure),
            ],
        )
        .unwrap();
        mgr.configure_task(&hw, &c).unwrap();
        mgr.apply_task_settings(&hw, T).unwrap();
        assert_ne!(hw.mpu_region(0, false).1, 0);
        assert_eq!(hw.mpu_region(1, false).1, 0);
        assert_ne!(hw.mpu_region(1, true).1, 0);
    }

    #[test]
    fn apply_without_config_fails() {
        let (hw, mgr) = ready();
        assert_eq!(mgr.apply_task_settings(&hw, T), Err(MpuError::NoConfig));
    }

    #[test]
    fn reset_is_idempotent() {
        let (hw, mgr) = ready();
        let c = create_default_config(T, 0x2004_0000, 0x1000, 0x1000_0000, 0x1000)
            .unwrap();
        mgr.configure_task(&hw, &c).unwrap();
        mgr.apply_task_settings(&hw, T).unwrap();
        mgr.reset_task_settings(&hw).unwrap();
        let once: Vec<_> = (0..8).map(|i| hw.mpu_region(i, false)).collect();
        mgr.reset_task_settings(&hw).unwrap();
        let twice: Vec<_> = (0..8).map(|i| hw.mpu_region(i, false)).collect();
        assert_eq!(once, twice);
        assert!(once.iter().all(|&(_, rlar)| rlar == 0));
        assert_eq!(hw.mpu_enabled(), Some(true));
    }

    #[test]
    fn missing_mpu_is_unavailable() {
        let hw = FakeHardware::new();
        hw.set_mpu_present(false);
        let mgr = MpuManager::new();
        assert_eq!(mgr.init(&hw, 5), Err(MpuError::Unavailable));
        let c = create_default_config(T, 0x2004_0000, 0x1000, 0x1000_0000, 0x1000)
            .unwrap();
        assert_eq!(mgr.configure_task(&hw, &c), Err(MpuError::Unavailable));
        assert_eq!(mgr.reset_task_settings(&hw), Err(MpuError::Unavailable));
    }

    #[test]
    fn memory_map_windows() {
        assert!(is_accessible(0x2000_1000, 64, true));
        assert!(is_accessible(0x1000_0000, 0x100, false));
        assert!(!is_accessible(0x1000_0000, 0x100, true));
        assert!(is_accessible(0x4000_0000, 4, true));
        // Straddles the end of SRAM.
        assert!(!is_accessible(0x2008_1FF0, 0x20, false));
        assert!(!is_accessible(0x0000_0000, 4, false));
        assert!(!is_accessible(0xFFFF_FFF0, 0x20, false));
    }

    #[test]
    fn raw_regions_convert() {
        let raw = RawRegion::new(0x2000_0000, 64, Access::ReadWrite, SecurityAttr::Secure, 0b101);
        let r = Region::try_from(&raw).unwrap();
        assert_eq!(r.flags, RegionFlags::CACHEABLE | RegionFlags::SHAREABLE);
        assert_eq!(r.to_raw(), raw);

        let mut bad = raw;
        bad.access = 42;
        assert_eq!(Region::try_from(&bad), Err(MpuError::InvalidArgument));
    }
}
