// paging.rs
//! The kernel's single address space.
//!
//! The directory covers 4 GiB in 4 MiB slots. A slot is either empty, a large
//! page, or backed by a page table holding a handful of 4 KiB pages (only the
//! video alias uses one). Every change is mirrored to the `Machine`, which owns
//! the real page tables.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{KResult, KernelError};
use crate::layout::{LARGE_PAGE_SIZE, PAGE_SIZE};
use crate::machine::{Machine, PageSize};

const DIRECTORY_SLOTS: usize = 1024;
const SMALL_PAGES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub phys: PhysAddr,
    pub flags: PageTableFlags,
}

pub fn user_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

pub struct AddressSpace {
    directory: [Option<Mapping>; DIRECTORY_SLOTS],
    pages: [Option<(VirtAddr, Mapping)>; SMALL_PAGES],
}

fn slot_of(virt: VirtAddr) -> usize {
    (virt.as_u64() / LARGE_PAGE_SIZE) as usize
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self { directory: [None; DIRECTORY_SLOTS], pages: [None; SMALL_PAGES] }
    }

    /// Points the 4 MiB region at `virt` to the frame at `phys`.
    pub fn remap_region<M: Machine>(&mut self, machine: &mut M, virt: VirtAddr, phys: PhysAddr) -> KResult<()> {
        if virt.as_u64() % LARGE_PAGE_SIZE != 0 || phys.as_u64() % LARGE_PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let slot = slot_of(virt);
        if slot >= DIRECTORY_SLOTS || self.pages.iter().flatten().any(|(v, _)| slot_of(*v) == slot) {
            return Err(KernelError::InvalidArgument);
        }
        let mapping = Mapping { phys, flags: user_flags() | PageTableFlags::HUGE_PAGE };
        self.directory[slot] = Some(mapping);
        machine.map(virt, phys, PageSize::Large, mapping.flags);
        klog_trace!("paging", "region {:#x} -> {:#x}", virt.as_u64(), phys.as_u64());
        Ok(())
    }

    /// Maps the single 4 KiB page at `virt` to `phys`, replacing any old target.
    pub fn map_page<M: Machine>(&mut self, machine: &mut M, virt: VirtAddr, phys: PhysAddr) -> KResult<()> {
        if virt.as_u64() % PAGE_SIZE != 0 || phys.as_u64() % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let slot = slot_of(virt);
        if slot >= DIRECTORY_SLOTS || self.directory[slot].is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let mapping = Mapping { phys, flags: user_flags() };
        let entry = match self.pages.iter().position(|p| matches!(p, Some((v, _)) if *v == virt)) {
            Some(i) => i,
            None => self.pages.iter().position(Option::is_none).ok_or(KernelError::InvalidArgument)?,
        };
        self.pages[entry] = Some((virt, mapping));
        machine.map(virt, phys, PageSize::Small, mapping.flags);
        klog_trace!("paging", "page {:#x} -> {:#x}", virt.as_u64(), phys.as_u64());
        Ok(())
    }

    pub fn unmap_page<M: Machine>(&mut self, machine: &mut M, virt: VirtAddr) {
        for entry in self.pages.iter_mut() {
            if matches!(entry, Some((v, _)) if *v == virt) {
                *entry = None;
                machine.unmap(virt, PageSize::Small);
            }
        }
    }

    pub fn flush<M: Machine>(&self, machine: &mut M) {
        machine.flush_tlb();
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let page_base = virt.align_down(PAGE_SIZE);
        for (v, mapping) in self.pages.iter().flatten() {
            if *v == page_base {
                return Some(mapping.phys + (virt - page_base));
            }
        }
        let slot = slot_of(virt);
        let mapping = self.directory.get(slot).copied().flatten()?;
        Some(mapping.phys + virt.as_u64() % LARGE_PAGE_SIZE)
    }

    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.translate(virt).is_some()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MIB, USER_REGION_BASE, VIDEO_PHYS, VIDMAP_ADDR};
    use crate::testing::SimMachine;

    #[test]
    fn region_remap_replaces_previous_frame() {
        let mut machine = SimMachine::new();
        let mut space = AddressSpace::new();
        let user = VirtAddr::new(USER_REGION_BASE);
        space.remap_region(&mut machine, user, PhysAddr::new(8 * MIB)).unwrap();
        space.remap_region(&mut machine, user, PhysAddr::new(12 * MIB)).unwrap();
        assert_eq!(space.translate(user + 0x48000u64), Some(PhysAddr::new(12 * MIB + 0x48000)));
        assert_eq!(machine.mapping_of(user), Some((PhysAddr::new(12 * MIB), PageSize::Large)));
    }

    #[test]
    fn small_page_alias() {
        let mut machine = SimMachine::new();
        let mut space = AddressSpace::new();
        let alias = VirtAddr::new(VIDMAP_ADDR);
        space.map_page(&mut machine, alias, PhysAddr::new(VIDEO_PHYS)).unwrap();
        assert_eq!(space.translate(alias + 10u64), Some(PhysAddr::new(VIDEO_PHYS + 10)));
        assert!(!space.is_mapped(alias + PAGE_SIZE));
        space.unmap_page(&mut machine, alias);
        assert!(!space.is_mapped(alias));
        assert_eq!(machine.mapping_of(alias), None);
    }

    #[test]
    fn misaligned_requests_are_rejected() {
        let mut machine = SimMachine::new();
        let mut space = AddressSpace::new();
        let err = space.remap_region(&mut machine, VirtAddr::new(USER_REGION_BASE + PAGE_SIZE), PhysAddr::new(8 * MIB));
        assert_eq!(err, Err(KernelError::InvalidArgument));
        let err = space.map_page(&mut machine, VirtAddr::new(VIDMAP_ADDR + 1), PhysAddr::new(VIDEO_PHYS));
        assert_eq!(err, Err(KernelError::InvalidArgument));
    }
}
