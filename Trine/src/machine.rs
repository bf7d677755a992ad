// machine.rs
//! The hardware seam: everything the kernel core needs from the platform.
//!
//! `pc::PcMachine` implements it on real x86 hardware. Tests use
//! `testing::SimMachine`.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

/// An interrupt the platform has latched for the kernel to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Scancode(u8),
    RtcTick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB
    Small,
    /// 4 MiB
    Large,
}

pub trait Machine {
    fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]);
    fn write_phys(&mut self, addr: PhysAddr, data: &[u8]);

    fn copy_phys(&mut self, src: PhysAddr, dst: PhysAddr, len: usize) {
        let mut chunk = [0u8; 512];
        let mut done = 0;
        while done < len {
            let n = core::cmp::min(chunk.len(), len - done);
            self.read_phys(src + done as u64, &mut chunk[..n]);
            self.write_phys(dst + done as u64, &chunk[..n]);
            done += n;
        }
    }

    fn fill_phys(&mut self, dst: PhysAddr, pattern: [u8; 2], len: usize) {
        let mut chunk = [0u8; 512];
        for pair in chunk.chunks_exact_mut(2) {
            pair.copy_from_slice(&pattern);
        }
        let mut done = 0;
        while done < len {
            let n = core::cmp::min(chunk.len(), len - done);
            self.write_phys(dst + done as u64, &chunk[..n]);
            done += n;
        }
    }

    /// Installs (or replaces) a translation for `virt`.
    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, size: PageSize, flags: PageTableFlags);
    fn unmap(&mut self, virt: VirtAddr, size: PageSize);
    fn flush_tlb(&mut self);

    /// Stack the CPU loads when a ring-3 program traps into the kernel.
    fn set_kernel_stack(&mut self, top: VirtAddr);

    fn set_cursor(&mut self, row: usize, col: usize);
    /// Programs the RTC periodic-interrupt rate divider (6..=15).
    fn set_rtc_rate(&mut self, rate: u8);

    fn poll_event(&mut self) -> Option<Event>;
    /// Sleeps until the next interrupt. Returns false when none can arrive.
    fn wait_for_interrupt(&mut self) -> bool;
}
