// layout.rs
//! Fixed memory layout and resource limits shared by every subsystem.
//!
//! Physical memory below 8 MiB holds the kernel and the per-process kernel
//! stacks; every process id owns one 4 MiB frame above it. All user programs
//! see the same 4 MiB user region at 128 MiB, remapped on every process change.

use x86_64::{PhysAddr, VirtAddr};

use crate::process::Pid;
use crate::terminal::TerminalId;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Process ids are 0..MAX_PROCESSES.
pub const MAX_PROCESSES: usize = 6;
/// Descriptors per process; 0 and 1 are the standard streams.
pub const MAX_FILES: usize = 8;
pub const FIRST_USER_FD: usize = 2;
pub const TERMINAL_COUNT: usize = 3;

pub const PAGE_SIZE: u64 = 4 * KIB;
pub const LARGE_PAGE_SIZE: u64 = 4 * MIB;

pub const KERNEL_STACK_SIZE: u64 = 8 * KIB;
/// Kernel stacks grow down from here, one per process id.
pub const KERNEL_STACKS_TOP: u64 = 8 * MIB;

pub const PROCESS_FRAMES_BASE: u64 = 8 * MIB;
pub const PROCESS_FRAME_SIZE: u64 = LARGE_PAGE_SIZE;

pub const USER_REGION_BASE: u64 = 128 * MIB;
pub const USER_REGION_END: u64 = USER_REGION_BASE + PROCESS_FRAME_SIZE;
pub const PROGRAM_LOAD_ADDR: u64 = 0x0804_8000;
/// Eight below the end keeps the x86-64 call alignment at the entry point.
pub const USER_STACK_TOP: u64 = USER_REGION_END - 8;

/// User-visible alias of the text-mode video page.
pub const VIDMAP_ADDR: u64 = 136 * MIB;
pub const VIDEO_PHYS: u64 = 0xB8000;
/// Terminal backup pages sit right after the live video page.
pub const TERMINAL_BACKUP_BASE: u64 = VIDEO_PHYS + PAGE_SIZE;

pub const SCREEN_COLS: usize = 80;
pub const SCREEN_ROWS: usize = 25;
pub const SCREEN_BYTES: usize = SCREEN_COLS * SCREEN_ROWS * 2;
pub const DEFAULT_ATTRIBUTE: u8 = 0x0F;

pub const EXEC_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ENTRY_POINT_OFFSET: u32 = 24;

pub const LINE_CAPACITY: usize = 128;
pub const ARGS_CAPACITY: usize = 128;
pub const ROOT_PROGRAM: &[u8] = b"shell";

pub const fn process_frame(pid: Pid) -> PhysAddr {
    PhysAddr::new_truncate(PROCESS_FRAMES_BASE + pid.index() as u64 * PROCESS_FRAME_SIZE)
}

/// Top of the kernel stack the CPU switches to when `pid` traps from ring 3.
pub const fn kernel_stack_top(pid: Pid) -> VirtAddr {
    VirtAddr::new_truncate(KERNEL_STACKS_TOP - pid.index() as u64 * KERNEL_STACK_SIZE)
}

pub const fn terminal_backup_page(id: TerminalId) -> PhysAddr {
    PhysAddr::new_truncate(TERMINAL_BACKUP_BASE + id.index() as u64 * PAGE_SIZE)
}

/// Physical address of the program image inside `pid`'s frame.
pub const fn load_phys(pid: Pid) -> PhysAddr {
    PhysAddr::new_truncate(process_frame(pid).as_u64() + (PROGRAM_LOAD_ADDR - USER_REGION_BASE))
}

/// Largest image that fits between the load address and the end of the frame.
pub const MAX_IMAGE_SIZE: u64 = USER_REGION_END - PROGRAM_LOAD_ADDR;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_disjoint_and_above_kernel() {
        let a = process_frame(Pid::new(0).unwrap());
        let b = process_frame(Pid::new(5).unwrap());
        assert_eq!(a.as_u64(), 8 * MIB);
        assert_eq!(b.as_u64(), 28 * MIB);
        assert_eq!(load_phys(Pid::new(1).unwrap()).as_u64(), 12 * MIB + 0x48000);
    }

    #[test]
    fn kernel_stacks_do_not_overlap() {
        let top0 = kernel_stack_top(Pid::new(0).unwrap()).as_u64();
        let top1 = kernel_stack_top(Pid::new(1).unwrap()).as_u64();
        assert_eq!(top0 - top1, KERNEL_STACK_SIZE);
        assert!(top1 - KERNEL_STACK_SIZE * 5 > 4 * MIB);
    }

    #[test]
    fn backup_pages_follow_video_memory() {
        assert_eq!(terminal_backup_page(TerminalId::new(0).unwrap()).as_u64(), 0xB9000);
        assert_eq!(terminal_backup_page(TerminalId::new(2).unwrap()).as_u64(), 0xBB000);
    }
}
