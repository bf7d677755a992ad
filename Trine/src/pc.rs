// pc.rs
//! The real-hardware back-end: a `Machine` over the bootloader's physical
//! memory window and a `Cpu` that switches kernel stacks with `context`.

use core::mem::MaybeUninit;
use core::ptr::{addr_of_mut, copy_nonoverlapping, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use bootloader::BootInfo;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::Translate;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageSize as _, PageTable, PageTableFlags, PhysFrame, Size2MiB,
    Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::context;
use crate::fs::FileSystem;
use crate::gdt;
use crate::kb::SCANCODES;
use crate::kernel::{Kernel, TerminalSwitch};
use crate::layout::{
    KERNEL_STACKS_TOP, KERNEL_STACK_SIZE, LARGE_PAGE_SIZE, MAX_PROCESSES, PAGE_SIZE, PROCESS_FRAMES_BASE,
    PROCESS_FRAME_SIZE, SCREEN_COLS,
};
use crate::machine::{Event, Machine, PageSize};
use crate::process::{ExitStatus, HaltOutcome, KernelContext, Launch};
use crate::syscall::{self, Completion, Cpu};

const CMOS_INDEX: u16 = 0x70;
const CMOS_DATA: u16 = 0x71;
/// Register select with NMI disabled.
const RTC_REG_A: u8 = 0x8A;
const RTC_REG_B: u8 = 0x8B;
const RTC_REG_C: u8 = 0x0C;

const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;

/// Frames below this address belong to the fixed layout.
const RESERVED_END: u64 = PROCESS_FRAMES_BASE + MAX_PROCESSES as u64 * PROCESS_FRAME_SIZE;

static PENDING_TICKS: AtomicU32 = AtomicU32::new(0);

/// Called from the keyboard IRQ.
pub fn latch_scancode(scancode: u8) {
    if !SCANCODES.lock().push(scancode) {
        klog_warn!("kb", "queue full, dropped {:#x}", scancode);
    }
}

/// Called from the RTC IRQ; reading register C re-arms the interrupt.
pub fn latch_rtc_tick() {
    unsafe {
        Port::<u8>::new(CMOS_INDEX).write(RTC_REG_C);
        let _: u8 = Port::new(CMOS_DATA).read();
    }
    PENDING_TICKS.fetch_add(1, Ordering::AcqRel);
}

/// Hands out 4 KiB frames from usable memory above the fixed layout.
pub struct BootFrames {
    map: &'static MemoryMap,
    next: usize,
}

impl BootFrames {
    fn usable(&self) -> impl Iterator<Item = PhysFrame> {
        let map: &'static MemoryMap = self.map;
        map.iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .flat_map(|r| (r.range.start_addr()..r.range.end_addr()).step_by(PAGE_SIZE as usize))
            .filter(|&addr| addr >= RESERVED_END)
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        (start..end).step_by(PAGE_SIZE as usize).all(|addr| {
            self.map.iter().any(|r| {
                r.region_type == MemoryRegionType::Usable && (r.range.start_addr()..r.range.end_addr()).contains(&addr)
            })
        })
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable().nth(self.next);
        self.next += 1;
        frame
    }
}

pub struct PcMachine {
    phys_offset: VirtAddr,
    mapper: OffsetPageTable<'static>,
    frames: BootFrames,
}

impl PcMachine {
    /// # Safety
    /// `boot_info` must describe the complete physical memory window set up
    /// by the bootloader, and this must be called once.
    pub unsafe fn new(boot_info: &'static BootInfo) -> Self {
        let phys_offset = VirtAddr::new(boot_info.physical_memory_offset);
        let (l4_frame, _) = Cr3::read();
        let l4: &'static mut PageTable = &mut *(phys_offset + l4_frame.start_address().as_u64()).as_mut_ptr();
        let mut machine = Self {
            phys_offset,
            mapper: OffsetPageTable::new(l4, phys_offset),
            frames: BootFrames { map: &boot_info.memory_map, next: 0 },
        };
        if !machine.frames.covers(PROCESS_FRAMES_BASE, RESERVED_END) {
            klog_warn!("pc", "process frames {:#x}..{:#x} are not all usable RAM", PROCESS_FRAMES_BASE, RESERVED_END);
        }
        machine.map_kernel_stacks();
        machine.enable_rtc();
        machine
    }

    fn map_kernel_stacks(&mut self) {
        let bottom = KERNEL_STACKS_TOP - MAX_PROCESSES as u64 * KERNEL_STACK_SIZE;
        for addr in (bottom..KERNEL_STACKS_TOP).step_by(PAGE_SIZE as usize) {
            let virt = VirtAddr::new(addr);
            if self.mapper.translate_addr(virt).is_some() {
                klog_warn!("pc", "kernel stack page {:#x} already mapped", addr);
                continue;
            }
            let Some(frame) = self.frames.allocate_frame() else {
                panic!("out of frames for kernel stacks");
            };
            let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            // SAFETY: the page was unmapped and the frame is fresh.
            match unsafe { self.mapper.map_to(Page::<Size4KiB>::containing_address(virt), frame, flags, &mut self.frames) } {
                Ok(flush) => flush.flush(),
                Err(e) => panic!("cannot map kernel stack page {:#x}: {:?}", addr, e),
            }
        }
    }

    fn enable_rtc(&mut self) {
        interrupts::without_interrupts(|| unsafe {
            let mut index = Port::<u8>::new(CMOS_INDEX);
            let mut data = Port::<u8>::new(CMOS_DATA);
            index.write(RTC_REG_B);
            let prev = data.read();
            index.write(RTC_REG_B);
            // periodic interrupt enable
            data.write(prev | 0x40);
        });
    }

    fn window(&self, addr: PhysAddr) -> *mut u8 {
        (self.phys_offset + addr.as_u64()).as_mut_ptr()
    }

    fn map_small(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) {
        let page = Page::<Size4KiB>::containing_address(virt);
        if let Ok((_, flush)) = self.mapper.unmap(page) {
            flush.ignore();
        }
        // SAFETY: the kernel core owns every user-visible mapping.
        match unsafe { self.mapper.map_to(page, PhysFrame::containing_address(phys), flags, &mut self.frames) } {
            Ok(flush) => flush.ignore(),
            Err(e) => klog_error!("pc", "map {:#x} -> {:#x}: {:?}", virt.as_u64(), phys.as_u64(), e),
        }
    }

    fn map_large(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) {
        // a 4 MiB region is two 2 MiB pages here
        for half in 0..LARGE_PAGE_SIZE / Size2MiB::SIZE {
            let offset = half * Size2MiB::SIZE;
            let page = Page::<Size2MiB>::containing_address(virt + offset);
            if let Ok((_, flush)) = self.mapper.unmap(page) {
                flush.ignore();
            }
            let frame = PhysFrame::<Size2MiB>::containing_address(phys + offset);
            // SAFETY: as in map_small.
            match unsafe { self.mapper.map_to(page, frame, flags, &mut self.frames) } {
                Ok(flush) => flush.ignore(),
                Err(e) => klog_error!("pc", "map {:#x} -> {:#x}: {:?}", virt.as_u64(), phys.as_u64(), e),
            }
        }
    }
}

impl Machine for PcMachine {
    fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) {
        // SAFETY: all physical memory is mapped at phys_offset.
        unsafe { copy_nonoverlapping(self.window(addr), buf.as_mut_ptr(), buf.len()) }
    }

    fn write_phys(&mut self, addr: PhysAddr, data: &[u8]) {
        unsafe { copy_nonoverlapping(data.as_ptr(), self.window(addr), data.len()) }
    }

    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, size: PageSize, flags: PageTableFlags) {
        match size {
            PageSize::Small => self.map_small(virt, phys, flags),
            PageSize::Large => self.map_large(virt, phys, flags),
        }
    }

    fn unmap(&mut self, virt: VirtAddr, size: PageSize) {
        match size {
            PageSize::Small => {
                if let Ok((_, flush)) = self.mapper.unmap(Page::<Size4KiB>::containing_address(virt)) {
                    flush.ignore();
                }
            }
            PageSize::Large => {
                for half in 0..LARGE_PAGE_SIZE / Size2MiB::SIZE {
                    let page = Page::<Size2MiB>::containing_address(virt + half * Size2MiB::SIZE);
                    if let Ok((_, flush)) = self.mapper.unmap(page) {
                        flush.ignore();
                    }
                }
            }
        }
    }

    fn flush_tlb(&mut self) {
        x86_64::instructions::tlb::flush_all();
    }

    fn set_kernel_stack(&mut self, top: VirtAddr) {
        gdt::set_kernel_stack(top);
    }

    fn set_cursor(&mut self, row: usize, col: usize) {
        let pos = (row * SCREEN_COLS + col) as u16;
        unsafe {
            let mut index = Port::<u8>::new(CRTC_INDEX);
            let mut data = Port::<u8>::new(CRTC_DATA);
            index.write(0x0F);
            data.write((pos & 0xFF) as u8);
            index.write(0x0E);
            data.write((pos >> 8) as u8);
        }
    }

    fn set_rtc_rate(&mut self, rate: u8) {
        interrupts::without_interrupts(|| unsafe {
            let mut index = Port::<u8>::new(CMOS_INDEX);
            let mut data = Port::<u8>::new(CMOS_DATA);
            index.write(RTC_REG_A);
            let prev = data.read();
            index.write(RTC_REG_A);
            data.write((prev & 0xF0) | (rate & 0x0F));
        });
    }

    fn poll_event(&mut self) -> Option<Event> {
        let ticks = PENDING_TICKS.load(Ordering::Acquire);
        if ticks > 0 && PENDING_TICKS.compare_exchange(ticks, ticks - 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            return Some(Event::RtcTick);
        }
        interrupts::without_interrupts(|| SCANCODES.lock().pop()).map(Event::Scancode)
    }

    fn wait_for_interrupt(&mut self) -> bool {
        interrupts::enable_and_hlt();
        interrupts::disable();
        true
    }
}

/// Carries out control transfers on the real CPU.
pub struct PcCpu;

fn user_segments() -> (u16, u16) {
    let sel = gdt::selectors();
    (sel.user_code.0, sel.user_data.0)
}

impl Cpu<PcMachine> for PcCpu {
    fn enter_user(&mut self, kernel: &mut Kernel<PcMachine>, launch: Launch) -> ExitStatus {
        let save: *mut KernelContext = match kernel.parent_context_mut(launch.pid) {
            Ok(ctx) => ctx,
            Err(e) => {
                klog_error!("pc", "pid {} vanished before entry: {}", launch.pid, e);
                return ExitStatus::Exception;
            }
        };
        let (code, data) = user_segments();
        // SAFETY: the pcb outlives the child and activate() mapped its frame.
        let status = unsafe { context::enter_user(save, launch.entry, launch.user_stack, code, data) };
        ExitStatus::from_code(status)
    }

    fn switch_terminal(&mut self, kernel: &mut Kernel<PcMachine>, switch: TerminalSwitch) {
        match switch {
            TerminalSwitch::Swapped { from, to } => {
                let (Some(parked), Some(next)) = (kernel.terminal(from).active(), kernel.terminal(to).active()) else {
                    return;
                };
                let save: *mut KernelContext = match kernel.switch_context_mut(parked) {
                    Ok(ctx) => ctx,
                    Err(_) => return,
                };
                let load: *const KernelContext = match kernel.switch_context_mut(next) {
                    Ok(ctx) => ctx,
                    Err(_) => return,
                };
                // SAFETY: `next` parked itself here the last time its terminal left the front.
                unsafe { context::switch(save, load) }
            }
            TerminalSwitch::Launched { from, launch } => {
                let Some(parked) = kernel.terminal(from).active() else {
                    return;
                };
                let save: *mut KernelContext = match kernel.switch_context_mut(parked) {
                    Ok(ctx) => ctx,
                    Err(_) => return,
                };
                let (code, data) = user_segments();
                // SAFETY: as in enter_user; a later switch back returns here.
                unsafe {
                    context::enter_user(save, launch.entry, launch.user_stack, code, data);
                }
            }
        }
    }
}

static mut KERNEL_CELL: MaybeUninit<Kernel<PcMachine>> = MaybeUninit::uninit();
static KERNEL: AtomicPtr<Kernel<PcMachine>> = AtomicPtr::new(null_mut());

/// # Safety
/// Single CPU. Only the trap paths call this, with interrupts masked, and
/// no two of them overlap.
unsafe fn kernel() -> &'static mut Kernel<PcMachine> {
    let ptr = KERNEL.load(Ordering::Acquire);
    if ptr.is_null() {
        panic!("trap before the kernel was initialized");
    }
    &mut *ptr
}

#[no_mangle]
extern "C" fn trine_syscall(number: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let kernel = unsafe { kernel() };
    match syscall::dispatch(kernel, &mut PcCpu, number, a1, a2, a3) {
        Completion::Return(value) => value,
        Completion::Halted(outcome) => continue_after(kernel, outcome),
    }
}

/// Applies latched input for an IRQ that interrupted ring 3. No kernel state
/// is borrowed there, so a terminal switch can park the interrupted process
/// right away.
pub fn service_user_interrupt() {
    let kernel = unsafe { kernel() };
    syscall::pump(kernel, &mut PcCpu);
}

/// Entered from the exception handlers when ring 3 faults.
pub fn user_fault(exception: crate::error::Exception) -> ! {
    let kernel = unsafe { kernel() };
    let Some(pid) = kernel.current() else {
        panic!("{} exception with no current process", exception);
    };
    match kernel.fault(pid, exception) {
        Ok(outcome) => continue_after(kernel, outcome),
        Err(e) => panic!("cannot tear down pid {}: {}", pid, e),
    }
}

fn continue_after(kernel: &mut Kernel<PcMachine>, outcome: HaltOutcome) -> ! {
    match outcome {
        // SAFETY: the parent parked this context in enter_user and is still live.
        HaltOutcome::Resume { context, status, .. } => unsafe { context::resume(&context, u64::from(status.code())) },
        HaltOutcome::Respawned(launch) => launch_root(kernel, launch),
    }
}

fn launch_root(kernel: &mut Kernel<PcMachine>, launch: Launch) -> ! {
    PcCpu.enter_user(kernel, launch);
    // a root shell respawns instead of resuming whoever entered it
    panic!("root shell of tty{} returned", launch.terminal.index());
}

/// Brings up the CPU tables and devices, then runs the first shell.
pub fn run(boot_info: &'static BootInfo, image: &'static [u8]) -> ! {
    gdt::init();
    crate::interrupt::init_idt();
    crate::interrupt::remap_pic();

    let machine = unsafe { PcMachine::new(boot_info) };
    let fs = match FileSystem::new(image) {
        Ok(fs) => fs,
        Err(e) => panic!("filesystem image rejected: {}", e),
    };
    klog_info!("pc", "{} directory entries", fs.dentry_count());

    // SAFETY: written once, before any trap can observe KERNEL.
    let kernel = unsafe {
        let cell = &mut *addr_of_mut!(KERNEL_CELL);
        let kernel = cell.write(Kernel::new(machine, fs));
        KERNEL.store(kernel, Ordering::Release);
        kernel
    };
    let launch = match kernel.boot() {
        Ok(launch) => launch,
        Err(e) => panic!("cannot start the first shell: {}", e),
    };
    launch_root(kernel, launch)
}
