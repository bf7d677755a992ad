// gdt.rs
//! Segments for ring 0 and ring 3, plus the TSS that tells the CPU which
//! kernel stack to use when a user program traps.

use core::ptr::{addr_of, addr_of_mut};

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const FAULT_STACK_SIZE: usize = 4096 * 4;
static mut FAULT_STACK: [u8; FAULT_STACK_SIZE] = [0; FAULT_STACK_SIZE];

// rsp0 is rewritten on every process change, so the TSS cannot live behind
// an immutable lazy_static.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        // SAFETY: runs once, before the TSS is loaded or rsp0 is ever written.
        let tss: &'static TaskStateSegment = unsafe {
            let start = VirtAddr::from_ptr(addr_of!(FAULT_STACK));
            (*addr_of_mut!(TSS)).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                start + FAULT_STACK_SIZE as u64;
            &*addr_of!(TSS)
        };
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(tss));
        (gdt, Selectors { kernel_code, kernel_data, user_code, user_data, tss })
    };
}

pub fn init() {
    GDT.0.load();
    let sel = &GDT.1;
    // SAFETY: the selectors come from the table just loaded.
    unsafe {
        CS::set_reg(sel.kernel_code);
        DS::set_reg(sel.kernel_data);
        ES::set_reg(sel.kernel_data);
        SS::set_reg(sel.kernel_data);
        load_tss(sel.tss);
    }
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Sets rsp0, the stack the CPU switches to on a trap from ring 3.
pub fn set_kernel_stack(top: VirtAddr) {
    // SAFETY: single CPU; the field is only read by hardware on privilege change.
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = top;
    }
}
