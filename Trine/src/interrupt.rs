// interrupt.rs
use lazy_static::lazy_static;
use x86_64::instructions::port::Port;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

use crate::error::Exception;
use crate::{context, gdt, pc};

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

pub const PIC1_OFFSET: u8 = 0x20;
pub const PIC2_OFFSET: u8 = 0x28;

const KEYBOARD_IRQ: u8 = 1;
const CASCADE_IRQ: u8 = 2;
const RTC_IRQ: u8 = 8;
pub const SYSCALL_VECTOR: u8 = 0x80;

const KEYBOARD_DATA: u16 = 0x60;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error);
        idt.debug.set_handler_fn(debug);
        idt.non_maskable_interrupt.set_handler_fn(non_maskable_interrupt);
        idt.breakpoint.set_handler_fn(breakpoint);
        idt.overflow.set_handler_fn(overflow);
        idt.bound_range_exceeded.set_handler_fn(bound_range_exceeded);
        idt.invalid_opcode.set_handler_fn(invalid_opcode);
        idt.device_not_available.set_handler_fn(device_not_available);
        // SAFETY: the IST slot is set up by gdt::init before this table loads.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss);
        idt.segment_not_present.set_handler_fn(segment_not_present);
        idt.stack_segment_fault.set_handler_fn(stack_segment_fault);
        idt.general_protection_fault.set_handler_fn(general_protection_fault);
        idt.page_fault.set_handler_fn(page_fault);
        idt.x87_floating_point.set_handler_fn(x87_floating_point);
        idt.alignment_check.set_handler_fn(alignment_check);
        idt.machine_check.set_handler_fn(machine_check);
        idt.simd_floating_point.set_handler_fn(simd_floating_point);

        idt[PIC1_OFFSET + KEYBOARD_IRQ].set_handler_fn(keyboard_interrupt);
        idt[PIC2_OFFSET + RTC_IRQ - 8].set_handler_fn(rtc_interrupt);
        // SAFETY: the stub saves every register it touches and ends in iretq.
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(context::syscall_entry())
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init_idt() {
    IDT.load();
}

/// Moves the PIC vectors past the CPU exceptions and unmasks the keyboard and
/// the RTC.
pub fn remap_pic() {
    unsafe {
        let mut a1 = Port::<u8>::new(PIC1_DATA);
        let mut a2 = Port::<u8>::new(PIC2_DATA);
        let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
        let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);

        cmd1.write(0x11);
        cmd2.write(0x11);
        a1.write(PIC1_OFFSET);
        a2.write(PIC2_OFFSET);
        // slave on IRQ2
        a1.write(1 << CASCADE_IRQ);
        a2.write(CASCADE_IRQ);
        a1.write(0x01);
        a2.write(0x01);

        a1.write(!((1 << KEYBOARD_IRQ) | (1 << CASCADE_IRQ)));
        a2.write(!(1 << (RTC_IRQ - 8)));
    }
}

fn send_eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            Port::<u8>::new(PIC2_COMMAND).write(0x20);
        }
        Port::<u8>::new(PIC1_COMMAND).write(0x20);
    }
}

extern "x86-interrupt" fn keyboard_interrupt(frame: InterruptStackFrame) {
    let scancode: u8 = unsafe { Port::new(KEYBOARD_DATA).read() };
    pc::latch_scancode(scancode);
    send_eoi(KEYBOARD_IRQ);
    service_if_user(&frame);
}

extern "x86-interrupt" fn rtc_interrupt(frame: InterruptStackFrame) {
    pc::latch_rtc_tick();
    send_eoi(RTC_IRQ);
    service_if_user(&frame);
}

/// Ring 0 only takes IRQs while idling in a blocking call, which drains the
/// latches itself.
fn service_if_user(frame: &InterruptStackFrame) {
    if frame.code_segment.rpl() == PrivilegeLevel::Ring3 {
        pc::service_user_interrupt();
    }
}

/// A fault in ring 3 kills the process; one in the kernel is fatal.
fn exception(frame: &InterruptStackFrame, exception: Exception) {
    if frame.code_segment.rpl() == PrivilegeLevel::Ring3 {
        pc::user_fault(exception);
    }
    panic!("{} exception in kernel at {:#x}", exception, frame.instruction_pointer.as_u64());
}

macro_rules! exception_handlers {
    ($($name:ident => $exception:ident),* $(,)?) => {
        $(
            extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
                exception(&frame, Exception::$exception);
            }
        )*
    };
}

macro_rules! exception_handlers_with_code {
    ($($name:ident => $exception:ident),* $(,)?) => {
        $(
            extern "x86-interrupt" fn $name(frame: InterruptStackFrame, _code: u64) {
                exception(&frame, Exception::$exception);
            }
        )*
    };
}

exception_handlers! {
    divide_error => DivideError,
    debug => Debug,
    non_maskable_interrupt => NonMaskableInterrupt,
    breakpoint => Breakpoint,
    overflow => Overflow,
    bound_range_exceeded => BoundRangeExceeded,
    invalid_opcode => InvalidOpcode,
    device_not_available => DeviceNotAvailable,
    x87_floating_point => X87FloatingPoint,
    simd_floating_point => SimdFloatingPoint,
}

exception_handlers_with_code! {
    invalid_tss => InvalidTss,
    segment_not_present => SegmentNotPresent,
    stack_segment_fault => StackSegmentFault,
    general_protection_fault => GeneralProtection,
    alignment_check => AlignmentCheck,
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    klog_debug!("int", "page fault at {:#x} ({:?})", Cr2::read_raw(), code);
    exception(&frame, Exception::PageFault);
}

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn machine_check(frame: InterruptStackFrame) -> ! {
    panic!("machine check at {:#x}", frame.instruction_pointer.as_u64());
}
