// context.rs
//! Kernel-stack control transfers: entering ring 3, resuming a parked
//! kernel context and the int 0x80 trap stub.

use core::arch::global_asm;

use x86_64::VirtAddr;

use crate::process::KernelContext;

// Callee-saved registers are pushed on the current kernel stack and the
// resulting rsp/rbp are stored in a `KernelContext`. Resuming that context
// pops them and returns from the original `trine_enter_user` call with rax
// set to the value passed in.
global_asm!(
    r#"
.global trine_enter_user
trine_enter_user:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov [rdi + 8], rbp
    mov ax, r8w
    mov ds, ax
    mov es, ax
    push r8
    push rdx
    push 0x202
    push rcx
    push rsi
    iretq

.global trine_resume
trine_resume:
    mov rsp, [rdi]
    mov rbp, [rdi + 8]
    mov rax, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.global trine_switch
trine_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov [rdi + 8], rbp
    mov rsp, [rsi]
    mov rbp, [rsi + 8]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.global trine_syscall_entry
trine_syscall_entry:
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    sub rsp, 8
    mov rcx, rdx
    mov rdx, rsi
    mov rsi, rdi
    mov rdi, rax
    call trine_syscall
    add rsp, 8
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    iretq
"#
);

extern "C" {
    fn trine_enter_user(save: *mut KernelContext, entry: u64, user_stack: u64, code: u64, data: u64) -> u64;
    fn trine_resume(context: *const KernelContext, value: u64) -> !;
    fn trine_switch(save: *mut KernelContext, load: *const KernelContext);
    fn trine_syscall_entry();
}

/// Address of the int 0x80 stub for the IDT.
pub fn syscall_entry() -> VirtAddr {
    VirtAddr::new(trine_syscall_entry as usize as u64)
}

/// Drops to ring 3 at `entry`. Returns the value a later `resume` of `save`
/// delivers.
///
/// # Safety
/// `save` must stay valid until it is resumed, the user region must be mapped
/// and rsp0 must point at this process's kernel stack.
pub unsafe fn enter_user(save: *mut KernelContext, entry: VirtAddr, user_stack: VirtAddr, code: u16, data: u16) -> u64 {
    trine_enter_user(save, entry.as_u64(), user_stack.as_u64(), u64::from(code), u64::from(data))
}

/// Abandons the current kernel stack and continues in `context`.
///
/// # Safety
/// `context` must have been filled by `enter_user` on a stack that is still
/// intact.
pub unsafe fn resume(context: &KernelContext, value: u64) -> ! {
    trine_resume(context, value)
}

/// Parks the current kernel stack in `save` and continues in `load`. Returns
/// when something switches back to `save`.
///
/// # Safety
/// `load` must hold a context parked by `switch` or `enter_user` whose stack
/// is still intact; `save` must stay valid while parked.
pub unsafe fn switch(save: *mut KernelContext, load: *const KernelContext) {
    trine_switch(save, load)
}
