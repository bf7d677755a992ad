// lib.rs
//! System-call stubs for Trine user programs.
//!
//! `int 0x80` with the call number in rax and up to three arguments in
//! rdi, rsi and rdx; the result comes back in rax.
#![no_std]

use core::panic::PanicInfo;

pub const SYS_HALT: u64 = 1;
pub const SYS_EXECUTE: u64 = 2;
pub const SYS_READ: u64 = 3;
pub const SYS_WRITE: u64 = 4;
pub const SYS_OPEN: u64 = 5;
pub const SYS_CLOSE: u64 = 6;
pub const SYS_GETARGS: u64 = 7;
pub const SYS_VIDMAP: u64 = 8;
pub const SYS_SET_HANDLER: u64 = 9;
pub const SYS_SIGRETURN: u64 = 10;

pub const STDIN: i32 = 0;
pub const STDOUT: i32 = 1;

/// Status the kernel reports for a program killed by an exception.
pub const ABNORMAL_EXIT: i64 = 256;

#[inline(always)]
fn syscall3(num: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "int 0x80",
            inlateout("rax") num as i64 => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            options(nostack),
        );
    }
    ret
}

pub fn halt(status: u8) -> ! {
    syscall3(SYS_HALT, u64::from(status), 0, 0);
    // the kernel never returns from a successful halt
    loop {
        core::hint::spin_loop();
    }
}

/// Runs a NUL-terminated command line and waits for it.
pub fn execute(command: &[u8]) -> i64 {
    syscall3(SYS_EXECUTE, command.as_ptr() as u64, 0, 0)
}

pub fn read(fd: i32, buf: &mut [u8]) -> i64 {
    syscall3(SYS_READ, fd as u64, buf.as_mut_ptr() as u64, buf.len() as u64)
}

pub fn write(fd: i32, buf: &[u8]) -> i64 {
    syscall3(SYS_WRITE, fd as u64, buf.as_ptr() as u64, buf.len() as u64)
}

/// Opens a NUL-terminated name.
pub fn open(name: &[u8]) -> i64 {
    syscall3(SYS_OPEN, name.as_ptr() as u64, 0, 0)
}

pub fn close(fd: i32) -> i64 {
    syscall3(SYS_CLOSE, fd as u64, 0, 0)
}

/// Copies the NUL-terminated arguments into `buf`. Fails (-1) when they do
/// not fit, so pass room for up to 128 bytes plus the NUL.
pub fn getargs(buf: &mut [u8]) -> i64 {
    syscall3(SYS_GETARGS, buf.as_mut_ptr() as u64, buf.len() as u64, 0)
}

/// Maps the text screen and returns its address.
pub fn vidmap() -> Option<*mut u8> {
    let mut addr: u64 = 0;
    let ret = syscall3(SYS_VIDMAP, &mut addr as *mut u64 as u64, 0, 0);
    if ret < 0 {
        return None;
    }
    Some(ret as u64 as *mut u8)
}

pub fn set_handler(signum: i32, handler: u64) -> i64 {
    syscall3(SYS_SET_HANDLER, signum as u64, handler, 0)
}

pub fn sigreturn() -> i64 {
    syscall3(SYS_SIGRETURN, 0, 0, 0)
}

pub fn print(s: &[u8]) {
    let _ = write(STDOUT, s);
}

/// Bytes up to the first NUL.
pub fn until_nul(buf: &[u8]) -> &[u8] {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..len]
}

/// Declares `_start` for a program whose `main` returns its exit status.
#[macro_export]
macro_rules! entry {
    ($main:path) => {
        #[no_mangle]
        #[link_section = ".text._start"]
        pub extern "C" fn _start() -> ! {
            let status: u8 = $main();
            $crate::halt(status)
        }
    };
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    print(b"panic\n");
    halt(255)
}
