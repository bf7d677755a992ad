#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;

use trine::log::{self, LogLevel};
use trine::{klog_info, pc, sprintln};

/// Filesystem image chosen at build time (see build.rs).
static FS_IMAGE: &[u8] = include_bytes!(env!("TRINE_FS_IMAGE"));

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    log::set_max_level(if cfg!(debug_assertions) { LogLevel::Debug } else { LogLevel::Info });
    sprintln!("\n=== Trine ===");
    klog_info!("boot", "filesystem image of {} bytes", FS_IMAGE.len());
    pc::run(boot_info, FS_IMAGE)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    sprintln!("\n*** PANIC ***");
    if let Some(loc) = info.location() {
        sprintln!("at {}:{}: {}", loc.file(), loc.line(), info.message());
    } else {
        sprintln!("panic: {}", info.message());
    }
    sprintln!("recent log:");
    log::for_each_recent(|line| sprintln!("  [{} {}] {}", line.level.as_str(), line.subsystem, line.text()));
    loop {
        x86_64::instructions::hlt();
    }
}
