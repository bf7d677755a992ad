#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "kernel-image", feature(abi_x86_interrupt))]

#[macro_use]
pub mod log;

pub mod error;
pub mod layout;
pub mod machine;

pub mod fs;
pub mod kb;
pub mod paging;
pub mod rtc;
pub mod terminal;
pub mod vga;

pub mod fd;
pub mod kernel;
pub mod process;
pub mod syscall;

#[cfg(feature = "kernel-image")]
pub mod context;
#[cfg(feature = "kernel-image")]
pub mod gdt;
#[cfg(feature = "kernel-image")]
pub mod interrupt;
#[cfg(feature = "kernel-image")]
pub mod pc;

#[cfg(test)]
mod testing;

pub use error::{KResult, KernelError};
pub use kernel::Kernel;
pub use machine::Machine;
