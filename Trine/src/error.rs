// error.rs
use core::fmt;

/// Failure of a kernel operation. Every variant reaches user space as `-1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Null or out-of-region user pointer.
    BadAddress,
    InvalidDescriptor,
    DescriptorNotOpen,
    TooManyFiles,
    NotFound,
    NameTooLong,
    NotExecutable,
    ProcessLimit,
    NoSuchProcess,
    /// The bound driver has no such operation (e.g. writing stdin).
    Unsupported,
    ReadOnly,
    InvalidArgument,
    ArgumentsTooLong,
    /// The driver declined to close.
    Refused,
    /// Nothing to read yet; the caller should wait for the next interrupt.
    WouldBlock,
    CorruptImage,
}

impl KernelError {
    pub const fn errno(self) -> i64 {
        -1
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            KernelError::BadAddress => "bad address",
            KernelError::InvalidDescriptor => "invalid file descriptor",
            KernelError::DescriptorNotOpen => "file descriptor not open",
            KernelError::TooManyFiles => "too many open files",
            KernelError::NotFound => "no such file",
            KernelError::NameTooLong => "file name too long",
            KernelError::NotExecutable => "not an executable",
            KernelError::ProcessLimit => "process limit reached",
            KernelError::NoSuchProcess => "no such process",
            KernelError::Unsupported => "operation not supported",
            KernelError::ReadOnly => "read-only file system",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::ArgumentsTooLong => "argument list too long",
            KernelError::Refused => "close refused by driver",
            KernelError::WouldBlock => "operation would block",
            KernelError::CorruptImage => "corrupt filesystem image",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// CPU exceptions a user program can raise, in vector order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    NonMaskableInterrupt,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    CoprocessorSegmentOverrun,
    InvalidTss,
    SegmentNotPresent,
    StackSegmentFault,
    GeneralProtection,
    PageFault,
    Reserved,
    X87FloatingPoint,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPoint,
}

impl Exception {
    pub const fn name(self) -> &'static str {
        match self {
            Exception::DivideError => "Divide Error",
            Exception::Debug => "Debug",
            Exception::NonMaskableInterrupt => "Non-maskable Interrupt",
            Exception::Breakpoint => "Breakpoint",
            Exception::Overflow => "Overflow",
            Exception::BoundRangeExceeded => "BOUND Range Exceeded",
            Exception::InvalidOpcode => "Invalid Opcode",
            Exception::DeviceNotAvailable => "Device Not Available",
            Exception::DoubleFault => "Double Fault",
            Exception::CoprocessorSegmentOverrun => "Coprocessor Segment Overrun",
            Exception::InvalidTss => "Invalid TSS",
            Exception::SegmentNotPresent => "Segment Not Present",
            Exception::StackSegmentFault => "Stack-Segment Fault",
            Exception::GeneralProtection => "General Protection",
            Exception::PageFault => "Page Fault",
            Exception::Reserved => "Reserved",
            Exception::X87FloatingPoint => "x87 FPU Floating-Point Error",
            Exception::AlignmentCheck => "Alignment Check",
            Exception::MachineCheck => "Machine Check",
            Exception::SimdFloatingPoint => "SIMD Floating-Point Exception",
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_is_minus_one_at_the_abi() {
        for e in [KernelError::BadAddress, KernelError::WouldBlock, KernelError::ProcessLimit] {
            assert_eq!(e.errno(), -1);
        }
    }

    #[test]
    fn exceptions_print_architectural_names() {
        assert_eq!(Exception::PageFault.to_string(), "Page Fault");
        assert_eq!(Exception::DivideError.name(), "Divide Error");
        assert_eq!(std::format!("{}", Exception::GeneralProtection), "General Protection");
    }
}
