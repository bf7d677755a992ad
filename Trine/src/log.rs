// log.rs
//! Leveled kernel log.
//!
//! Records go to COM1 in the kernel image and to stderr under `cargo test`.
//! The headers of the most recent records are kept in a small ring so the
//! panic screen can show what led up to it.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

pub const LOG_RING_SIZE: usize = 32;
pub const LOG_LINE_MAX: usize = 96;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level >= max_level()
}

// ---- Recent history ----

#[derive(Copy, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub subsystem: &'static str,
    text: [u8; LOG_LINE_MAX],
    len: usize,
}

impl LogLine {
    const fn empty() -> Self {
        Self { level: LogLevel::Info, subsystem: "", text: [0; LOG_LINE_MAX], len: 0 }
    }

    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.text[..self.len]).unwrap_or("<invalid utf-8>")
    }
}

// Truncating formatter; a full line is not an error.
impl Write for LogLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.len == LOG_LINE_MAX {
                break;
            }
            self.text[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

pub struct LogRing {
    lines: [LogLine; LOG_RING_SIZE],
    next: usize,
    filled: usize,
}

impl LogRing {
    pub const fn new() -> Self {
        Self { lines: [LogLine::empty(); LOG_RING_SIZE], next: 0, filled: 0 }
    }

    pub fn push(&mut self, level: LogLevel, subsystem: &'static str, args: fmt::Arguments) {
        let mut line = LogLine::empty();
        line.level = level;
        line.subsystem = subsystem;
        let _ = line.write_fmt(args);
        self.lines[self.next] = line;
        self.next = (self.next + 1) % LOG_RING_SIZE;
        self.filled = core::cmp::min(self.filled + 1, LOG_RING_SIZE);
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        let start = (self.next + LOG_RING_SIZE - self.filled) % LOG_RING_SIZE;
        (0..self.filled).map(move |i| &self.lines[(start + i) % LOG_RING_SIZE])
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref RECENT: Mutex<LogRing> = Mutex::new(LogRing::new());
}

/// Calls `f` with every remembered line, oldest first.
pub fn for_each_recent(mut f: impl FnMut(&LogLine)) {
    // try_lock: the panic path may run while a record is half written
    if let Some(ring) = RECENT.try_lock() {
        ring.iter().for_each(|line| f(line));
    }
}

// ---- Sink ----

#[doc(hidden)]
pub fn write_record(level: LogLevel, subsystem: &'static str, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    if let Some(mut ring) = RECENT.try_lock() {
        ring.push(level, subsystem, args);
    }
    sink(format_args!("[{} {}] {}\n", level.as_str(), subsystem, args));
}

#[cfg(test)]
fn sink(args: fmt::Arguments) {
    std::eprint!("{}", args);
}

#[cfg(all(not(test), feature = "kernel-image"))]
fn sink(args: fmt::Arguments) {
    serial::print(args);
}

#[cfg(all(not(test), not(feature = "kernel-image")))]
fn sink(_args: fmt::Arguments) {}

#[cfg(feature = "kernel-image")]
pub mod serial {
    use core::fmt::Write;

    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut port = unsafe { SerialPort::new(0x3F8) };
            port.init();
            Mutex::new(port)
        };
    }

    pub fn print(args: core::fmt::Arguments) {
        // serial output must not race an interrupt handler holding the port
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = SERIAL1.lock().write_fmt(args);
        });
    }
}

#[cfg(feature = "kernel-image")]
#[macro_export]
macro_rules! sprint {
    ($($arg:tt)*) => ($crate::log::serial::print(format_args!($($arg)*)));
}

#[cfg(feature = "kernel-image")]
#[macro_export]
macro_rules! sprintln {
    () => ($crate::sprint!("\n"));
    ($($arg:tt)*) => ($crate::sprint!("{}\n", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $subsys:expr, $($arg:tt)*) => {
        $crate::log::write_record($level, $subsys, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($subsys:expr, $($arg:tt)*) => ($crate::klog!($crate::log::LogLevel::Trace, $subsys, $($arg)*));
}

#[macro_export]
macro_rules! klog_debug {
    ($subsys:expr, $($arg:tt)*) => ($crate::klog!($crate::log::LogLevel::Debug, $subsys, $($arg)*));
}

#[macro_export]
macro_rules! klog_info {
    ($subsys:expr, $($arg:tt)*) => ($crate::klog!($crate::log::LogLevel::Info, $subsys, $($arg)*));
}

#[macro_export]
macro_rules! klog_warn {
    ($subsys:expr, $($arg:tt)*) => ($crate::klog!($crate::log::LogLevel::Warn, $subsys, $($arg)*));
}

#[macro_export]
macro_rules! klog_error {
    ($subsys:expr, $($arg:tt)*) => ($crate::klog!($crate::log::LogLevel::Error, $subsys, $($arg)*));
}
