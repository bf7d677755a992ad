// testing.rs
//! Hosted stand-ins for the hardware: a simulated machine, a CPU that runs
//! user programs as Rust functions, and filesystem images built in memory.

use std::boxed::Box;
use std::collections::{BTreeMap, VecDeque};
use std::string::String;
use std::vec::Vec;

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::{Exception, KResult};
use crate::fs::{FileSystem, ImageBuilder, BLOCK_SIZE};
use crate::kernel::{Kernel, TerminalSwitch};
use crate::layout::{ENTRY_POINT_OFFSET, EXEC_MAGIC, PAGE_SIZE, SCREEN_COLS, SCREEN_ROWS};
use crate::machine::{Event, Machine, PageSize};
use crate::process::{ExitStatus, HaltOutcome, Launch, Pid};
use crate::syscall::{self, Cpu};

/// Sparse physical memory plus a record of everything programmed into the
/// platform.
#[derive(Default)]
pub struct SimMachine {
    pages: BTreeMap<u64, Box<[u8]>>,
    mappings: BTreeMap<u64, (PhysAddr, PageSize, PageTableFlags)>,
    kernel_stack: Option<VirtAddr>,
    cursor: (usize, usize),
    rtc_rate: Option<u8>,
    events: VecDeque<Event>,
    flushes: usize,
    idle_calls: usize,
}

impl SimMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn page_mut(&mut self, frame: u64) -> &mut [u8] {
        self.pages
            .entry(frame)
            .or_insert_with(|| std::vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
    }

    pub fn mapping_of(&self, virt: VirtAddr) -> Option<(PhysAddr, PageSize)> {
        self.mappings.get(&virt.as_u64()).map(|&(phys, size, _)| (phys, size))
    }

    pub fn kernel_stack(&self) -> Option<VirtAddr> {
        self.kernel_stack
    }

    pub fn cursor(&self) -> (usize, usize) {
        self.cursor
    }

    pub fn rtc_rate(&self) -> Option<u8> {
        self.rtc_rate
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn idle_calls(&self) -> usize {
        self.idle_calls
    }

    pub fn queue_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn queue_scancodes(&mut self, codes: &[u8]) {
        self.events.extend(codes.iter().map(|&sc| Event::Scancode(sc)));
    }

    pub fn snapshot(&self, base: PhysAddr, len: usize) -> Vec<u8> {
        let mut out = std::vec![0u8; len];
        self.read_phys(base, &mut out);
        out
    }

    /// Characters of one row of the text page at `base`.
    pub fn screen_row(&self, base: PhysAddr, row: usize) -> String {
        let cells = self.snapshot(base + (row * SCREEN_COLS * 2) as u64, SCREEN_COLS * 2);
        cells
            .chunks_exact(2)
            .map(|cell| if cell[0] == 0 { ' ' } else { cell[0] as char })
            .collect()
    }

    pub fn screen_text(&self, base: PhysAddr) -> String {
        let rows: Vec<String> = (0..SCREEN_ROWS).map(|row| self.screen_row(base, row)).collect();
        rows.join("\n")
    }
}

impl Machine for SimMachine {
    fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr.as_u64() + i as u64;
            let (frame, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            *byte = self.pages.get(&frame).map_or(0, |page| page[offset]);
        }
    }

    fn write_phys(&mut self, addr: PhysAddr, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = addr.as_u64() + i as u64;
            let (frame, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            self.page_mut(frame)[offset] = byte;
        }
    }

    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, size: PageSize, flags: PageTableFlags) {
        self.mappings.insert(virt.as_u64(), (phys, size, flags));
    }

    fn unmap(&mut self, virt: VirtAddr, _size: PageSize) {
        self.mappings.remove(&virt.as_u64());
    }

    fn flush_tlb(&mut self) {
        self.flushes += 1;
    }

    fn set_kernel_stack(&mut self, top: VirtAddr) {
        self.kernel_stack = Some(top);
    }

    fn set_cursor(&mut self, row: usize, col: usize) {
        self.cursor = (row, col);
    }

    fn set_rtc_rate(&mut self, rate: u8) {
        self.rtc_rate = Some(rate);
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn wait_for_interrupt(&mut self) -> bool {
        self.idle_calls += 1;
        !self.events.is_empty()
    }
}

/// How a simulated user program leaves ring 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserExit {
    Halt(u8),
    Fault(Exception),
}

pub type Program = fn(&mut Kernel<SimMachine>, &mut SimCpu, Pid) -> UserExit;

/// Runs programs synchronously on the caller's stack. Terminal switches are
/// recorded, not carried out.
#[derive(Default)]
pub struct SimCpu {
    programs: BTreeMap<u64, Program>,
    entered: Vec<Launch>,
    switches: Vec<TerminalSwitch>,
}

impl SimCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard_programs() -> Self {
        let mut cpu = Self::new();
        cpu.register("shell", shell);
        cpu.register("hello", hello);
        cpu.register("counter", counter);
        cpu.register("fish", fish);
        cpu
    }

    pub fn register(&mut self, name: &str, program: Program) {
        self.programs.insert(entry_of(name), program);
    }

    pub fn entered(&self) -> &[Launch] {
        &self.entered
    }

    pub fn switches(&self) -> &[TerminalSwitch] {
        &self.switches
    }
}

impl Cpu<SimMachine> for SimCpu {
    fn enter_user(&mut self, kernel: &mut Kernel<SimMachine>, launch: Launch) -> ExitStatus {
        self.entered.push(launch);
        let exit = match self.programs.get(&launch.entry.as_u64()).copied() {
            Some(program) => program(kernel, self, launch.pid),
            None => UserExit::Fault(Exception::InvalidOpcode),
        };
        let outcome = match exit {
            UserExit::Halt(status) => kernel.halt(launch.pid, status),
            UserExit::Fault(exception) => kernel.fault(launch.pid, exception),
        };
        match outcome {
            Ok(HaltOutcome::Resume { status, .. }) => status,
            Ok(HaltOutcome::Respawned(_)) => kernel.last_status().unwrap_or(ExitStatus::Exception),
            Err(e) => panic!("pid {} could not halt: {}", launch.pid, e),
        }
    }

    fn switch_terminal(&mut self, _kernel: &mut Kernel<SimMachine>, switch: TerminalSwitch) {
        self.switches.push(switch);
    }
}

fn shell(_: &mut Kernel<SimMachine>, _: &mut SimCpu, _: Pid) -> UserExit {
    UserExit::Halt(0)
}

/// Echoes its arguments; exits with them if they are a number, else 3.
fn hello(kernel: &mut Kernel<SimMachine>, _: &mut SimCpu, pid: Pid) -> UserExit {
    let mut args = [0u8; 129];
    if kernel.getargs(pid, &mut args).is_err() {
        return UserExit::Halt(1);
    }
    let len = args.iter().position(|&b| b == 0).unwrap_or(0);
    let _ = kernel.write(pid, 1, b"hello ");
    let _ = kernel.write(pid, 1, &args[..len]);
    let _ = kernel.write(pid, 1, b"\n");
    let status = core::str::from_utf8(&args[..len]).ok().and_then(|s| s.parse().ok());
    UserExit::Halt(status.unwrap_or(3))
}

/// Runs `hello` and exits with its status plus one.
fn counter(kernel: &mut Kernel<SimMachine>, cpu: &mut SimCpu, pid: Pid) -> UserExit {
    match syscall::execute(kernel, cpu, pid, b"hello x") {
        Ok(status) => UserExit::Halt((status.code() + 1) as u8),
        Err(_) => UserExit::Halt(0),
    }
}

fn fish(_: &mut Kernel<SimMachine>, _: &mut SimCpu, _: Pid) -> UserExit {
    UserExit::Fault(Exception::PageFault)
}

const PROGRAMS: [(&str, u64); 4] = [
    ("shell", 0x0804_8100),
    ("hello", 0x0804_8200),
    ("counter", 0x0804_8300),
    ("fish", 0x0804_8400),
];

pub fn entry_of(name: &str) -> u64 {
    PROGRAMS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, entry)| entry)
        .unwrap_or_else(|| panic!("no program named {}", name))
}

/// An executable image of `size` bytes starting at `entry`.
pub fn program_image(entry: u64, size: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..size).map(|i| (i % 199) as u8).collect();
    image[..4].copy_from_slice(&EXEC_MAGIC);
    let at = ENTRY_POINT_OFFSET as usize;
    image[at..at + 4].copy_from_slice(&(entry as u32).to_le_bytes());
    image
}

pub const FRAME0: &[u8] = b"<\"(\n  /\\_/\\\n ( o.o )\n  > ^ <\n";

/// Builds an image with `fill` and leaks it for the life of the test.
pub fn leak_image<F>(fill: F) -> FileSystem
where
    F: FnOnce(&mut ImageBuilder<'_>) -> KResult<()>,
{
    let mut raw = std::vec![0u8; 64 * BLOCK_SIZE];
    let mut builder = ImageBuilder::new(&mut raw, 16).expect("image buffer too small");
    fill(&mut builder).expect("image does not fit");
    let len = builder.finish();
    raw.truncate(len);
    FileSystem::new(Box::leak(raw.into_boxed_slice())).expect("built image is valid")
}

pub fn standard_fs() -> FileSystem {
    leak_image(|b| {
        b.add_directory(b".")?;
        b.add_device(b"rtc")?;
        b.add_file(b"shell", &program_image(entry_of("shell"), 300))?;
        b.add_file(b"hello", &program_image(entry_of("hello"), 200))?;
        b.add_file(b"frame0.txt", FRAME0)?;
        b.add_file(b"counter", &program_image(entry_of("counter"), 1500))?;
        b.add_file(b"fish", &program_image(entry_of("fish"), 120))?;
        Ok(())
    })
}

pub fn boot_kernel(fs: FileSystem) -> (Kernel<SimMachine>, Launch) {
    let mut kernel = Kernel::new(SimMachine::new(), fs);
    let launch = kernel.boot().expect("boot");
    (kernel, launch)
}

/// Scancode set 1.
pub mod scancodes {
    use std::vec::Vec;

    pub const BREAK: u8 = 0x80;
    pub const LSHIFT: u8 = 0x2A;
    pub const CTRL: u8 = 0x1D;
    pub const ALT: u8 = 0x38;
    pub const F1: u8 = 0x3B;
    pub const BACKSPACE: u8 = 0x0E;
    pub const TAB: u8 = 0x0F;
    pub const ENTER: u8 = 0x1C;

    const LETTERS: [u8; 26] = [
        0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x23, 0x17, 0x24, 0x25, 0x26, 0x32, 0x31, 0x18, 0x19, 0x10, 0x13,
        0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C,
    ];

    fn make_code(c: char) -> u8 {
        match c {
            'a'..='z' => LETTERS[c as usize - 'a' as usize],
            '1'..='9' => 0x02 + (c as u8 - b'1'),
            '0' => 0x0B,
            '-' => 0x0C,
            '.' => 0x34,
            ' ' => 0x39,
            '\n' => ENTER,
            other => panic!("no scancode for {:?}", other),
        }
    }

    fn press(code: u8, out: &mut Vec<u8>) {
        out.push(code);
        out.push(code | BREAK);
    }

    /// Key presses that type `text`, with shift around upper-case letters.
    pub fn typed(text: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for c in text.chars() {
            if c.is_ascii_uppercase() {
                out.push(LSHIFT);
                press(make_code(c.to_ascii_lowercase()), &mut out);
                out.push(LSHIFT | BREAK);
            } else {
                press(make_code(c), &mut out);
            }
        }
        out
    }

    /// Alt+F`n`.
    pub fn alt_f(n: u8) -> Vec<u8> {
        let mut out = std::vec![ALT];
        press(F1 + n - 1, &mut out);
        out.push(ALT | BREAK);
        out
    }

    pub fn ctrl(c: char) -> Vec<u8> {
        let mut out = std::vec![CTRL];
        press(make_code(c), &mut out);
        out.push(CTRL | BREAK);
        out
    }
}
