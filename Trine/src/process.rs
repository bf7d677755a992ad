// process.rs
//! Process control blocks and the process-id registry.

use core::fmt;

use x86_64::VirtAddr;

use crate::error::{KResult, KernelError};
use crate::fd::FdTable;
use crate::fs::NAME_LEN;
use crate::layout::{ARGS_CAPACITY, MAX_PROCESSES};
use crate::terminal::TerminalId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u8);

impl Pid {
    pub const fn new(raw: usize) -> Option<Self> {
        if raw < MAX_PROCESSES {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Occupancy of the fixed process-id slots.
pub struct PidRegistry {
    used: [bool; MAX_PROCESSES],
}

impl PidRegistry {
    pub const fn new() -> Self {
        Self { used: [false; MAX_PROCESSES] }
    }

    /// Claims the lowest free id.
    pub fn claim(&mut self) -> Option<Pid> {
        let index = self.used.iter().position(|used| !used)?;
        self.used[index] = true;
        Pid::new(index)
    }

    pub fn release(&mut self, pid: Pid) -> bool {
        core::mem::replace(&mut self.used[pid.index()], false)
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        self.used[pid.index()]
    }

    pub fn live_count(&self) -> usize {
        self.used.iter().filter(|used| **used).count()
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Kernel stack position saved when a process leaves its kernel stack,
/// either to run a child or because its terminal went to the background.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelContext {
    pub stack_pointer: u64,
    pub base_pointer: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(u8),
    /// Killed by a CPU exception.
    Exception,
}

impl ExitStatus {
    pub const EXCEPTION_CODE: u32 = 256;

    /// Value returned by the parent's `execute`.
    pub const fn code(self) -> u32 {
        match self {
            ExitStatus::Exited(status) => status as u32,
            ExitStatus::Exception => Self::EXCEPTION_CODE,
        }
    }

    pub const fn from_code(code: u64) -> Self {
        if code > u8::MAX as u64 {
            ExitStatus::Exception
        } else {
            ExitStatus::Exited(code as u8)
        }
    }
}

pub struct Pcb {
    pub pid: Pid,
    pub parent: Pid,
    pub terminal: TerminalId,
    pub files: FdTable,
    args: [u8; ARGS_CAPACITY],
    args_len: usize,
    /// Where `execute` resumes when this process halts.
    pub parent_context: KernelContext,
    /// Where this process resumes when its terminal comes back to the front.
    pub switch_context: KernelContext,
    pub vidmapped: bool,
}

impl Pcb {
    pub fn new(pid: Pid, parent: Pid, terminal: TerminalId, args: &[u8]) -> KResult<Self> {
        if args.len() > ARGS_CAPACITY {
            return Err(KernelError::ArgumentsTooLong);
        }
        let mut stored = [0u8; ARGS_CAPACITY];
        stored[..args.len()].copy_from_slice(args);
        Ok(Self {
            pid,
            parent,
            terminal,
            files: FdTable::with_std_streams(),
            args: stored,
            args_len: args.len(),
            parent_context: KernelContext::default(),
            switch_context: KernelContext::default(),
            vidmapped: false,
        })
    }

    /// Roots are their own parent.
    pub fn is_root(&self) -> bool {
        self.parent == self.pid
    }

    pub fn args(&self) -> &[u8] {
        &self.args[..self.args_len]
    }
}

/// PCBs indexed by pid. A pcb exists exactly while its id is claimed.
pub struct ProcessTable {
    registry: PidRegistry,
    pcbs: [Option<Pcb>; MAX_PROCESSES],
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { registry: PidRegistry::new(), pcbs: core::array::from_fn(|_| None) }
    }

    pub fn claim(&mut self) -> Option<Pid> {
        self.registry.claim()
    }

    /// Gives back an id that never received a pcb.
    pub fn abandon(&mut self, pid: Pid) {
        if self.pcbs[pid.index()].is_none() {
            self.registry.release(pid);
        }
    }

    pub fn insert(&mut self, pcb: Pcb) {
        debug_assert!(self.registry.is_live(pcb.pid));
        let index = pcb.pid.index();
        self.pcbs[index] = Some(pcb);
    }

    /// Releases the id and hands back the pcb.
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        let pcb = self.pcbs[pid.index()].take()?;
        self.registry.release(pid);
        Some(pcb)
    }

    pub fn get(&self, pid: Pid) -> KResult<&Pcb> {
        self.pcbs[pid.index()].as_ref().ok_or(KernelError::NoSuchProcess)
    }

    pub fn get_mut(&mut self, pid: Pid) -> KResult<&mut Pcb> {
        self.pcbs[pid.index()].as_mut().ok_or(KernelError::NoSuchProcess)
    }

    pub fn live(&self) -> impl Iterator<Item = &Pcb> {
        self.pcbs.iter().flatten()
    }

    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        self.registry.is_live(pid)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A command line split into program name and argument string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command<'a> {
    pub name: &'a [u8],
    pub args: &'a [u8],
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a [u8]) -> KResult<Self> {
        let line = match line.iter().position(|&b| b == 0) {
            Some(end) => &line[..end],
            None => line,
        };
        let start = line.iter().position(|&b| b != b' ').unwrap_or(line.len());
        let line = &line[start..];
        let name_end = line.iter().position(|&b| b == b' ' || b == b'\n').unwrap_or(line.len());
        let name = &line[..name_end];
        if name.is_empty() {
            return Err(KernelError::NotFound);
        }
        if name.len() > NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        let mut args = &line[name_end..];
        while let [b' ', rest @ ..] = args {
            args = rest;
        }
        while let [rest @ .., b'\n' | b'\r' | b' '] = args {
            args = rest;
        }
        if args.len() > ARGS_CAPACITY {
            return Err(KernelError::ArgumentsTooLong);
        }
        Ok(Self { name, args })
    }
}

/// Everything the CPU needs to start a freshly loaded program in ring 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Launch {
    pub pid: Pid,
    pub parent: Pid,
    pub terminal: TerminalId,
    pub entry: VirtAddr,
    pub user_stack: VirtAddr,
    pub kernel_stack: VirtAddr,
}

/// How control leaves a halting process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltOutcome {
    /// Return `status` from the parent's `execute`, on the parent's kernel stack.
    Resume { parent: Pid, context: KernelContext, status: ExitStatus },
    /// A terminal root halted and a fresh shell took its place.
    Respawned(Launch),
}
