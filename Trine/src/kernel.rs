// kernel.rs
//! The process core.
//!
//! `Kernel` owns every piece of global state: the process table, the three
//! terminals, the address space, the devices and the filesystem. Process-scoped
//! calls name the calling pid explicitly. Control transfers (entering ring 3,
//! resuming a parent, swapping kernel stacks between terminals) are described by
//! the values returned here and carried out by a `syscall::Cpu`.

use x86_64::{PhysAddr, VirtAddr};

use crate::error::{Exception, KResult, KernelError};
use crate::fd::{Io, OpenFile};
use crate::fs::{FileSystem, FileType};
use crate::kb::KeyboardDecoder;
use crate::layout::{
    kernel_stack_top, load_phys, process_frame, ENTRY_POINT_OFFSET, EXEC_MAGIC, FIRST_USER_FD, MAX_FILES,
    MAX_IMAGE_SIZE, PROGRAM_LOAD_ADDR, ROOT_PROGRAM, USER_REGION_BASE, USER_REGION_END, USER_STACK_TOP,
    VIDMAP_ADDR,
};
use crate::machine::{Event, Machine};
use crate::paging::AddressSpace;
use crate::process::{Command, ExitStatus, HaltOutcome, KernelContext, Launch, Pcb, Pid, ProcessTable};
use crate::rtc::Rtc;
use crate::terminal::{Terminal, TerminalId, TerminalManager};

/// A change of foreground terminal that moves the CPU to another process tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalSwitch {
    /// Both terminals already had processes; park `from`'s, resume `to`'s.
    Swapped { from: TerminalId, to: TerminalId },
    /// `to` was dormant and got a fresh shell; park `from`'s process and enter it.
    Launched { from: TerminalId, launch: Launch },
}

pub struct Kernel<M: Machine> {
    machine: M,
    fs: FileSystem,
    procs: ProcessTable,
    terminals: TerminalManager,
    space: AddressSpace,
    rtc: Rtc,
    keyboard: KeyboardDecoder,
    current: Option<Pid>,
    last_status: Option<ExitStatus>,
}

fn display_name(name: &[u8]) -> &str {
    core::str::from_utf8(name).unwrap_or("<binary>")
}

impl<M: Machine> Kernel<M> {
    pub fn new(machine: M, fs: FileSystem) -> Self {
        Self {
            machine,
            fs,
            procs: ProcessTable::new(),
            terminals: TerminalManager::new(),
            space: AddressSpace::new(),
            rtc: Rtc::new(),
            keyboard: KeyboardDecoder::new(),
            current: None,
            last_status: None,
        }
    }

    /// Clears the screens and launches the first shell on terminal 0.
    pub fn boot(&mut self) -> KResult<Launch> {
        self.terminals.init(&mut self.machine);
        self.rtc.open(&mut self.machine)?;
        let first = self.terminals.foreground();
        klog_info!("proc", "booting {} into tty{}", display_name(ROOT_PROGRAM), first.index());
        self.spawn_root(first)
    }

    // ---- Accessors ----

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// Process owning the CPU.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn foreground(&self) -> TerminalId {
        self.terminals.foreground()
    }

    pub fn terminal(&self, id: TerminalId) -> &Terminal {
        self.terminals.get(id)
    }

    pub fn process(&self, pid: Pid) -> KResult<&Pcb> {
        self.procs.get(pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Pcb> {
        self.procs.live()
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    /// Status of the most recent halt.
    pub fn last_status(&self) -> Option<ExitStatus> {
        self.last_status
    }

    pub fn descriptor(&self, pid: Pid, fd: usize) -> KResult<OpenFile> {
        self.procs.get(pid)?.files.get(fd).copied()
    }

    pub fn parent_context_mut(&mut self, pid: Pid) -> KResult<&mut KernelContext> {
        Ok(&mut self.procs.get_mut(pid)?.parent_context)
    }

    pub fn switch_context_mut(&mut self, pid: Pid) -> KResult<&mut KernelContext> {
        Ok(&mut self.procs.get_mut(pid)?.switch_context)
    }

    // ---- execute / halt ----

    /// Loads `command` as a child of `caller`, on the caller's terminal.
    pub fn execute(&mut self, caller: Pid, command: &[u8]) -> KResult<Launch> {
        let terminal = self.procs.get(caller)?.terminal;
        self.spawn(command, Some(caller), terminal)
    }

    /// Starts a shell that is its own parent on `terminal`.
    pub fn spawn_root(&mut self, terminal: TerminalId) -> KResult<Launch> {
        self.spawn(ROOT_PROGRAM, None, terminal)
    }

    fn spawn(&mut self, command: &[u8], caller: Option<Pid>, terminal: TerminalId) -> KResult<Launch> {
        let cmd = Command::parse(command)?;
        let dentry = self.fs.resolve_by_name(cmd.name)?;
        if dentry.file_type != FileType::Regular {
            return Err(KernelError::NotExecutable);
        }
        let entry = self.check_executable(dentry.inode)?;

        // nothing has changed up to here
        let pid = self.procs.claim().ok_or_else(|| {
            klog_warn!("proc", "no free process id for `{}`", display_name(cmd.name));
            KernelError::ProcessLimit
        })?;
        let parent = caller.unwrap_or(pid);
        let pcb = match Pcb::new(pid, parent, terminal, cmd.args) {
            Ok(pcb) => pcb,
            Err(e) => {
                self.procs.abandon(pid);
                return Err(e);
            }
        };
        if let Err(e) = self.load(pid, dentry.inode) {
            self.procs.abandon(pid);
            return Err(e);
        }
        self.procs.insert(pcb);
        self.terminals.set_active(terminal, Some(pid));
        if let Err(e) = self.activate(pid) {
            // unwind so the caller keeps running in its own frame
            self.procs.remove(pid);
            self.terminals.set_active(terminal, caller);
            if let Some(caller) = caller {
                self.activate(caller)?;
            }
            return Err(e);
        }
        klog_info!(
            "proc",
            "pid {} `{}` parent {} tty{}",
            pid,
            display_name(cmd.name),
            parent,
            terminal.index()
        );
        Ok(Launch {
            pid,
            parent,
            terminal,
            entry,
            user_stack: VirtAddr::new_truncate(USER_STACK_TOP),
            kernel_stack: kernel_stack_top(pid),
        })
    }

    /// Validates the header and returns the entry point.
    fn check_executable(&self, inode: u32) -> KResult<VirtAddr> {
        let mut header = [0u8; ENTRY_POINT_OFFSET as usize + 4];
        let n = self.fs.read_bytes(inode, 0, &mut header)?;
        if n < header.len() || header[..4] != EXEC_MAGIC {
            return Err(KernelError::NotExecutable);
        }
        if u64::from(self.fs.file_size(inode)?) > MAX_IMAGE_SIZE {
            klog_warn!("proc", "inode {} does not fit the user region", inode);
            return Err(KernelError::NotExecutable);
        }
        let at = ENTRY_POINT_OFFSET as usize;
        let entry = u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        Ok(VirtAddr::new_truncate(u64::from(entry)))
    }

    /// Copies the program image into `pid`'s frame at the load address.
    fn load(&mut self, pid: Pid, inode: u32) -> KResult<()> {
        let mut chunk = [0u8; 1024];
        let mut offset = 0u32;
        loop {
            let n = self.fs.read_bytes(inode, offset, &mut chunk)?;
            if n == 0 {
                break;
            }
            self.machine.write_phys(load_phys(pid) + u64::from(offset), &chunk[..n]);
            offset += n as u32;
        }
        klog_debug!("proc", "pid {}: {} bytes at {:#x}", pid, offset, PROGRAM_LOAD_ADDR);
        Ok(())
    }

    /// Makes `pid` the process the CPU runs: its frame, its video alias, its
    /// kernel stack.
    fn activate(&mut self, pid: Pid) -> KResult<()> {
        let pcb = self.procs.get(pid)?;
        let (vidmapped, terminal) = (pcb.vidmapped, pcb.terminal);
        self.space
            .remap_region(&mut self.machine, VirtAddr::new_truncate(USER_REGION_BASE), process_frame(pid))?;
        let alias = VirtAddr::new_truncate(VIDMAP_ADDR);
        if vidmapped {
            let page = self.terminals.video_page(terminal);
            self.space.map_page(&mut self.machine, alias, page)?;
        } else {
            self.space.unmap_page(&mut self.machine, alias);
        }
        self.space.flush(&mut self.machine);
        self.machine.set_kernel_stack(kernel_stack_top(pid));
        self.current = Some(pid);
        Ok(())
    }

    pub fn halt(&mut self, pid: Pid, status: u8) -> KResult<HaltOutcome> {
        self.finish(pid, ExitStatus::Exited(status))
    }

    /// Tears down a process that raised a CPU exception.
    pub fn fault(&mut self, pid: Pid, exception: Exception) -> KResult<HaltOutcome> {
        let terminal = self.procs.get(pid)?.terminal;
        self.terminals
            .write_fmt(&mut self.machine, terminal, format_args!("\n{} exception\n", exception));
        klog_warn!("proc", "pid {} killed by {}", pid, exception);
        self.finish(pid, ExitStatus::Exception)
    }

    fn finish(&mut self, pid: Pid, status: ExitStatus) -> KResult<HaltOutcome> {
        let terminal = self.procs.get(pid)?.terminal;
        if self.terminals.get(terminal).active() != Some(pid) {
            // a parent cannot halt underneath its running child
            return Err(KernelError::InvalidArgument);
        }
        let pcb = self.procs.remove(pid).ok_or(KernelError::NoSuchProcess)?;
        self.last_status = Some(status);
        for (fd, file) in pcb.files.open_descriptors() {
            if let Err(e) = file.close() {
                klog_trace!("fd", "pid {} fd {}: {}, freed anyway", pid, fd, e);
            }
        }
        klog_info!("proc", "pid {} exited with {}", pid, status.code());

        if pcb.is_root() {
            self.terminals.set_active(terminal, None);
            self.current = None;
            let launch = self.spawn_root(terminal).map_err(|e| {
                klog_error!("proc", "tty{} left without a shell: {}", terminal.index(), e);
                e
            })?;
            return Ok(HaltOutcome::Respawned(launch));
        }
        self.terminals.set_active(terminal, Some(pcb.parent));
        self.activate(pcb.parent)?;
        Ok(HaltOutcome::Resume { parent: pcb.parent, context: pcb.parent_context, status })
    }

    // ---- File descriptors ----

    pub fn open(&mut self, pid: Pid, name: &[u8]) -> KResult<usize> {
        if name.is_empty() {
            return Err(KernelError::NotFound);
        }
        let dentry = self.fs.resolve_by_name(name)?;
        let fd = self.procs.get(pid)?.files.first_free()?;
        let file = OpenFile::open(&dentry, &mut self.machine, &mut self.rtc)?;
        self.procs.get_mut(pid)?.files.install(fd, file);
        klog_debug!("fd", "pid {} opened `{}` as fd {}", pid, display_name(name), fd);
        Ok(fd)
    }

    pub fn close(&mut self, pid: Pid, fd: usize) -> KResult<()> {
        if !(FIRST_USER_FD..MAX_FILES).contains(&fd) {
            return Err(KernelError::InvalidDescriptor);
        }
        let files = &mut self.procs.get_mut(pid)?.files;
        files.get(fd)?.close()?;
        files.release(fd);
        Ok(())
    }

    pub fn read(&mut self, pid: Pid, fd: usize, buf: &mut [u8]) -> KResult<usize> {
        let pcb = self.procs.get_mut(pid)?;
        let terminal = pcb.terminal;
        let file = pcb.files.get_mut(fd)?;
        let mut io = Io {
            machine: &mut self.machine,
            fs: &self.fs,
            rtc: &mut self.rtc,
            terminals: &mut self.terminals,
            terminal,
        };
        file.read(&mut io, buf)
    }

    pub fn write(&mut self, pid: Pid, fd: usize, buf: &[u8]) -> KResult<usize> {
        let pcb = self.procs.get_mut(pid)?;
        let terminal = pcb.terminal;
        let file = pcb.files.get_mut(fd)?;
        let mut io = Io {
            machine: &mut self.machine,
            fs: &self.fs,
            rtc: &mut self.rtc,
            terminals: &mut self.terminals,
            terminal,
        };
        file.write(&mut io, buf)
    }

    /// Copies the argument string and a NUL terminator into `buf`. Fails with
    /// `ArgumentsTooLong`, copying nothing, when both do not fit.
    pub fn getargs(&self, pid: Pid, buf: &mut [u8]) -> KResult<usize> {
        let args = self.procs.get(pid)?.args();
        if args.len() + 1 > buf.len() {
            return Err(KernelError::ArgumentsTooLong);
        }
        buf[..args.len()].copy_from_slice(args);
        buf[args.len()] = 0;
        Ok(0)
    }

    /// Maps the text screen into `pid`'s address space. `out` is the user
    /// address the result will be stored at.
    pub fn vidmap(&mut self, pid: Pid, out: u64) -> KResult<VirtAddr> {
        if out == 0 || out == USER_REGION_BASE || !(USER_REGION_BASE..USER_REGION_END).contains(&out) {
            return Err(KernelError::BadAddress);
        }
        let pcb = self.procs.get_mut(pid)?;
        pcb.vidmapped = true;
        let terminal = pcb.terminal;
        let alias = VirtAddr::new_truncate(VIDMAP_ADDR);
        if self.current == Some(pid) {
            let page = self.terminals.video_page(terminal);
            self.space.map_page(&mut self.machine, alias, page)?;
            self.space.flush(&mut self.machine);
        }
        Ok(alias)
    }

    // ---- User memory ----

    fn user_phys(&self, addr: u64, len: usize) -> KResult<PhysAddr> {
        let end = addr.checked_add(len as u64).ok_or(KernelError::BadAddress)?;
        if addr == 0 || addr < USER_REGION_BASE || end > USER_REGION_END {
            return Err(KernelError::BadAddress);
        }
        self.space.translate(VirtAddr::new_truncate(addr)).ok_or(KernelError::BadAddress)
    }

    pub fn check_user_range(&self, addr: u64, len: usize) -> KResult<()> {
        self.user_phys(addr, len).map(|_| ())
    }

    /// Reads the current process's memory.
    pub fn copy_from_user(&self, addr: u64, out: &mut [u8]) -> KResult<()> {
        let phys = self.user_phys(addr, out.len())?;
        self.machine.read_phys(phys, out);
        Ok(())
    }

    /// Writes the current process's memory.
    pub fn copy_to_user(&mut self, addr: u64, data: &[u8]) -> KResult<()> {
        let phys = self.user_phys(addr, data.len())?;
        self.machine.write_phys(phys, data);
        Ok(())
    }

    /// Reads a NUL-terminated string into `out` and returns its length, or
    /// `out.len()` when no terminator fits.
    pub fn copy_str_from_user(&self, addr: u64, out: &mut [u8]) -> KResult<usize> {
        if addr == 0 {
            return Err(KernelError::BadAddress);
        }
        let room = USER_REGION_END.saturating_sub(addr) as usize;
        let len = core::cmp::min(out.len(), room);
        self.copy_from_user(addr, &mut out[..len])?;
        match out[..len].iter().position(|&b| b == 0) {
            Some(n) => Ok(n),
            // runs off the end of the user region
            None if len < out.len() => Err(KernelError::BadAddress),
            None => Ok(len),
        }
    }

    // ---- Interrupt events and terminals ----

    /// Applies one latched interrupt. Returns a terminal switch the CPU must perform.
    pub fn handle_event(&mut self, event: Event) -> Option<TerminalSwitch> {
        match event {
            Event::RtcTick => {
                self.rtc.tick();
                None
            }
            Event::Scancode(sc) => {
                let action = self.keyboard.feed(sc)?;
                let target = self.terminals.handle_key(&mut self.machine, action)?;
                match self.switch_terminal(target) {
                    Ok(switch) => switch,
                    Err(e) => {
                        klog_warn!("term", "cannot switch to tty{}: {}", target.index(), e);
                        None
                    }
                }
            }
        }
    }

    /// Brings `target` to the front, launching a shell there if it has none.
    pub fn switch_terminal(&mut self, target: TerminalId) -> KResult<Option<TerminalSwitch>> {
        let from = self.terminals.foreground();
        if target == from {
            return Ok(None);
        }
        self.terminals.swap(&mut self.machine, target);
        if let Some(pid) = self.terminals.get(target).active() {
            self.activate(pid)?;
            return Ok(Some(TerminalSwitch::Swapped { from, to: target }));
        }
        match self.spawn_root(target) {
            Ok(launch) => Ok(Some(TerminalSwitch::Launched { from, launch })),
            Err(e) => {
                self.terminals.swap(&mut self.machine, from);
                Err(e)
            }
        }
    }
}
