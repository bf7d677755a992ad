// syscall.rs
//! System-call entry: argument decoding, user-memory copies and blocking.
//!
//! Arguments arrive as raw register values (rax = number, rdi/rsi/rdx). Only
//! the user region is ever read or written on a process's behalf, through the
//! kernel's address space.

use crate::error::{KResult, KernelError};
use crate::fd::OpenFile;
use crate::fs::NAME_LEN;
use crate::kernel::{Kernel, TerminalSwitch};
use crate::layout::{ARGS_CAPACITY, LINE_CAPACITY};
use crate::machine::Machine;
use crate::process::{ExitStatus, HaltOutcome, Launch, Pid};

pub const HALT: u64 = 1;
pub const EXECUTE: u64 = 2;
pub const READ: u64 = 3;
pub const WRITE: u64 = 4;
pub const OPEN: u64 = 5;
pub const CLOSE: u64 = 6;
pub const GETARGS: u64 = 7;
pub const VIDMAP: u64 = 8;
pub const SET_HANDLER: u64 = 9;
pub const SIGRETURN: u64 = 10;

const BOUNCE_SIZE: usize = 512;

/// Control transfers the kernel core cannot express as plain calls.
pub trait Cpu<M: Machine> {
    /// Runs `launch` in ring 3 and returns once that process halts.
    fn enter_user(&mut self, kernel: &mut Kernel<M>, launch: Launch) -> ExitStatus;

    /// Parks the process of the terminal being left and continues with the
    /// new foreground's process. Returns when the parked process is resumed.
    fn switch_terminal(&mut self, kernel: &mut Kernel<M>, switch: TerminalSwitch);
}

/// What the trap handler does after a system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Return to the caller with this value in rax.
    Return(i64),
    /// The caller is gone; continue as `HaltOutcome` says.
    Halted(HaltOutcome),
}

pub fn dispatch<M: Machine, C: Cpu<M>>(
    kernel: &mut Kernel<M>,
    cpu: &mut C,
    number: u64,
    a1: u64,
    a2: u64,
    a3: u64,
) -> Completion {
    let Some(pid) = kernel.current() else {
        klog_error!("syscall", "call {} with no current process", number);
        return Completion::Return(-1);
    };
    klog_trace!("syscall", "pid {} call {}({:#x}, {:#x}, {:#x})", pid, number, a1, a2, a3);
    let result = match number {
        HALT => {
            return match kernel.halt(pid, a1 as u8) {
                Ok(outcome) => Completion::Halted(outcome),
                Err(e) => Completion::Return(e.errno()),
            }
        }
        EXECUTE => sys_execute(kernel, cpu, pid, a1),
        READ => sys_read(kernel, cpu, pid, a1 as usize, a2, a3 as usize),
        WRITE => sys_write(kernel, pid, a1 as usize, a2, a3 as usize),
        OPEN => sys_open(kernel, pid, a1),
        CLOSE => kernel.close(pid, a1 as usize).map(|()| 0),
        GETARGS => sys_getargs(kernel, pid, a1, a2 as usize),
        VIDMAP => sys_vidmap(kernel, pid, a1),
        // signals are not delivered
        SET_HANDLER | SIGRETURN => Err(KernelError::Unsupported),
        _ => Err(KernelError::InvalidArgument),
    };
    let value = match result {
        Ok(value) => value as i64,
        Err(e) => {
            klog_debug!("syscall", "pid {} call {} failed: {}", pid, number, e);
            e.errno()
        }
    };
    // input latched during the call takes effect before the caller runs again
    pump(kernel, cpu);
    Completion::Return(value)
}

/// Runs `command` as a child of `caller` and waits for it.
pub fn execute<M: Machine, C: Cpu<M>>(
    kernel: &mut Kernel<M>,
    cpu: &mut C,
    caller: Pid,
    command: &[u8],
) -> KResult<ExitStatus> {
    let launch = kernel.execute(caller, command)?;
    Ok(cpu.enter_user(kernel, launch))
}

/// Handles every latched interrupt. Returns whether there were any.
///
/// Runs at the end of every system call and from interrupts taken in ring 3,
/// so echo and terminal hotkeys do not wait for a blocking read.
pub fn pump<M: Machine, C: Cpu<M>>(kernel: &mut Kernel<M>, cpu: &mut C) -> bool {
    let mut any = false;
    while let Some(event) = kernel.machine_mut().poll_event() {
        any = true;
        if let Some(switch) = kernel.handle_event(event) {
            cpu.switch_terminal(kernel, switch);
        }
    }
    any
}

/// Retries `attempt` until it stops reporting `WouldBlock`, servicing
/// interrupts in between.
pub fn block_on<M, C, F>(kernel: &mut Kernel<M>, cpu: &mut C, mut attempt: F) -> KResult<usize>
where
    M: Machine,
    C: Cpu<M>,
    F: FnMut(&mut Kernel<M>) -> KResult<usize>,
{
    loop {
        match attempt(kernel) {
            Err(KernelError::WouldBlock) => {}
            done => return done,
        }
        if !pump(kernel, cpu) && !kernel.machine_mut().wait_for_interrupt() {
            return Err(KernelError::WouldBlock);
        }
    }
}

/// Blocking read into a kernel buffer.
pub fn read<M: Machine, C: Cpu<M>>(
    kernel: &mut Kernel<M>,
    cpu: &mut C,
    pid: Pid,
    fd: usize,
    buf: &mut [u8],
) -> KResult<usize> {
    block_on(kernel, cpu, |k| k.read(pid, fd, buf))
}

fn sys_execute<M: Machine, C: Cpu<M>>(kernel: &mut Kernel<M>, cpu: &mut C, pid: Pid, command: u64) -> KResult<usize> {
    let mut line = [0u8; LINE_CAPACITY + 1];
    let len = kernel.copy_str_from_user(command, &mut line)?;
    if len > LINE_CAPACITY {
        return Err(KernelError::ArgumentsTooLong);
    }
    let status = execute(kernel, cpu, pid, &line[..len])?;
    Ok(status.code() as usize)
}

fn sys_read<M: Machine, C: Cpu<M>>(
    kernel: &mut Kernel<M>,
    cpu: &mut C,
    pid: Pid,
    fd: usize,
    buf: u64,
    n: usize,
) -> KResult<usize> {
    if buf == 0 {
        return Err(KernelError::BadAddress);
    }
    let file = kernel.descriptor(pid, fd)?;
    kernel.check_user_range(buf, n)?;
    // only plain files can be read in pieces without changing what the caller sees
    let regular = matches!(file, OpenFile::Regular { .. });
    let mut bounce = [0u8; BOUNCE_SIZE];
    let mut total = 0;
    while total < n || n == 0 {
        let chunk = core::cmp::min(n - total, BOUNCE_SIZE);
        let got = read(kernel, cpu, pid, fd, &mut bounce[..chunk])?;
        kernel.copy_to_user(buf + total as u64, &bounce[..got])?;
        total += got;
        if !regular || got < chunk || n == 0 {
            break;
        }
    }
    Ok(total)
}

fn sys_write<M: Machine>(kernel: &mut Kernel<M>, pid: Pid, fd: usize, buf: u64, n: usize) -> KResult<usize> {
    if buf == 0 {
        return Err(KernelError::BadAddress);
    }
    kernel.descriptor(pid, fd)?;
    kernel.check_user_range(buf, n)?;
    let mut bounce = [0u8; BOUNCE_SIZE];
    let mut done = 0;
    let mut total = 0;
    loop {
        let chunk = core::cmp::min(n - done, BOUNCE_SIZE);
        kernel.copy_from_user(buf + done as u64, &mut bounce[..chunk])?;
        total += kernel.write(pid, fd, &bounce[..chunk])?;
        done += chunk;
        if done == n {
            return Ok(total);
        }
    }
}

fn sys_open<M: Machine>(kernel: &mut Kernel<M>, pid: Pid, name: u64) -> KResult<usize> {
    let mut buf = [0u8; NAME_LEN + 1];
    let len = kernel.copy_str_from_user(name, &mut buf)?;
    if len > NAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    kernel.open(pid, &buf[..len])
}

/// `n` is the caller's buffer size. Arguments that do not fit with their NUL
/// make the call fail instead of overrunning the buffer.
fn sys_getargs<M: Machine>(kernel: &mut Kernel<M>, pid: Pid, buf: u64, n: usize) -> KResult<usize> {
    if buf == 0 {
        return Err(KernelError::BadAddress);
    }
    let mut args = [0u8; ARGS_CAPACITY + 1];
    let cap = core::cmp::min(n, args.len());
    kernel.getargs(pid, &mut args[..cap])?;
    let len = kernel.process(pid)?.args().len() + 1;
    kernel.copy_to_user(buf, &args[..len])?;
    Ok(0)
}

/// Stores the screen alias at `out` and also returns it.
fn sys_vidmap<M: Machine>(kernel: &mut Kernel<M>, pid: Pid, out: u64) -> KResult<usize> {
    let addr = kernel.vidmap(pid, out)?;
    kernel.copy_to_user(out, &addr.as_u64().to_le_bytes())?;
    Ok(addr.as_u64() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{USER_REGION_BASE, USER_REGION_END, VIDEO_PHYS, VIDMAP_ADDR};
    use crate::machine::Event;
    use crate::testing::{boot_kernel, scancodes, standard_fs, SimCpu};
    use x86_64::PhysAddr;

    const SCRATCH: u64 = USER_REGION_BASE + 0x1000;

    fn ret(c: Completion) -> i64 {
        match c {
            Completion::Return(v) => v,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn write_to_stdout_from_user_memory() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"391OS> ").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, 1, SCRATCH, 7)), 7);
        assert_eq!(kernel.machine().screen_row(PhysAddr::new(VIDEO_PHYS), 0).trim_end(), "391OS>");
    }

    #[test]
    fn null_and_out_of_region_buffers_fail() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, 0, 0, 10)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, 1, 0, 10)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, 1, 0x1000, 10)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, 1, USER_REGION_END - 4, 10)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, GETARGS, 0, 10, 0)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, 9, SCRATCH, 10)), -1);
    }

    #[test]
    fn unknown_and_signal_calls_fail() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, SET_HANDLER, 0, 0, 0)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, SIGRETURN, 0, 0, 0)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, 99, 0, 0, 0)), -1);
    }

    #[test]
    fn open_read_close_a_file() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"frame0.txt\0").unwrap();
        let fd = ret(dispatch(&mut kernel, &mut cpu, OPEN, SCRATCH, 0, 0));
        assert_eq!(fd, 2);
        let buf = SCRATCH + 0x100;
        let n = ret(dispatch(&mut kernel, &mut cpu, READ, 2, buf, 4096));
        assert_eq!(n as usize, crate::testing::FRAME0.len());
        let mut copied = std::vec![0u8; n as usize];
        kernel.copy_from_user(buf, &mut copied).unwrap();
        assert_eq!(copied, crate::testing::FRAME0);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, CLOSE, 2, 0, 0)), 0);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, CLOSE, 2, 0, 0)), -1);
    }

    #[test]
    fn large_file_reads_span_bounce_chunks() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"counter\0").unwrap();
        let fd = ret(dispatch(&mut kernel, &mut cpu, OPEN, SCRATCH, 0, 0)) as u64;
        let size = kernel.fs().file_size(kernel.fs().resolve_by_name(b"counter").unwrap().inode).unwrap();
        let n = ret(dispatch(&mut kernel, &mut cpu, READ, fd, SCRATCH + 0x100, 10_000));
        assert_eq!(n, i64::from(size));
        assert!(size as usize > BOUNCE_SIZE);
    }

    #[test]
    fn execute_returns_child_status() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"hello world\0").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 3);
        assert!(kernel.machine().screen_text(PhysAddr::new(VIDEO_PHYS)).contains("world"));
        assert_eq!(kernel.current(), kernel.terminal(kernel.foreground()).active());
        assert_eq!(kernel.processes().count(), 1);
    }

    #[test]
    fn nested_execute_unwinds_one_level_at_a_time() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"counter\0").unwrap();
        // counter runs hello (status 3) and adds one
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 4);
        assert_eq!(cpu.entered().len(), 2);
        assert_eq!(kernel.processes().count(), 1);
    }

    #[test]
    fn crash_and_voluntary_255_are_distinct() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"fish\0").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 256);
        kernel.copy_to_user(SCRATCH, b"hello 255\0").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 255);
    }

    #[test]
    fn execute_of_missing_program_fails() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"nope\0").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), -1);
        assert!(cpu.entered().is_empty());
    }

    #[test]
    fn getargs_copies_into_user_memory() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        let shell = kernel.current().unwrap();
        let child = kernel.execute(shell, b"hello  arg1").unwrap();
        assert_eq!(kernel.current(), Some(child.pid));
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, GETARGS, SCRATCH, 32, 0)), 0);
        let mut out = [0u8; 5];
        kernel.copy_from_user(SCRATCH, &mut out).unwrap();
        assert_eq!(&out, b"arg1\0");
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, GETARGS, SCRATCH, 3, 0)), -1);
    }

    #[test]
    fn vidmap_stores_alias_address() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, VIDMAP, SCRATCH, 0, 0)), VIDMAP_ADDR as i64);
        let mut raw = [0u8; 8];
        kernel.copy_from_user(SCRATCH, &mut raw).unwrap();
        assert_eq!(u64::from_le_bytes(raw), VIDMAP_ADDR);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, VIDMAP, USER_REGION_BASE, 0, 0)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, VIDMAP, 0, 0, 0)), -1);
    }

    #[test]
    fn read_blocks_until_a_line_is_typed() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.machine_mut().queue_scancodes(&scancodes::typed("ls\n"));
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, 0, SCRATCH, 128)), 3);
        let mut line = [0u8; 3];
        kernel.copy_from_user(SCRATCH, &mut line).unwrap();
        assert_eq!(&line, b"ls\n");
    }

    #[test]
    fn read_without_input_gives_up_on_a_hosted_machine() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, 0, SCRATCH, 128)), -1);
        assert!(kernel.machine().idle_calls() > 0);
    }

    #[test]
    fn rtc_read_waits_for_tick() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"rtc\0").unwrap();
        let fd = ret(dispatch(&mut kernel, &mut cpu, OPEN, SCRATCH, 0, 0)) as u64;
        kernel.machine_mut().queue_event(Event::RtcTick);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, fd, SCRATCH, 4)), 0);
        kernel.copy_to_user(SCRATCH, &1024i32.to_le_bytes()).unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, fd, SCRATCH, 4)), 0);
        assert_eq!(kernel.machine().rtc_rate(), Some(6));
    }

    #[test]
    fn hotkey_during_blocking_read_switches_terminal() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.machine_mut().queue_scancodes(&scancodes::alt_f(3));
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, READ, 0, SCRATCH, 128)), -1);
        match cpu.switches() {
            [TerminalSwitch::Launched { from, launch }] => {
                assert_eq!(from.index(), 0);
                assert_eq!(launch.terminal.index(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn halting_the_root_respawns_it() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        match dispatch(&mut kernel, &mut cpu, HALT, 0, 0, 0) {
            Completion::Halted(HaltOutcome::Respawned(launch)) => assert_eq!(launch.pid.index(), 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hotkey_during_write_switches_terminal() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"hi").unwrap();
        kernel.machine_mut().queue_scancodes(&scancodes::alt_f(2));
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, WRITE, 1, SCRATCH, 2)), 2);
        assert_eq!(kernel.foreground().index(), 1);
        match cpu.switches() {
            [TerminalSwitch::Launched { from, launch }] => {
                assert_eq!(from.index(), 0);
                assert_eq!(launch.terminal.index(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hotkey_typed_while_a_child_runs_applies_when_execute_returns() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.copy_to_user(SCRATCH, b"hello\0").unwrap();
        kernel.machine_mut().queue_scancodes(&scancodes::alt_f(2));
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 3);
        assert_eq!(kernel.foreground().index(), 1);
        assert_eq!(cpu.switches().len(), 1);
    }

    #[test]
    fn keys_latched_in_user_mode_are_echoed_without_a_read() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        kernel.machine_mut().queue_scancodes(&scancodes::typed("ab"));
        assert!(pump(&mut kernel, &mut cpu));
        assert!(!pump(&mut kernel, &mut cpu));
        assert_eq!(kernel.machine().screen_row(PhysAddr::new(VIDEO_PHYS), 0).trim_end(), "ab");
        let tty0 = kernel.foreground();
        assert_eq!(kernel.terminal(tty0).line().pending(), b"ab");
        assert!(cpu.switches().is_empty());
    }

    #[test]
    fn overlong_command_line_is_refused() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        let mut line = std::vec![b'x'; LINE_CAPACITY + 10];
        line[..6].copy_from_slice(b"hello ");
        line.push(0);
        kernel.copy_to_user(SCRATCH, &line).unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), -1);
        assert!(cpu.entered().is_empty());

        line.truncate(LINE_CAPACITY);
        line.push(0);
        kernel.copy_to_user(SCRATCH, &line).unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, SCRATCH, 0, 0)), 3);
    }

    #[test]
    fn strings_must_end_inside_the_user_region() {
        let (mut kernel, _) = boot_kernel(standard_fs());
        let mut cpu = SimCpu::with_standard_programs();
        let tail = USER_REGION_END - 3;
        kernel.copy_to_user(tail, b"rtc").unwrap();
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, OPEN, tail, 0, 0)), -1);
        assert_eq!(ret(dispatch(&mut kernel, &mut cpu, EXECUTE, tail, 0, 0)), -1);
    }
}
