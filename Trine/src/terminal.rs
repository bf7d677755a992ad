// terminal.rs
//! Three virtual consoles sharing one display and one keyboard.
//!
//! The foreground terminal owns the live video page and receives keystrokes.
//! Background terminals render into their own backup page with a saved cursor,
//! so a program in a background terminal can keep writing.

use x86_64::PhysAddr;

use crate::error::{KResult, KernelError};
use crate::kb::KeyAction;
use crate::layout::{terminal_backup_page, LINE_CAPACITY, SCREEN_BYTES, TERMINAL_COUNT, VIDEO_PHYS};
use crate::machine::Machine;
use crate::process::Pid;
use crate::vga::{Cursor, TextPage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TerminalId(u8);

impl TerminalId {
    pub const fn new(raw: usize) -> Option<Self> {
        if raw < TERMINAL_COUNT {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = TerminalId> {
        (0..TERMINAL_COUNT as u8).map(TerminalId)
    }
}

/// Cooked keyboard input: committed lines end in `\n`, anything after the
/// last newline is still being edited.
pub struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self { bytes: [0; LINE_CAPACITY], len: 0 }
    }

    /// The last slot is reserved for the newline.
    pub fn push_char(&mut self, b: u8) -> bool {
        if self.len + 1 >= LINE_CAPACITY {
            return false;
        }
        self.bytes[self.len] = b;
        self.len += 1;
        true
    }

    pub fn push_newline(&mut self) -> bool {
        if self.len >= LINE_CAPACITY {
            return false;
        }
        self.bytes[self.len] = b'\n';
        self.len += 1;
        true
    }

    /// Drops the last uncommitted byte.
    pub fn pop(&mut self) -> bool {
        match self.len.checked_sub(1) {
            Some(last) if self.bytes[last] != b'\n' => {
                self.len = last;
                true
            }
            _ => false,
        }
    }

    pub fn has_line(&self) -> bool {
        self.bytes[..self.len].contains(&b'\n')
    }

    /// Moves the first complete line into `out`, truncated to its length.
    /// The whole line is consumed either way.
    pub fn take_line(&mut self, out: &mut [u8]) -> Option<usize> {
        let end = self.bytes[..self.len].iter().position(|&b| b == b'\n')? + 1;
        let n = core::cmp::min(out.len(), end);
        out[..n].copy_from_slice(&self.bytes[..n]);
        self.bytes.copy_within(end..self.len, 0);
        self.len -= end;
        Some(n)
    }

    /// Forgets input typed since the last committed line.
    pub fn discard_pending(&mut self) {
        self.len = self.bytes[..self.len].iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    }

    pub fn pending(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Terminal {
    id: TerminalId,
    activated: bool,
    active: Option<Pid>,
    line: LineBuffer,
    saved_cursor: Cursor,
    backup: PhysAddr,
}

impl Terminal {
    fn new(id: TerminalId) -> Self {
        Self {
            id,
            activated: false,
            active: None,
            line: LineBuffer::new(),
            saved_cursor: Cursor::default(),
            backup: terminal_backup_page(id),
        }
    }

    pub fn id(&self) -> TerminalId {
        self.id
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Process currently owning this terminal's input.
    pub fn active(&self) -> Option<Pid> {
        self.active
    }

    pub fn line(&self) -> &LineBuffer {
        &self.line
    }

    pub fn backup_page(&self) -> PhysAddr {
        self.backup
    }
}

pub struct TerminalManager {
    terminals: [Terminal; TERMINAL_COUNT],
    foreground: TerminalId,
    live_cursor: Cursor,
}

impl TerminalManager {
    pub fn new() -> Self {
        Self {
            terminals: [
                Terminal::new(TerminalId(0)),
                Terminal::new(TerminalId(1)),
                Terminal::new(TerminalId(2)),
            ],
            foreground: TerminalId(0),
            live_cursor: Cursor::default(),
        }
    }

    /// Blanks the display and every backup page.
    pub fn init<M: Machine>(&mut self, machine: &mut M) {
        let mut cursor = Cursor::default();
        TextPage::new(machine, PhysAddr::new_truncate(VIDEO_PHYS), &mut self.live_cursor).clear();
        for term in self.terminals.iter_mut() {
            TextPage::new(machine, term.backup, &mut cursor).clear();
            term.saved_cursor = Cursor::default();
        }
        machine.set_cursor(0, 0);
    }

    pub fn foreground(&self) -> TerminalId {
        self.foreground
    }

    pub fn get(&self, id: TerminalId) -> &Terminal {
        &self.terminals[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Terminal> {
        self.terminals.iter()
    }

    pub fn set_active(&mut self, id: TerminalId, pid: Option<Pid>) {
        let term = &mut self.terminals[id.index()];
        if pid.is_some() {
            term.activated = true;
        }
        term.active = pid;
    }

    /// Physical page holding `id`'s screen right now.
    pub fn video_page(&self, id: TerminalId) -> PhysAddr {
        if id == self.foreground {
            PhysAddr::new_truncate(VIDEO_PHYS)
        } else {
            self.terminals[id.index()].backup
        }
    }

    fn page<'a, M: Machine>(&'a mut self, machine: &'a mut M, id: TerminalId) -> TextPage<'a, M> {
        if id == self.foreground {
            TextPage::new(machine, PhysAddr::new_truncate(VIDEO_PHYS), &mut self.live_cursor)
        } else {
            let term = &mut self.terminals[id.index()];
            TextPage::new(machine, term.backup, &mut term.saved_cursor)
        }
    }

    fn sync_cursor<M: Machine>(&self, machine: &mut M) {
        machine.set_cursor(self.live_cursor.row, self.live_cursor.column);
    }

    pub fn write<M: Machine>(&mut self, machine: &mut M, id: TerminalId, bytes: &[u8]) -> usize {
        self.page(machine, id).write_bytes(bytes);
        if id == self.foreground {
            self.sync_cursor(machine);
        }
        bytes.len()
    }

    pub fn write_fmt<M: Machine>(&mut self, machine: &mut M, id: TerminalId, args: core::fmt::Arguments) {
        use core::fmt::Write;
        let _ = self.page(machine, id).write_fmt(args);
        if id == self.foreground {
            self.sync_cursor(machine);
        }
    }

    /// Completes a stdin read for `id`, or reports that no line is ready.
    pub fn read_line(&mut self, id: TerminalId, out: &mut [u8]) -> KResult<usize> {
        self.terminals[id.index()].line.take_line(out).ok_or(KernelError::WouldBlock)
    }

    /// Applies a keystroke to the foreground terminal. A terminal switch is
    /// returned to the caller, which owns process state.
    pub fn handle_key<M: Machine>(&mut self, machine: &mut M, action: KeyAction) -> Option<TerminalId> {
        let fg = self.foreground;
        match action {
            KeyAction::Char(b) => {
                if self.terminals[fg.index()].line.push_char(b) {
                    self.write(machine, fg, &[b]);
                }
            }
            KeyAction::Enter => {
                if self.terminals[fg.index()].line.push_newline() {
                    self.write(machine, fg, b"\n");
                }
            }
            KeyAction::Backspace => {
                if self.terminals[fg.index()].line.pop() {
                    self.page(machine, fg).backspace();
                    self.sync_cursor(machine);
                }
            }
            KeyAction::ClearScreen => {
                self.terminals[fg.index()].line.discard_pending();
                self.page(machine, fg).clear();
                self.sync_cursor(machine);
            }
            KeyAction::SwitchTerminal(target) => return Some(target),
        }
        None
    }

    /// Moves the display to `to`: the current screen and cursor go to the old
    /// foreground's backup page, `to`'s backup comes back on screen.
    pub fn swap<M: Machine>(&mut self, machine: &mut M, to: TerminalId) {
        let from = self.foreground;
        if from == to {
            return;
        }
        let video = PhysAddr::new_truncate(VIDEO_PHYS);
        let old = &mut self.terminals[from.index()];
        machine.copy_phys(video, old.backup, SCREEN_BYTES);
        old.saved_cursor = self.live_cursor;
        let new = &self.terminals[to.index()];
        machine.copy_phys(new.backup, video, SCREEN_BYTES);
        self.live_cursor = new.saved_cursor;
        self.foreground = to;
        self.sync_cursor(machine);
        klog_debug!("term", "display {} -> {}", from.index(), to.index());
    }
}

impl Default for TerminalManager {
    fn default() -> Self {
        Self::new()
    }
}
