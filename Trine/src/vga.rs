// vga.rs
use core::fmt;

use x86_64::PhysAddr;

use crate::layout::{DEFAULT_ATTRIBUTE, SCREEN_BYTES, SCREEN_COLS, SCREEN_ROWS};
use crate::machine::Machine;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub row: usize,
    pub column: usize,
}

/// An 80x25 text page living in physical memory: either the live video page
/// or a terminal's backup copy.
pub struct TextPage<'a, M: Machine> {
    machine: &'a mut M,
    base: PhysAddr,
    cursor: &'a mut Cursor,
    color: u8,
}

impl<'a, M: Machine> TextPage<'a, M> {
    pub fn new(machine: &'a mut M, base: PhysAddr, cursor: &'a mut Cursor) -> Self {
        Self { machine, base, cursor, color: DEFAULT_ATTRIBUTE }
    }

    fn cell(&self, row: usize, column: usize) -> PhysAddr {
        self.base + ((row * SCREEN_COLS + column) * 2) as u64
    }

    pub fn put_byte(&mut self, b: u8) {
        match b {
            b'\n' => {
                self.new_line();
                return;
            }
            b'\r' => {
                self.cursor.column = 0;
                return;
            }
            _ => {}
        }
        if self.cursor.column >= SCREEN_COLS {
            self.new_line();
        }
        let cell = self.cell(self.cursor.row, self.cursor.column);
        self.machine.write_phys(cell, &[b, self.color]);
        self.cursor.column += 1;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put_byte(b);
        }
    }

    /// Erases the cell before the cursor; stops at the start of the row.
    pub fn backspace(&mut self) {
        if self.cursor.column == 0 {
            return;
        }
        self.cursor.column -= 1;
        let cell = self.cell(self.cursor.row, self.cursor.column);
        self.machine.write_phys(cell, &[b' ', self.color]);
    }

    pub fn new_line(&mut self) {
        self.cursor.column = 0;
        if self.cursor.row + 1 < SCREEN_ROWS {
            self.cursor.row += 1;
            return;
        }
        // scroll up one row; a forward chunked copy is safe since dst < src
        let row_bytes = SCREEN_COLS * 2;
        self.machine
            .copy_phys(self.base + row_bytes as u64, self.base, SCREEN_BYTES - row_bytes);
        let last = self.cell(SCREEN_ROWS - 1, 0);
        self.machine.fill_phys(last, [b' ', self.color], row_bytes);
    }

    pub fn clear(&mut self) {
        self.machine.fill_phys(self.base, [b' ', self.color], SCREEN_BYTES);
        *self.cursor = Cursor::default();
    }
}

impl<M: Machine> fmt::Write for TextPage<'_, M> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::VIDEO_PHYS;
    use crate::testing::SimMachine;

    fn page<'a>(machine: &'a mut SimMachine, cursor: &'a mut Cursor) -> TextPage<'a, SimMachine> {
        TextPage::new(machine, PhysAddr::new(VIDEO_PHYS), cursor)
    }

    #[test]
    fn writes_characters_with_attribute() {
        let mut machine = SimMachine::new();
        let mut cursor = Cursor::default();
        page(&mut machine, &mut cursor).write_bytes(b"hi\nx");
        assert_eq!(machine.screen_row(PhysAddr::new(VIDEO_PHYS), 0).trim_end(), "hi");
        assert_eq!(machine.screen_row(PhysAddr::new(VIDEO_PHYS), 1).trim_end(), "x");
        let mut attr = [0u8; 1];
        machine.read_phys(PhysAddr::new(VIDEO_PHYS + 1), &mut attr);
        assert_eq!(attr[0], DEFAULT_ATTRIBUTE);
        assert_eq!(cursor, Cursor { row: 1, column: 1 });
    }

    #[test]
    fn wraps_and_scrolls() {
        let mut machine = SimMachine::new();
        let mut cursor = Cursor::default();
        {
            let mut p = page(&mut machine, &mut cursor);
            p.clear();
            p.write_bytes(b"first\n");
            for _ in 0..SCREEN_ROWS - 1 {
                p.write_bytes(b"\n");
            }
            p.write_bytes(&[b'z'; SCREEN_COLS + 1]);
        }
        // "first" scrolled off; the long line wrapped onto the last row
        assert_ne!(machine.screen_row(PhysAddr::new(VIDEO_PHYS), 0).trim_end(), "first");
        assert_eq!(machine.screen_row(PhysAddr::new(VIDEO_PHYS), SCREEN_ROWS - 1).trim_end(), "z");
        assert_eq!(cursor.row, SCREEN_ROWS - 1);
    }

    #[test]
    fn backspace_stays_on_the_row() {
        let mut machine = SimMachine::new();
        let mut cursor = Cursor { row: 3, column: 1 };
        let mut p = page(&mut machine, &mut cursor);
        p.backspace();
        p.backspace();
        assert_eq!(cursor, Cursor { row: 3, column: 0 });
    }
}
