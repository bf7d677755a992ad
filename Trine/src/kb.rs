// kb.rs
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, KeyState, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::terminal::TerminalId;

const QUEUE_SIZE: usize = 256;

lazy_static! {
    /// Filled by the keyboard IRQ, drained by the kernel with interrupts masked.
    pub static ref SCANCODES: Mutex<ScancodeQueue> = Mutex::new(ScancodeQueue::new());
}

pub struct ScancodeQueue {
    buf: [u8; QUEUE_SIZE],
    head: usize,
    tail: usize,
}

impl ScancodeQueue {
    pub const fn new() -> Self {
        Self { buf: [0; QUEUE_SIZE], head: 0, tail: 0 }
    }

    /// Returns false when the queue is full and the scancode was dropped.
    pub fn push(&mut self, sc: u8) -> bool {
        let next = (self.head + 1) % QUEUE_SIZE;
        if next == self.tail {
            return false;
        }
        self.buf[self.head] = sc;
        self.head = next;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.tail == self.head {
            return None;
        }
        let sc = self.buf[self.tail];
        self.tail = (self.tail + 1) % QUEUE_SIZE;
        Some(sc)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }
}

impl Default for ScancodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// What a keystroke means to the terminal layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Char(u8),
    Enter,
    Backspace,
    /// Ctrl+L
    ClearScreen,
    /// Alt+F1..F3
    SwitchTerminal(TerminalId),
}

pub struct KeyboardDecoder {
    keyboard: Keyboard<layouts::Us104Key, ScancodeSet1>,
    ctrl: bool,
    alt: bool,
}

impl KeyboardDecoder {
    pub fn new() -> Self {
        Self {
            keyboard: Keyboard::new(layouts::Us104Key, ScancodeSet1, HandleControl::Ignore),
            ctrl: false,
            alt: false,
        }
    }

    pub fn feed(&mut self, scancode: u8) -> Option<KeyAction> {
        let event = match self.keyboard.add_byte(scancode) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(e) => {
                klog_debug!("kb", "dropped scancode {:#04x}: {:?}", scancode, e);
                return None;
            }
        };
        let code = event.code;
        let down = event.state == KeyState::Down;
        match code {
            KeyCode::ControlLeft | KeyCode::ControlRight => self.ctrl = down,
            KeyCode::AltLeft | KeyCode::AltRight => self.alt = down,
            _ => {}
        }
        let hotkey = match code {
            KeyCode::F1 if down && self.alt => TerminalId::new(0).map(KeyAction::SwitchTerminal),
            KeyCode::F2 if down && self.alt => TerminalId::new(1).map(KeyAction::SwitchTerminal),
            KeyCode::F3 if down && self.alt => TerminalId::new(2).map(KeyAction::SwitchTerminal),
            KeyCode::L if down && self.ctrl => Some(KeyAction::ClearScreen),
            _ => None,
        };
        // keep the decoder's shift/caps state current even for hotkeys
        let decoded = self.keyboard.process_keyevent(event);
        if hotkey.is_some() {
            return hotkey;
        }
        if self.ctrl || self.alt {
            return None;
        }
        match decoded? {
            DecodedKey::Unicode('\n') | DecodedKey::Unicode('\r') => Some(KeyAction::Enter),
            DecodedKey::Unicode('\x08') => Some(KeyAction::Backspace),
            DecodedKey::Unicode('\t') => Some(KeyAction::Char(b' ')),
            DecodedKey::Unicode(c) if c.is_ascii() && !c.is_ascii_control() => Some(KeyAction::Char(c as u8)),
            DecodedKey::RawKey(KeyCode::Enter) => Some(KeyAction::Enter),
            DecodedKey::RawKey(KeyCode::Backspace) => Some(KeyAction::Backspace),
            _ => None,
        }
    }
}

impl Default for KeyboardDecoder {
    fn default() -> Self {
        Self::new()
    }
}
