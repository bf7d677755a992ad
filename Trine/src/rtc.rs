// rtc.rs
//! Real-time clock as a tick source.
//!
//! The device counts periodic interrupts. Each open descriptor remembers the
//! last tick it saw, so `read` completes once a newer tick has arrived.

use crate::error::{KResult, KernelError};
use crate::machine::Machine;

pub const DEFAULT_FREQUENCY: u32 = 2;
pub const MAX_FREQUENCY: u32 = 1024;

/// Rate divider for `freq` Hz: 2 Hz -> 15, 1024 Hz -> 6.
pub fn rate_for(freq: u32) -> Option<u8> {
    if !freq.is_power_of_two() || !(DEFAULT_FREQUENCY..=MAX_FREQUENCY).contains(&freq) {
        return None;
    }
    Some(16 - freq.trailing_zeros() as u8)
}

pub struct Rtc {
    frequency: u32,
    ticks: u64,
}

impl Rtc {
    pub const fn new() -> Self {
        Self { frequency: DEFAULT_FREQUENCY, ticks: 0 }
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
    }

    fn program<M: Machine>(&mut self, machine: &mut M, freq: u32) -> KResult<()> {
        let rate = rate_for(freq).ok_or(KernelError::InvalidArgument)?;
        machine.set_rtc_rate(rate);
        self.frequency = freq;
        klog_debug!("rtc", "{} Hz (rate {})", freq, rate);
        Ok(())
    }

    /// Resets the clock to 2 Hz and returns the tick count the new descriptor starts from.
    pub fn open<M: Machine>(&mut self, machine: &mut M) -> KResult<u64> {
        self.program(machine, DEFAULT_FREQUENCY)?;
        Ok(self.ticks)
    }

    pub fn read(&self, seen: &mut u64) -> KResult<usize> {
        if self.ticks == *seen {
            return Err(KernelError::WouldBlock);
        }
        *seen = self.ticks;
        Ok(0)
    }

    /// Takes exactly four bytes: a little-endian frequency in Hz.
    pub fn write<M: Machine>(&mut self, machine: &mut M, buf: &[u8]) -> KResult<usize> {
        let raw: [u8; 4] = buf.try_into().map_err(|_| KernelError::InvalidArgument)?;
        let freq = i32::from_le_bytes(raw);
        let freq = u32::try_from(freq).map_err(|_| KernelError::InvalidArgument)?;
        self.program(machine, freq)?;
        Ok(0)
    }
}

impl Default for Rtc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMachine;

    #[test]
    fn rates_for_powers_of_two() {
        assert_eq!(rate_for(2), Some(15));
        assert_eq!(rate_for(32), Some(11));
        assert_eq!(rate_for(1024), Some(6));
        assert_eq!(rate_for(1), None);
        assert_eq!(rate_for(3), None);
        assert_eq!(rate_for(2048), None);
    }

    #[test]
    fn open_resets_to_two_hertz() {
        let mut machine = SimMachine::new();
        let mut rtc = Rtc::new();
        rtc.write(&mut machine, &512i32.to_le_bytes()).unwrap();
        assert_eq!(machine.rtc_rate(), Some(7));
        rtc.open(&mut machine).unwrap();
        assert_eq!(rtc.frequency(), 2);
        assert_eq!(machine.rtc_rate(), Some(15));
    }

    #[test]
    fn bad_writes_leave_frequency_alone() {
        let mut machine = SimMachine::new();
        let mut rtc = Rtc::new();
        assert_eq!(rtc.write(&mut machine, &100i32.to_le_bytes()), Err(KernelError::InvalidArgument));
        assert_eq!(rtc.write(&mut machine, &(-4i32).to_le_bytes()), Err(KernelError::InvalidArgument));
        assert_eq!(rtc.write(&mut machine, &[4, 0]), Err(KernelError::InvalidArgument));
        assert_eq!(rtc.frequency(), 2);
    }

    #[test]
    fn read_waits_for_a_new_tick() {
        let mut machine = SimMachine::new();
        let mut rtc = Rtc::new();
        let mut seen = rtc.open(&mut machine).unwrap();
        assert_eq!(rtc.read(&mut seen), Err(KernelError::WouldBlock));
        rtc.tick();
        assert_eq!(rtc.read(&mut seen), Ok(0));
        assert_eq!(rtc.read(&mut seen), Err(KernelError::WouldBlock));
    }
}
