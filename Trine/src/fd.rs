// fd.rs
//! Per-process descriptor table and the driver behind each slot.

use crate::error::{KResult, KernelError};
use crate::fs::{Dentry, FileSystem, FileType};
use crate::layout::{FIRST_USER_FD, MAX_FILES};
use crate::machine::Machine;
use crate::rtc::Rtc;
use crate::terminal::{TerminalId, TerminalManager};

/// An open file: which driver serves it, plus that driver's cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFile {
    Stdin,
    Stdout,
    Rtc { seen: u64 },
    Directory { next: usize },
    Regular { inode: u32, offset: u32 },
}

/// Devices a driver may touch, on behalf of a process on `terminal`.
pub struct Io<'a, M: Machine> {
    pub machine: &'a mut M,
    pub fs: &'a FileSystem,
    pub rtc: &'a mut Rtc,
    pub terminals: &'a mut TerminalManager,
    pub terminal: TerminalId,
}

impl OpenFile {
    pub fn open<M: Machine>(dentry: &Dentry, machine: &mut M, rtc: &mut Rtc) -> KResult<Self> {
        Ok(match dentry.file_type {
            FileType::Rtc => OpenFile::Rtc { seen: rtc.open(machine)? },
            FileType::Directory => OpenFile::Directory { next: 0 },
            FileType::Regular => OpenFile::Regular { inode: dentry.inode, offset: 0 },
        })
    }

    pub fn close(&self) -> KResult<()> {
        match self {
            OpenFile::Stdin | OpenFile::Stdout => Err(KernelError::Refused),
            _ => Ok(()),
        }
    }

    pub fn read<M: Machine>(&mut self, io: &mut Io<'_, M>, buf: &mut [u8]) -> KResult<usize> {
        match self {
            OpenFile::Stdin => io.terminals.read_line(io.terminal, buf),
            OpenFile::Stdout => Err(KernelError::Unsupported),
            OpenFile::Rtc { seen } => io.rtc.read(seen),
            OpenFile::Directory { next } => match io.fs.resolve_by_index(*next) {
                Ok(dentry) => {
                    let name = dentry.name();
                    let n = core::cmp::min(buf.len(), name.len());
                    buf[..n].copy_from_slice(&name[..n]);
                    *next += 1;
                    Ok(n)
                }
                Err(KernelError::NotFound) => Ok(0),
                Err(e) => Err(e),
            },
            OpenFile::Regular { inode, offset } => {
                let n = io.fs.read_bytes(*inode, *offset, buf)?;
                *offset += n as u32;
                Ok(n)
            }
        }
    }

    pub fn write<M: Machine>(&mut self, io: &mut Io<'_, M>, buf: &[u8]) -> KResult<usize> {
        match self {
            OpenFile::Stdout => Ok(io.terminals.write(&mut *io.machine, io.terminal, buf)),
            OpenFile::Stdin => Err(KernelError::Unsupported),
            OpenFile::Rtc { .. } => io.rtc.write(&mut *io.machine, buf),
            OpenFile::Directory { .. } | OpenFile::Regular { .. } => Err(KernelError::ReadOnly),
        }
    }
}

pub struct FdTable {
    slots: [Option<OpenFile>; MAX_FILES],
}

impl FdTable {
    pub const fn new() -> Self {
        Self { slots: [None; MAX_FILES] }
    }

    pub fn with_std_streams() -> Self {
        let mut table = Self::new();
        table.slots[0] = Some(OpenFile::Stdin);
        table.slots[1] = Some(OpenFile::Stdout);
        table
    }

    pub fn get(&self, fd: usize) -> KResult<&OpenFile> {
        self.slots
            .get(fd)
            .ok_or(KernelError::InvalidDescriptor)?
            .as_ref()
            .ok_or(KernelError::DescriptorNotOpen)
    }

    pub fn get_mut(&mut self, fd: usize) -> KResult<&mut OpenFile> {
        self.slots
            .get_mut(fd)
            .ok_or(KernelError::InvalidDescriptor)?
            .as_mut()
            .ok_or(KernelError::DescriptorNotOpen)
    }

    pub fn first_free(&self) -> KResult<usize> {
        (FIRST_USER_FD..MAX_FILES)
            .find(|&fd| self.slots[fd].is_none())
            .ok_or(KernelError::TooManyFiles)
    }

    pub fn install(&mut self, fd: usize, file: OpenFile) {
        self.slots[fd] = Some(file);
    }

    pub fn release(&mut self, fd: usize) -> Option<OpenFile> {
        self.slots.get_mut(fd)?.take()
    }

    pub fn open_descriptors(&self) -> impl Iterator<Item = (usize, &OpenFile)> {
        self.slots.iter().enumerate().filter_map(|(fd, slot)| slot.as_ref().map(|file| (fd, file)))
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
