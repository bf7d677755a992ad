// fs.rs
//! Read-only filesystem image.
//!
//! Block 0 is the boot block: three counts, 52 reserved bytes and up to 63
//! directory entries. Inode blocks follow, then data blocks. Integers are
//! little-endian.

use crate::error::{KResult, KernelError};

pub const BLOCK_SIZE: usize = 4096;
pub const NAME_LEN: usize = 32;
pub const MAX_DENTRIES: usize = 63;
const DENTRY_SIZE: usize = 64;
const DENTRY_BASE: usize = 64;
const BLOCKS_PER_INODE: usize = BLOCK_SIZE / 4 - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Rtc,
    Directory,
    Regular,
}

impl FileType {
    fn from_raw(raw: u32) -> KResult<Self> {
        match raw {
            0 => Ok(FileType::Rtc),
            1 => Ok(FileType::Directory),
            2 => Ok(FileType::Regular),
            _ => Err(KernelError::CorruptImage),
        }
    }

    const fn raw(self) -> u32 {
        match self {
            FileType::Rtc => 0,
            FileType::Directory => 1,
            FileType::Regular => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dentry {
    name: [u8; NAME_LEN],
    pub file_type: FileType,
    pub inode: u32,
}

impl Dentry {
    /// Name without NUL padding; a full 32-byte name is not terminated.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &self.name[..len]
    }
}

fn read_u32(bytes: &[u8], at: usize) -> KResult<u32> {
    let raw = bytes.get(at..at + 4).ok_or(KernelError::CorruptImage)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[derive(Clone, Copy)]
pub struct FileSystem {
    image: &'static [u8],
    dentry_count: u32,
    inode_count: u32,
    data_block_count: u32,
}

impl FileSystem {
    pub fn new(image: &'static [u8]) -> KResult<Self> {
        let dentry_count = read_u32(image, 0)?;
        let inode_count = read_u32(image, 4)?;
        let data_block_count = read_u32(image, 8)?;
        let blocks = 1 + inode_count as usize + data_block_count as usize;
        if dentry_count as usize > MAX_DENTRIES || image.len() < blocks * BLOCK_SIZE {
            klog_error!("fs", "image of {} bytes does not hold {} blocks", image.len(), blocks);
            return Err(KernelError::CorruptImage);
        }
        klog_info!("fs", "{} entries, {} inodes, {} data blocks", dentry_count, inode_count, data_block_count);
        Ok(Self { image, dentry_count, inode_count, data_block_count })
    }

    pub fn dentry_count(&self) -> usize {
        self.dentry_count as usize
    }

    pub fn resolve_by_index(&self, index: usize) -> KResult<Dentry> {
        if index >= self.dentry_count() {
            return Err(KernelError::NotFound);
        }
        let base = DENTRY_BASE + index * DENTRY_SIZE;
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&self.image[base..base + NAME_LEN]);
        Ok(Dentry {
            name,
            file_type: FileType::from_raw(read_u32(self.image, base + NAME_LEN)?)?,
            inode: read_u32(self.image, base + NAME_LEN + 4)?,
        })
    }

    pub fn resolve_by_name(&self, name: &[u8]) -> KResult<Dentry> {
        if name.is_empty() {
            return Err(KernelError::NotFound);
        }
        if name.len() > NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        (0..self.dentry_count())
            .map(|i| self.resolve_by_index(i))
            .find(|d| matches!(d, Ok(d) if d.name() == name))
            .unwrap_or(Err(KernelError::NotFound))
    }

    fn inode_base(&self, inode: u32) -> KResult<usize> {
        if inode >= self.inode_count {
            return Err(KernelError::NotFound);
        }
        Ok((1 + inode as usize) * BLOCK_SIZE)
    }

    pub fn file_size(&self, inode: u32) -> KResult<u32> {
        read_u32(self.image, self.inode_base(inode)?)
    }

    /// Copies file bytes starting at `offset`. Returns 0 at or past the end.
    pub fn read_bytes(&self, inode: u32, offset: u32, buf: &mut [u8]) -> KResult<usize> {
        let base = self.inode_base(inode)?;
        let size = read_u32(self.image, base)? as usize;
        let offset = offset as usize;
        if offset >= size {
            return Ok(0);
        }
        let count = core::cmp::min(buf.len(), size - offset);
        let data_base = (1 + self.inode_count as usize) * BLOCK_SIZE;
        let mut done = 0;
        while done < count {
            let pos = offset + done;
            let index = pos / BLOCK_SIZE;
            if index >= BLOCKS_PER_INODE {
                return Err(KernelError::CorruptImage);
            }
            let block = read_u32(self.image, base + 4 + index * 4)?;
            if block >= self.data_block_count {
                klog_warn!("fs", "inode {} names data block {} of {}", inode, block, self.data_block_count);
                return Err(KernelError::CorruptImage);
            }
            let within = pos % BLOCK_SIZE;
            let n = core::cmp::min(count - done, BLOCK_SIZE - within);
            let start = data_base + block as usize * BLOCK_SIZE + within;
            buf[done..done + n].copy_from_slice(&self.image[start..start + n]);
            done += n;
        }
        Ok(count)
    }
}

/// Lays out a filesystem image in a caller-provided buffer.
pub struct ImageBuilder<'a> {
    image: &'a mut [u8],
    inode_count: u32,
    dentries: usize,
    next_inode: u32,
    next_block: u32,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(image: &'a mut [u8], inode_count: u32) -> KResult<Self> {
        if image.len() < (1 + inode_count as usize) * BLOCK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        image.fill(0);
        Ok(Self { image, inode_count, dentries: 0, next_inode: 0, next_block: 0 })
    }

    fn push_dentry(&mut self, name: &[u8], file_type: FileType, inode: u32) -> KResult<()> {
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        if self.dentries == MAX_DENTRIES {
            return Err(KernelError::TooManyFiles);
        }
        let base = DENTRY_BASE + self.dentries * DENTRY_SIZE;
        self.image[base..base + name.len()].copy_from_slice(name);
        self.image[base + NAME_LEN..base + NAME_LEN + 4].copy_from_slice(&file_type.raw().to_le_bytes());
        self.image[base + NAME_LEN + 4..base + NAME_LEN + 8].copy_from_slice(&inode.to_le_bytes());
        self.dentries += 1;
        Ok(())
    }

    pub fn add_directory(&mut self, name: &[u8]) -> KResult<()> {
        self.push_dentry(name, FileType::Directory, 0)
    }

    pub fn add_device(&mut self, name: &[u8]) -> KResult<()> {
        self.push_dentry(name, FileType::Rtc, 0)
    }

    pub fn add_file(&mut self, name: &[u8], contents: &[u8]) -> KResult<u32> {
        if self.next_inode == self.inode_count {
            return Err(KernelError::TooManyFiles);
        }
        let blocks = contents.len().div_ceil(BLOCK_SIZE);
        let data_base = (1 + self.inode_count as usize) * BLOCK_SIZE;
        let needed_end = data_base + (self.next_block as usize + blocks) * BLOCK_SIZE;
        if blocks > BLOCKS_PER_INODE || needed_end > self.image.len() {
            return Err(KernelError::InvalidArgument);
        }
        let inode = self.next_inode;
        self.push_dentry(name, FileType::Regular, inode)?;
        let inode_base = (1 + inode as usize) * BLOCK_SIZE;
        self.image[inode_base..inode_base + 4].copy_from_slice(&(contents.len() as u32).to_le_bytes());
        for (i, chunk) in contents.chunks(BLOCK_SIZE).enumerate() {
            let block = self.next_block + i as u32;
            let slot = inode_base + 4 + i * 4;
            self.image[slot..slot + 4].copy_from_slice(&block.to_le_bytes());
            let start = data_base + block as usize * BLOCK_SIZE;
            self.image[start..start + chunk.len()].copy_from_slice(chunk);
        }
        self.next_inode += 1;
        self.next_block += blocks as u32;
        Ok(inode)
    }

    /// Writes the boot-block counts and returns the image length in bytes.
    pub fn finish(self) -> usize {
        self.image[0..4].copy_from_slice(&(self.dentries as u32).to_le_bytes());
        self.image[4..8].copy_from_slice(&self.inode_count.to_le_bytes());
        self.image[8..12].copy_from_slice(&self.next_block.to_le_bytes());
        (1 + self.inode_count as usize + self.next_block as usize) * BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::leak_image;

    fn sample() -> FileSystem {
        leak_image(|b| {
            b.add_directory(b".")?;
            b.add_device(b"rtc")?;
            b.add_file(b"frame0.txt", b"fish")?;
            let big: std::vec::Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
            b.add_file(b"big", &big)?;
            b.add_file(b"verylargetextwithverylongname.tx", b"long name")?;
            Ok(())
        })
    }

    #[test]
    fn lookup_by_name_and_index() {
        let fs = sample();
        assert_eq!(fs.dentry_count(), 5);
        let d = fs.resolve_by_name(b"rtc").unwrap();
        assert_eq!(d.file_type, FileType::Rtc);
        assert_eq!(fs.resolve_by_index(0).unwrap().name(), b".");
        assert_eq!(fs.resolve_by_index(5), Err(KernelError::NotFound));
    }

    #[test]
    fn names_are_exact_up_to_32_bytes() {
        let fs = sample();
        let d = fs.resolve_by_name(b"verylargetextwithverylongname.tx").unwrap();
        assert_eq!(d.name().len(), NAME_LEN);
        assert_eq!(fs.resolve_by_name(b"verylargetextwithverylongname.txt"), Err(KernelError::NameTooLong));
        assert_eq!(fs.resolve_by_name(b"frame0"), Err(KernelError::NotFound));
        assert_eq!(fs.resolve_by_name(b""), Err(KernelError::NotFound));
    }

    #[test]
    fn reads_cross_block_boundaries_and_clip_at_eof() {
        let fs = sample();
        let d = fs.resolve_by_name(b"big").unwrap();
        assert_eq!(fs.file_size(d.inode).unwrap(), 9000);
        let mut buf = [0u8; 200];
        assert_eq!(fs.read_bytes(d.inode, 4000, &mut buf).unwrap(), 200);
        assert_eq!(buf[0], (4000 % 251) as u8);
        assert_eq!(buf[199], (4199 % 251) as u8);
        assert_eq!(fs.read_bytes(d.inode, 8900, &mut buf).unwrap(), 100);
        assert_eq!(fs.read_bytes(d.inode, 9000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut raw = std::vec![0u8; BLOCK_SIZE];
        raw[4..8].copy_from_slice(&3u32.to_le_bytes());
        let image: &'static [u8] = std::boxed::Box::leak(raw.into_boxed_slice());
        assert!(matches!(FileSystem::new(image), Err(KernelError::CorruptImage)));
    }
}
