//! Inode store access.

use crate::error::{FsError, FsResult};
use crate::fs::LolElfFs;
use crate::layout::{self, INODES_PER_BLOCK, Inode};
use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

/// File type mask of the mode field.
pub const S_IFMT: u32 = 0o170000;
/// Mode bits of a directory.
pub const S_IFDIR: u32 = 0o040000;
/// Mode bits of a regular file.
pub const S_IFREG: u32 = 0o100000;
/// Mode bits of a symbolic link.
pub const S_IFLNK: u32 = 0o120000;

/// Returns the current time in seconds since the Epoch.
pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Metadata of a file, as read from its inode.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub blocks: u32,
    pub nlink: u32,
}

impl Stat {
    /// Tells whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Tells whether the inode is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

impl LolElfFs {
    /// Block and byte offset of the given inode in the inode store.
    fn inode_pos(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino >= self.sb.nr_inodes {
            return Err(FsError::OutOfRange);
        }
        let block = ino / INODES_PER_BLOCK as u32 + 1;
        let offset = ino as usize % INODES_PER_BLOCK * size_of::<Inode>();
        Ok((block, offset))
    }

    /// Reads the inode record `ino`.
    pub fn read_inode(&self, ino: u32) -> FsResult<Inode> {
        let (block, offset) = self.inode_pos(ino)?;
        let buf = self.dev.read_block(block)?;
        let data = buf.data();
        Ok(*layout::reinterpret::<Inode>(&data.0[offset..]))
    }

    /// Writes the inode record `ino` back to the store.
    pub(crate) fn write_inode(&self, ino: u32, inode: &Inode) -> FsResult<()> {
        let (block, offset) = self.inode_pos(ino)?;
        let buf = self.dev.read_block(block)?;
        {
            let mut data = buf.data_mut();
            *layout::reinterpret_mut::<Inode>(&mut data.0[offset..]) = *inode;
        }
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)
    }

    /// Returns the metadata of inode `ino`.
    pub fn stat(&self, ino: u32) -> FsResult<Stat> {
        let inode = self.read_inode(ino)?;
        Ok(Stat {
            ino,
            mode: inode.i_mode,
            uid: inode.i_uid,
            gid: inode.i_gid,
            size: inode.i_size,
            ctime: inode.i_ctime,
            atime: inode.i_atime,
            mtime: inode.i_mtime,
            blocks: inode.i_blocks,
            nlink: inode.i_nlink,
        })
    }
}
