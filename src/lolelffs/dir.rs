/*
 * Copyright 2025 Daniel Hodges
 *
 * This file is part of lolelffs.
 *
 * lolelffs is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * lolelffs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
 * details.
 *
 * You should have received a copy of the GNU General Public License along
 * with lolelffs. If not, see <https://www.gnu.org/licenses/>.
 */

//! Directories.
//!
//! A directory's extent index block carries the authoritative entry count in
//! its `nr_files` word; the data blocks hold a dense array of fixed-size
//! entries. Removal keeps the array dense by moving the last entry into the
//! freed slot.

use crate::error::{FsError, FsResult};
use crate::fs::LolElfFs;
use crate::inode::{S_IFDIR, S_IFLNK, S_IFMT, now};
use crate::layout::{
    self, DirBlock, ExtentIndexBlock, FILENAME_LEN, FILES_PER_BLOCK, FileEntry, Inode,
    MAX_SUBFILES, SYMLINK_LEN,
};

/// One entry yielded by directory iteration.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub ino: u32,
    pub name: String,
}

fn entry_name(entry: &FileEntry) -> &[u8] {
    let len = entry
        .filename
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(FILENAME_LEN);
    &entry.filename[..len]
}

fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > FILENAME_LEN || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

impl LolElfFs {
    /// Reads the entry count of the directory's index block.
    fn dir_nr_files(&self, ei_block: u32) -> FsResult<u32> {
        let buf = self.dev.read_block(ei_block)?;
        let data = buf.data();
        Ok(layout::reinterpret::<ExtentIndexBlock>(&data.0).nr_files)
    }

    fn set_dir_nr_files(&self, ei_block: u32, nr_files: u32) -> FsResult<()> {
        let buf = self.dev.read_block(ei_block)?;
        {
            let mut data = buf.data_mut();
            layout::reinterpret_mut::<ExtentIndexBlock>(&mut data.0).nr_files = nr_files;
        }
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)
    }

    fn require_dir(&self, ino: u32) -> FsResult<Inode> {
        let inode = self.read_inode(ino)?;
        if inode.i_mode & S_IFMT != S_IFDIR {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    /// Reads the directory entry at dense index `n`.
    fn read_dir_entry(&self, dir: &Inode, n: u32) -> FsResult<FileEntry> {
        let iblock = n / FILES_PER_BLOCK as u32;
        let slot = n as usize % FILES_PER_BLOCK;
        let Some(map) = self.resolve_block(dir.ei_block, iblock)? else {
            return Err(FsError::NotFound);
        };
        let buf = self.dev.read_block(map)?;
        let data = buf.data();
        Ok(layout::reinterpret::<DirBlock>(&data.0).files[slot])
    }

    /// Writes the directory entry at dense index `n`.
    fn write_dir_entry(&self, dir: &Inode, n: u32, entry: &FileEntry) -> FsResult<()> {
        let iblock = n / FILES_PER_BLOCK as u32;
        let slot = n as usize % FILES_PER_BLOCK;
        let Some(map) = self.resolve_block(dir.ei_block, iblock)? else {
            return Err(FsError::NotFound);
        };
        let buf = self.dev.read_block(map)?;
        {
            let mut data = buf.data_mut();
            layout::reinterpret_mut::<DirBlock>(&mut data.0).files[slot] = *entry;
        }
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)
    }

    /// Finds `name` in the directory, returning its dense index and inode.
    fn find_entry(&self, dir: &Inode, name: &str) -> FsResult<Option<(u32, u32)>> {
        let nr_files = self.dir_nr_files(dir.ei_block)?;
        for n in 0..nr_files {
            let entry = self.read_dir_entry(dir, n)?;
            if entry.inode != 0 && entry_name(&entry) == name.as_bytes() {
                return Ok(Some((n, entry.inode)));
            }
        }
        Ok(None)
    }

    /// Looks a name up in a directory.
    pub fn lookup(&self, dir_ino: u32, name: &str) -> FsResult<u32> {
        check_name(name)?;
        let dir = self.require_dir(dir_ino)?;
        match self.find_entry(&dir, name)? {
            Some((_, ino)) => Ok(ino),
            None => Err(FsError::NotFound),
        }
    }

    /// Iterates the directory from cursor `pos`, materialising `.` and `..`
    /// first. `emit` returns `false` to stop (buffer full); the new cursor
    /// is returned.
    pub fn read_dir(
        &self,
        dir_ino: u32,
        mut pos: u64,
        mut emit: impl FnMut(&DirEntry) -> bool,
    ) -> FsResult<u64> {
        let dir = self.require_dir(dir_ino)?;
        let nr_files = self.dir_nr_files(dir.ei_block)? as u64;
        if pos > nr_files + 2 {
            return Ok(pos);
        }
        // Parent resolution belongs to the VFS shim above the core; both dot
        // entries point at the directory itself.
        for (p, name) in [(0u64, "."), (1, "..")] {
            if pos == p {
                if !emit(&DirEntry {
                    ino: dir_ino,
                    name: name.to_owned(),
                }) {
                    return Ok(pos);
                }
                pos += 1;
            }
        }
        while pos - 2 < nr_files {
            let entry = self.read_dir_entry(&dir, (pos - 2) as u32)?;
            if entry.inode != 0 {
                let ent = DirEntry {
                    ino: entry.inode,
                    name: String::from_utf8_lossy(entry_name(&entry)).into_owned(),
                };
                if !emit(&ent) {
                    break;
                }
            }
            pos += 1;
        }
        Ok(pos)
    }

    /// Appends an entry to the directory, allocating directory data blocks
    /// as needed.
    fn add_entry(&self, dir_ino: u32, name: &str, ino: u32) -> FsResult<()> {
        let dir = self.require_dir(dir_ino)?;
        let n = self.dir_nr_files(dir.ei_block)?;
        if n >= MAX_SUBFILES {
            return Err(FsError::NoSpace);
        }
        // Make sure the data block holding slot `n` exists
        let iblock = n / FILES_PER_BLOCK as u32;
        if self.resolve_block(dir.ei_block, iblock)?.is_none() {
            self.alloc_file_block(dir_ino, iblock)?;
        }
        let mut entry = FileEntry {
            inode: ino,
            filename: [0; FILENAME_LEN + 1],
        };
        entry.filename[..name.len()].copy_from_slice(name.as_bytes());
        self.write_dir_entry(&dir, n, &entry)?;
        self.set_dir_nr_files(dir.ei_block, n + 1)
    }

    /// Creates a file or directory named `name` under `dir_ino` and returns
    /// its inode number.
    pub fn create(&self, dir_ino: u32, name: &str, mode: u32, uid: u32, gid: u32) -> FsResult<u32> {
        check_name(name)?;
        let dir = self.require_dir(dir_ino)?;
        if self.find_entry(&dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let is_dir = mode & S_IFMT == S_IFDIR;
        let ino = self.alloc.alloc_inode();
        if ino == 0 {
            return Err(FsError::NoSpace);
        }
        let ei_block = self.alloc.alloc_blocks(1);
        if ei_block == 0 {
            self.alloc.free_inode(ino);
            return Err(FsError::NoSpace);
        }
        // A fresh extent index: no extents, no files
        let buf = self.dev.read_block(ei_block)?;
        buf.data_mut().0.fill(0);
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)?;

        let t = now();
        let inode = Inode {
            i_mode: mode,
            i_uid: uid,
            i_gid: gid,
            i_size: if is_dir { layout::BLOCK_SIZE as u32 } else { 0 },
            i_ctime: t,
            i_atime: t,
            i_mtime: t,
            i_blocks: 1,
            i_nlink: if is_dir { 2 } else { 1 },
            ei_block,
            xattr_block: 0,
            i_data: [0; 28],
        };
        self.write_inode(ino, &inode)?;
        if let Err(err) = self.add_entry(dir_ino, name, ino) {
            self.alloc.free_blocks(ei_block, 1);
            self.alloc.free_inode(ino);
            return Err(err);
        }
        if is_dir {
            let mut parent = self.read_inode(dir_ino)?;
            parent.i_nlink += 1;
            self.write_inode(dir_ino, &parent)?;
        }
        Ok(ino)
    }

    /// Creates a symbolic link to `target`. The target is stored inline in
    /// the inode and is limited to 27 bytes.
    pub fn symlink(&self, dir_ino: u32, name: &str, target: &str) -> FsResult<u32> {
        if target.is_empty() || target.len() > SYMLINK_LEN {
            return Err(FsError::InvalidArgument);
        }
        let ino = self.create(dir_ino, name, S_IFLNK | 0o777, 0, 0)?;
        let mut inode = self.read_inode(ino)?;
        inode.i_data[..target.len()].copy_from_slice(target.as_bytes());
        inode.i_size = target.len() as u32;
        self.write_inode(ino, &inode)?;
        Ok(ino)
    }

    /// Reads the target of a symbolic link.
    pub fn read_link(&self, ino: u32) -> FsResult<String> {
        let inode = self.read_inode(ino)?;
        if inode.i_mode & S_IFMT != S_IFLNK {
            return Err(FsError::InvalidArgument);
        }
        let len = (inode.i_size as usize).min(SYMLINK_LEN);
        Ok(String::from_utf8_lossy(&inode.i_data[..len]).into_owned())
    }

    /// Removes the entry `name` from the directory. When the last link
    /// drops, the inode and all its blocks are released.
    pub fn unlink(&self, dir_ino: u32, name: &str) -> FsResult<()> {
        check_name(name)?;
        let dir = self.require_dir(dir_ino)?;
        let Some((n, ino)) = self.find_entry(&dir, name)? else {
            return Err(FsError::NotFound);
        };
        let mut inode = self.read_inode(ino)?;
        let is_dir = inode.i_mode & S_IFMT == S_IFDIR;
        if is_dir && self.dir_nr_files(inode.ei_block)? != 0 {
            // Only empty directories can be removed
            return Err(FsError::InvalidArgument);
        }
        // Keep the entry array dense: move the last entry into the hole
        let nr_files = self.dir_nr_files(dir.ei_block)?;
        let last = nr_files - 1;
        if n != last {
            let moved = self.read_dir_entry(&dir, last)?;
            self.write_dir_entry(&dir, n, &moved)?;
        }
        self.write_dir_entry(
            &dir,
            last,
            &FileEntry {
                inode: 0,
                filename: [0; FILENAME_LEN + 1],
            },
        )?;
        self.set_dir_nr_files(dir.ei_block, last)?;

        if is_dir {
            let mut parent = self.read_inode(dir_ino)?;
            parent.i_nlink -= 1;
            self.write_inode(dir_ino, &parent)?;
            inode.i_nlink = 0;
        } else {
            inode.i_nlink -= 1;
        }
        if inode.i_nlink == 0 {
            // Release data blocks, xattrs, the index block and the inode
            self.truncate(ino, 0)?;
            self.free_xattr_blocks(ino)?;
            self.alloc.free_blocks(inode.ei_block, 1);
            self.alloc.free_inode(ino);
            self.write_inode(ino, &Inode::default())?;
        } else {
            inode.i_ctime = now();
            self.write_inode(ino, &inode)?;
        }
        let mut parent = self.read_inode(dir_ino)?;
        let t = now();
        parent.i_mtime = t;
        parent.i_ctime = t;
        self.write_inode(dir_ino, &parent)
    }
}
