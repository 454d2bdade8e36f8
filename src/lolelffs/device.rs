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

//! Block device adapter.
//!
//! Translates logical block numbers into byte offsets in the backing file,
//! adding the mount-time section offset, and owns the buffer cache. A read
//! hands out a reference-counted buffer handle; writers mutate the buffer in
//! place, mark it dirty and sync it. Failures surface as I/O errors and are
//! never retried here.

use crate::error::FsResult;
use crate::layout::BLOCK_SIZE;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of cached buffers above which clean, unreferenced buffers are
/// dropped.
const CACHE_HIGH_WATER: usize = 1024;

/// One block's worth of data, aligned so that on-disk records can be
/// reinterpreted in place.
#[repr(C, align(8))]
pub struct BlockData(pub [u8; BLOCK_SIZE]);

impl BlockData {
    fn zeroed() -> Box<Self> {
        Box::new(BlockData([0; BLOCK_SIZE]))
    }
}

/// A cached block buffer. Handles are reference-counted; the dirty bit is
/// set by writers and cleared by the device when the buffer is synced.
pub struct Buffer {
    /// The buffer's logical block number.
    block: u32,
    data: RwLock<Box<BlockData>>,
    dirty: AtomicBool,
}

impl Buffer {
    /// Returns the buffer's logical block number.
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Borrows the block contents for reading.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<BlockData>> {
        self.data.read().unwrap()
    }

    /// Borrows the block contents for writing. The caller is responsible for
    /// marking the buffer dirty afterwards.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<BlockData>> {
        self.data.write().unwrap()
    }

    /// Marks the buffer as needing writeback.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Tells whether the buffer needs writeback.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// The block device adapter: a backing file plus the block offset of the
/// filesystem region within it.
pub struct BlockDevice {
    file: Mutex<File>,
    /// Offset of the filesystem region, in blocks. Zero for raw images,
    /// nonzero when the image is embedded in an ELF section.
    fs_offset: u32,
    cache: Mutex<HashMap<u32, Arc<Buffer>>>,
}

impl BlockDevice {
    /// Creates an adapter over `file`, with the filesystem region starting
    /// at block `fs_offset`.
    pub fn new(file: File, fs_offset: u32) -> Self {
        Self {
            file: Mutex::new(file),
            fs_offset,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the block offset of the filesystem region.
    pub fn fs_offset(&self) -> u32 {
        self.fs_offset
    }

    /// Byte offset of block `block` in the backing file.
    fn byte_offset(&self, block: u32) -> u64 {
        (block as u64 + self.fs_offset as u64) * BLOCK_SIZE as u64
    }

    /// Returns a handle on the buffer for block `block`, reading it from the
    /// backing file on a cache miss.
    pub fn read_block(&self, block: u32) -> FsResult<Arc<Buffer>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(buf) = cache.get(&block) {
            return Ok(buf.clone());
        }
        if cache.len() >= CACHE_HIGH_WATER {
            cache.retain(|_, buf| buf.is_dirty() || Arc::strong_count(buf) > 1);
        }
        let mut data = BlockData::zeroed();
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(self.byte_offset(block)))?;
            file.read_exact(&mut data.0)?;
        }
        let buf = Arc::new(Buffer {
            block,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        });
        cache.insert(block, buf.clone());
        Ok(buf)
    }

    /// Writes the buffer back to the backing file if it is dirty.
    pub fn sync_buffer(&self, buf: &Buffer) -> FsResult<()> {
        if !buf.is_dirty() {
            return Ok(());
        }
        let data = buf.data();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.byte_offset(buf.block)))?;
        file.write_all(&data.0)?;
        file.flush()?;
        buf.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Drains every dirty buffer to the backing file.
    pub fn sync_all(&self) -> FsResult<()> {
        let bufs: Vec<Arc<Buffer>> = {
            let cache = self.cache.lock().unwrap();
            cache.values().filter(|b| b.is_dirty()).cloned().collect()
        };
        for buf in bufs {
            self.sync_buffer(&buf)?;
        }
        let file = self.file.lock().unwrap();
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn scratch_device(blocks: u32) -> BlockDevice {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; blocks as usize * BLOCK_SIZE])
            .unwrap();
        BlockDevice::new(file, 0)
    }

    #[test]
    fn read_write_sync() {
        let dev = scratch_device(4);
        let buf = dev.read_block(2).unwrap();
        {
            let mut data = buf.data_mut();
            data.0[0] = 0xAB;
            data.0[BLOCK_SIZE - 1] = 0xCD;
        }
        buf.mark_dirty();
        dev.sync_buffer(&buf).unwrap();
        assert!(!buf.is_dirty());
        // Re-read through a fresh cache
        let dev2 = BlockDevice::new(dev.file.into_inner().unwrap(), 0);
        let buf2 = dev2.read_block(2).unwrap();
        let data = buf2.data();
        assert_eq!(data.0[0], 0xAB);
        assert_eq!(data.0[BLOCK_SIZE - 1], 0xCD);
    }

    #[test]
    fn offset_applied() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; 8 * BLOCK_SIZE]).unwrap();
        file.seek(SeekFrom::Start(3 * BLOCK_SIZE as u64)).unwrap();
        file.write_all(&[0x42]).unwrap();
        let dev = BlockDevice::new(file, 3);
        let buf = dev.read_block(0).unwrap();
        assert_eq!(buf.data().0[0], 0x42);
    }

    #[test]
    fn cache_returns_same_buffer() {
        let dev = scratch_device(2);
        let a = dev.read_block(1).unwrap();
        let b = dev.read_block(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
