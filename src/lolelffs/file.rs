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

//! File data I/O.
//!
//! The read path walks the extent index, fetches the physical block and runs
//! it through decrypt-then-decompress; the write path compresses, encrypts,
//! commits the payload and then updates the extent's transform metadata, so
//! a crash never leaves a descriptor pointing at an unwritten block.

use crate::error::{FsError, FsResult};
use crate::extent::{self, ExtentLookup};
use crate::fs::LolElfFs;
use crate::inode::now;
use crate::layout::{
    self, AEAD_MAX_EXTENT_BLOCKS, AEAD_TAG_SIZE, BLOCK_SIZE, COMP_NONE, ENC_NONE, EXT_COMPRESSED,
    EXT_ENCRYPTED, EXT_HAS_META, ExtentIndexBlock, MAX_FILE_BLOCKS, MAX_FILESIZE,
};
use crate::{compress, crypt};

/// Resolved location and transform metadata of one file block.
struct Mapping {
    phys: u32,
    /// Index of the covering extent in the file's index block.
    extent_idx: usize,
    /// Block offset within the extent.
    in_extent: u32,
    comp_algo: u16,
    enc_algo: u8,
    meta: u32,
}

impl LolElfFs {
    /// Copies the volume master key out of the encryption state, failing
    /// with `PermissionDenied` while the volume is locked.
    fn master_key(&self) -> FsResult<[u8; 32]> {
        let enc = self.enc.lock().unwrap();
        if !enc.unlocked {
            log::error!("cannot access encrypted block: filesystem is locked");
            return Err(FsError::PermissionDenied);
        }
        Ok(enc.master_key)
    }

    /// Reads the stored AEAD tag of the block at `in_extent` within the
    /// extent whose metadata block is `meta`.
    fn read_tag(&self, meta: u32, in_extent: u32) -> FsResult<[u8; AEAD_TAG_SIZE]> {
        let buf = self.dev.read_block(meta)?;
        let data = buf.data();
        let off = in_extent as usize * AEAD_TAG_SIZE;
        let mut tag = [0u8; AEAD_TAG_SIZE];
        tag.copy_from_slice(&data.0[off..off + AEAD_TAG_SIZE]);
        Ok(tag)
    }

    /// Stores an AEAD tag in the extent's metadata block.
    fn write_tag(&self, meta: u32, in_extent: u32, tag: &[u8; AEAD_TAG_SIZE]) -> FsResult<()> {
        let buf = self.dev.read_block(meta)?;
        {
            let mut data = buf.data_mut();
            let off = in_extent as usize * AEAD_TAG_SIZE;
            data.0[off..off + AEAD_TAG_SIZE].copy_from_slice(tag);
        }
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)
    }

    /// Locates the extent mapping of `iblock`, or `None` when the block has
    /// no extent yet (sparse read).
    fn map_block(&self, ei_block: u32, iblock: u32) -> FsResult<Option<Mapping>> {
        let ei_buf = self.dev.read_block(ei_block)?;
        let data = ei_buf.data();
        let index = layout::reinterpret::<ExtentIndexBlock>(&data.0);
        match extent::locate(index, iblock) {
            ExtentLookup::Found(idx) => {
                let ext = &index.extents[idx];
                let in_extent = iblock - ext.logical;
                Ok(Some(Mapping {
                    phys: ext.start + in_extent,
                    extent_idx: idx,
                    in_extent,
                    comp_algo: ext.comp_algo,
                    enc_algo: ext.enc_algo,
                    meta: ext.meta,
                }))
            }
            ExtentLookup::Gap(_) | ExtentLookup::Full => Ok(None),
        }
    }

    /// Reads the logical block `iblock` of the file `ino` into `out`,
    /// running the decrypt-then-decompress pipeline. A block with no extent
    /// reads as zeros.
    pub fn read_file_block(&self, ino: u32, iblock: u32, out: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        if iblock >= MAX_FILE_BLOCKS {
            return Err(FsError::FileTooBig);
        }
        let inode = self.read_inode(ino)?;
        let Some(map) = self.map_block(inode.ei_block, iblock)? else {
            out.fill(0);
            return Ok(());
        };
        let mut scratch = [0u8; BLOCK_SIZE];
        {
            let buf = self.dev.read_block(map.phys)?;
            scratch.copy_from_slice(&buf.data().0);
        }
        if map.enc_algo != ENC_NONE {
            if !crypt::supported(map.enc_algo) {
                return Err(FsError::Unsupported);
            }
            let key = self.master_key()?;
            let tag = if crypt::tag_size(map.enc_algo) > 0 {
                if map.meta == 0 {
                    // An AEAD extent without its tag block cannot authenticate
                    return Err(FsError::CryptoFailure);
                }
                Some(self.read_tag(map.meta, map.in_extent)?)
            } else {
                None
            };
            crypt::decrypt_block(map.enc_algo, &key, iblock as u64, &mut scratch, tag.as_ref())?;
        }
        if map.comp_algo != COMP_NONE {
            if !compress::supported(map.comp_algo) {
                return Err(FsError::Unsupported);
            }
            compress::decompress_block(map.comp_algo, &scratch, out)?;
        } else {
            out.copy_from_slice(&scratch);
        }
        Ok(())
    }

    /// Resolves the physical block for a write, allocating fresh extents
    /// until `iblock` is covered.
    ///
    /// Logical coverage is contiguous: writing past the current end of the
    /// file materialises the hole, one adaptive-size extent at a time.
    fn get_or_alloc_block(&self, ino: u32, iblock: u32) -> FsResult<Mapping> {
        loop {
            let inode = self.read_inode(ino)?;
            if let Some(map) = self.map_block(inode.ei_block, iblock)? {
                return Ok(map);
            }
            self.alloc_next_extent(ino)?;
        }
    }

    /// Appends one extent to the file, continuing its logical coverage.
    fn alloc_next_extent(&self, ino: u32) -> FsResult<()> {
        let inode = self.read_inode(ino)?;
        let ei_buf = self.dev.read_block(inode.ei_block)?;
        let slot = {
            let data = ei_buf.data();
            let index = layout::reinterpret::<ExtentIndexBlock>(&data.0);
            extent::count(index)
        };
        if slot == layout::MAX_EXTENTS {
            return Err(FsError::FileTooBig);
        }
        // Adaptive sizing, capped so AEAD tags fit one metadata block
        let mut max_per_extent = self.sb.max_extent_blocks;
        if self.sb.enc_enabled != 0 && crypt::tag_size(self.sb.enc_default_algo as u8) > 0 {
            max_per_extent = max_per_extent.min(AEAD_MAX_EXTENT_BLOCKS);
        }
        let alloc_size = self.alloc.choose_alloc_size(inode.i_blocks, max_per_extent);
        // Allocate close to the previous extent to keep the file contiguous
        let hint = {
            let data = ei_buf.data();
            let index = layout::reinterpret::<ExtentIndexBlock>(&data.0);
            if slot > 0 {
                let prev = &index.extents[slot - 1];
                prev.start + prev.len
            } else {
                0
            }
        };
        let start = self.alloc.alloc_blocks_near(hint, alloc_size);
        if start == 0 {
            return Err(FsError::NoSpace);
        }
        // Fresh data blocks must read back as zeros until written
        for i in 0..alloc_size {
            let buf = self.dev.read_block(start + i)?;
            buf.data_mut().0.fill(0);
            buf.mark_dirty();
            self.dev.sync_buffer(&buf)?;
        }
        {
            let mut data = ei_buf.data_mut();
            let index = layout::reinterpret_mut::<ExtentIndexBlock>(&mut data.0);
            extent::fill_slot(index, slot, start, alloc_size);
        }
        ei_buf.mark_dirty();
        self.dev.sync_buffer(&ei_buf)?;
        // Account the new run in the inode
        let mut inode = self.read_inode(ino)?;
        inode.i_blocks += alloc_size;
        self.write_inode(ino, &inode)
    }

    /// Writes the logical block `iblock` of the file `ino`, running the
    /// compress-then-encrypt pipeline and updating the extent's transform
    /// metadata afterwards.
    pub fn write_file_block(&self, ino: u32, iblock: u32, src: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        if iblock >= MAX_FILE_BLOCKS {
            return Err(FsError::FileTooBig);
        }
        let map = self.get_or_alloc_block(ino, iblock)?;
        let mut scratch = *src;
        let mut used_comp = COMP_NONE;
        let mut used_enc = ENC_NONE;
        let mut flags = 0u16;
        let mut meta = map.meta;

        // Step 1: compress if enabled and the block is worth it
        let comp_algo = if self.sb.comp_enabled != 0 {
            self.sb.comp_default_algo as u16
        } else {
            COMP_NONE
        };
        if comp_algo != COMP_NONE
            && compress::supported(comp_algo)
            && src.len() >= self.sb.comp_min_block_size as usize
        {
            let mut comp_buf = [0u8; BLOCK_SIZE];
            if let Ok(comp_size) = compress::compress_block(comp_algo, src, &mut comp_buf)
                && comp_size < BLOCK_SIZE * 95 / 100
            {
                // Compression saved at least 5%: keep it, zero-padded
                scratch[..comp_size].copy_from_slice(&comp_buf[..comp_size]);
                scratch[comp_size..].fill(0);
                used_comp = comp_algo;
                flags |= EXT_COMPRESSED;
            }
        }

        // Step 2: encrypt if enabled (compress-then-encrypt)
        let enc_algo = if self.sb.enc_enabled != 0 {
            self.sb.enc_default_algo as u8
        } else {
            ENC_NONE
        };
        let mut tag = None;
        if enc_algo != ENC_NONE {
            if !crypt::supported(enc_algo) {
                return Err(FsError::Unsupported);
            }
            let key = self.master_key()?;
            tag = crypt::encrypt_block(enc_algo, &key, iblock as u64, &mut scratch)?;
            used_enc = enc_algo;
            flags |= EXT_ENCRYPTED;
        }

        // Commit the payload before any metadata update
        {
            let buf = self.dev.read_block(map.phys)?;
            buf.data_mut().0.copy_from_slice(&scratch);
            buf.mark_dirty();
            self.dev.sync_buffer(&buf)?;
        }

        // Store the detached tag, allocating the metadata block on first use
        if let Some(tag) = &tag {
            if meta == 0 {
                meta = self.alloc.alloc_blocks(1);
                if meta == 0 {
                    return Err(FsError::NoSpace);
                }
                let buf = self.dev.read_block(meta)?;
                buf.data_mut().0.fill(0);
                buf.mark_dirty();
                self.dev.sync_buffer(&buf)?;
            }
            flags |= EXT_HAS_META;
            self.write_tag(meta, map.in_extent, tag)?;
        }

        // Write back the extent descriptor if any algorithm field changed
        let inode = self.read_inode(ino)?;
        let ei_buf = self.dev.read_block(inode.ei_block)?;
        let changed = {
            let data = ei_buf.data();
            let index = layout::reinterpret::<ExtentIndexBlock>(&data.0);
            let ext = &index.extents[map.extent_idx];
            ext.comp_algo != used_comp
                || ext.enc_algo != used_enc
                || ext.flags != flags
                || ext.meta != meta
        };
        if changed {
            let mut data = ei_buf.data_mut();
            let index = layout::reinterpret_mut::<ExtentIndexBlock>(&mut data.0);
            let ext = &mut index.extents[map.extent_idx];
            ext.comp_algo = used_comp;
            ext.enc_algo = used_enc;
            ext.flags = flags;
            ext.meta = meta;
            drop(data);
            ei_buf.mark_dirty();
            self.dev.sync_buffer(&ei_buf)?;
        }
        Ok(())
    }

    /// Resolves the physical block backing logical block `iblock`, without
    /// allocating.
    pub(crate) fn resolve_block(&self, ei_block: u32, iblock: u32) -> FsResult<Option<u32>> {
        Ok(self.map_block(ei_block, iblock)?.map(|m| m.phys))
    }

    /// Makes sure logical block `iblock` of `ino` is backed by an extent and
    /// returns its physical block.
    pub(crate) fn alloc_file_block(&self, ino: u32, iblock: u32) -> FsResult<u32> {
        Ok(self.get_or_alloc_block(ino, iblock)?.phys)
    }

    /// Number of used extents in the file's index. The rollback baseline
    /// recorded before a write.
    pub(crate) fn extent_count(&self, ino: u32) -> FsResult<usize> {
        let inode = self.read_inode(ino)?;
        let ei_buf = self.dev.read_block(inode.ei_block)?;
        let data = ei_buf.data();
        Ok(extent::count(layout::reinterpret::<ExtentIndexBlock>(&data.0)))
    }

    /// Frees every extent allocated after `nr_extents_before` and zeroes its
    /// slot. Fired when a prepared write fails.
    pub(crate) fn rollback_extents(&self, ino: u32, nr_extents_before: usize) -> FsResult<()> {
        let inode = self.read_inode(ino)?;
        let ei_buf = self.dev.read_block(inode.ei_block)?;
        let mut freed = 0u32;
        {
            let mut data = ei_buf.data_mut();
            let index = layout::reinterpret_mut::<ExtentIndexBlock>(&mut data.0);
            for i in nr_extents_before..layout::MAX_EXTENTS {
                let ext = index.extents[i];
                if ext.start == 0 {
                    break;
                }
                self.alloc.free_blocks(ext.start, ext.len);
                if ext.meta != 0 {
                    self.alloc.free_blocks(ext.meta, 1);
                }
                freed += ext.len;
                index.extents[i] = Default::default();
            }
        }
        ei_buf.mark_dirty();
        self.dev.sync_buffer(&ei_buf)?;
        if freed != 0 {
            let mut inode = self.read_inode(ino)?;
            inode.i_blocks -= freed;
            self.write_inode(ino, &inode)?;
        }
        Ok(())
    }

    /// Reads up to `out.len()` bytes at byte offset `pos`, stopping at the
    /// end of the file. Returns the number of bytes read.
    pub fn read_file(&self, ino: u32, pos: u64, out: &mut [u8]) -> FsResult<usize> {
        let inode = self.read_inode(ino)?;
        let size = inode.i_size as u64;
        if pos >= size {
            return Ok(0);
        }
        let len = out.len().min((size - pos) as usize);
        let mut done = 0;
        let mut scratch = [0u8; BLOCK_SIZE];
        while done < len {
            let cur = pos + done as u64;
            let iblock = (cur / BLOCK_SIZE as u64) as u32;
            let in_block = (cur % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            self.read_file_block(ino, iblock, &mut scratch)?;
            out[done..done + chunk].copy_from_slice(&scratch[in_block..in_block + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `data` at byte offset `pos`, growing the file as needed.
    ///
    /// The operation either commits fully or, when preparing a block fails,
    /// rolls back every extent it allocated and leaves the file as it was.
    pub fn write_file(&self, ino: u32, pos: u64, data: &[u8]) -> FsResult<usize> {
        let end = pos + data.len() as u64;
        if end > MAX_FILESIZE || end > u32::MAX as u64 {
            return Err(FsError::NoSpace);
        }
        let mut inode = self.read_inode(ino)?;
        // Cheap exhaustion precheck before touching anything
        let nr_blocks_needed = (end.max(inode.i_size as u64)).div_ceil(BLOCK_SIZE as u64) as u32;
        let nr_allocs = nr_blocks_needed.saturating_sub(inode.i_blocks.saturating_sub(1));
        if nr_allocs > self.alloc.free_blocks_count() {
            return Err(FsError::NoSpace);
        }
        let nr_extents_before = self.extent_count(ino)?;
        let result = self.do_write(ino, pos, data);
        if let Err(err) = result {
            self.rollback_extents(ino, nr_extents_before)?;
            return Err(err);
        }
        // Update inode metadata
        inode = self.read_inode(ino)?;
        if end as u32 > inode.i_size {
            inode.i_size = end as u32;
        }
        let t = now();
        inode.i_mtime = t;
        inode.i_ctime = t;
        self.write_inode(ino, &inode)?;
        Ok(data.len())
    }

    fn do_write(&self, ino: u32, pos: u64, data: &[u8]) -> FsResult<()> {
        let mut done = 0;
        let mut scratch = [0u8; BLOCK_SIZE];
        while done < data.len() {
            let cur = pos + done as u64;
            let iblock = (cur / BLOCK_SIZE as u64) as u32;
            let in_block = (cur % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(data.len() - done);
            if in_block != 0 || chunk != BLOCK_SIZE {
                // Partial block: read-modify-write
                self.read_file_block(ino, iblock, &mut scratch)?;
            }
            scratch[in_block..in_block + chunk].copy_from_slice(&data[done..done + chunk]);
            self.write_file_block(ino, iblock, &scratch)?;
            done += chunk;
        }
        Ok(())
    }

    /// Shrinks or extends the file to `new_size` bytes. Shrinking frees
    /// every extent past the new last block; a partially covering extent is
    /// kept whole.
    pub fn truncate(&self, ino: u32, new_size: u32) -> FsResult<()> {
        let mut inode = self.read_inode(ino)?;
        let new_blocks = (new_size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
        let ei_buf = self.dev.read_block(inode.ei_block)?;
        let mut freed = 0u32;
        {
            let mut data = ei_buf.data_mut();
            let index = layout::reinterpret_mut::<ExtentIndexBlock>(&mut data.0);
            let first_freed = if new_blocks == 0 {
                0
            } else {
                match extent::locate(index, new_blocks - 1) {
                    // Keep the extent covering the last block, free from the
                    // one after
                    ExtentLookup::Found(idx) => idx + 1,
                    ExtentLookup::Gap(_) | ExtentLookup::Full => layout::MAX_EXTENTS,
                }
            };
            for i in first_freed..layout::MAX_EXTENTS {
                let ext = index.extents[i];
                if ext.start == 0 {
                    break;
                }
                self.alloc.free_blocks(ext.start, ext.len);
                if ext.meta != 0 {
                    self.alloc.free_blocks(ext.meta, 1);
                }
                freed += ext.len;
                index.extents[i] = Default::default();
            }
        }
        ei_buf.mark_dirty();
        self.dev.sync_buffer(&ei_buf)?;
        inode.i_blocks -= freed;
        inode.i_size = new_size;
        let t = now();
        inode.i_mtime = t;
        inode.i_ctime = t;
        self.write_inode(ino, &inode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::{LolElfFs, ROOT_INO};
    use crate::inode::S_IFREG;
    use crate::layout::{COMP_LZ4, Extent};
    use crate::mkfs::{EncParams, FsBuilder};
    use crate::testutil::{default_image, format_image, mount};

    fn new_file(fs: &LolElfFs, name: &str) -> u32 {
        fs.create(ROOT_INO, name, S_IFREG | 0o644, 0, 0).unwrap()
    }

    fn extents_of(fs: &LolElfFs, ino: u32) -> Vec<Extent> {
        let inode = fs.read_inode(ino).unwrap();
        let buf = fs.dev.read_block(inode.ei_block).unwrap();
        let data = buf.data();
        let index = layout::reinterpret::<ExtentIndexBlock>(&data.0);
        index.extents[..extent::count(index)].to_vec()
    }

    fn incompressible_block() -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let mut state = 0xDEADBEEFu32;
        for b in &mut block {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (state >> 24) as u8;
        }
        block
    }

    #[test]
    fn sparse_read_returns_zeros() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "sparse");
        let mut out = [0xFFu8; BLOCK_SIZE];
        fs.read_file_block(ino, 7, &mut out).unwrap();
        assert_eq!(out, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn compressed_round_trip() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "zeros");
        fs.write_file_block(ino, 0, &[0u8; BLOCK_SIZE]).unwrap();
        let exts = extents_of(&fs, ino);
        assert_eq!(exts[0].comp_algo, COMP_LZ4);
        assert_ne!(exts[0].flags & EXT_COMPRESSED, 0);
        let mut out = [0xFFu8; BLOCK_SIZE];
        fs.read_file_block(ino, 0, &mut out).unwrap();
        assert_eq!(out, [0u8; BLOCK_SIZE]);
    }

    #[test]
    fn incompressible_block_stored_raw() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "noise");
        let block = incompressible_block();
        fs.write_file_block(ino, 0, &block).unwrap();
        let exts = extents_of(&fs, ino);
        assert_eq!(exts[0].comp_algo, COMP_NONE);
        assert_eq!(exts[0].flags & EXT_COMPRESSED, 0);
        let mut out = [0u8; BLOCK_SIZE];
        fs.read_file_block(ino, 0, &mut out).unwrap();
        assert_eq!(out, block);
    }

    #[test]
    fn adaptive_extent_growth() {
        let tmp = default_image(1024);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "grow");
        let block = incompressible_block();
        for iblock in 0..36 {
            fs.write_file_block(ino, iblock, &block).unwrap();
        }
        let exts = extents_of(&fs, ino);
        // Small file: 2-block extents, then 4-block ones, then the cap
        assert_eq!(exts[0].len, 2);
        assert_eq!(exts[1].len, 2);
        assert_eq!(exts[2].len, 2);
        assert_eq!(exts[3].len, 2);
        for ext in &exts[4..10] {
            assert_eq!(ext.len, 4);
        }
        // Past 32 blocks the policy asks for the cap, clamped to free space
        assert!(exts[10].len > 4);
        assert!(extent::validate(layout::reinterpret::<ExtentIndexBlock>(
            &fs.dev
                .read_block(fs.read_inode(ino).unwrap().ei_block)
                .unwrap()
                .data()
                .0
        ))
        .is_ok());
        // The inode accounts every allocated block plus the index block
        let inode = fs.read_inode(ino).unwrap();
        let total: u32 = exts.iter().map(|e| e.len).sum();
        assert_eq!(inode.i_blocks, total + 1);
    }

    #[test]
    fn file_too_big() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "big");
        let mut out = [0u8; BLOCK_SIZE];
        assert!(matches!(
            fs.read_file_block(ino, MAX_FILE_BLOCKS, &mut out),
            Err(FsError::FileTooBig)
        ));
        assert!(matches!(
            fs.write_file_block(ino, MAX_FILE_BLOCKS, &out),
            Err(FsError::FileTooBig)
        ));
    }

    #[test]
    fn byte_level_round_trip() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "bytes");
        // An unaligned write spanning a block boundary
        let payload: Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
        fs.write_file(ino, 1000, &payload).unwrap();
        assert_eq!(fs.read_inode(ino).unwrap().i_size, 11000);
        let mut out = vec![0u8; payload.len()];
        assert_eq!(fs.read_file(ino, 1000, &mut out).unwrap(), payload.len());
        assert_eq!(out, payload);
        // The hole before the payload reads as zeros
        let mut head = [0xFFu8; 100];
        fs.read_file(ino, 0, &mut head).unwrap();
        assert_eq!(head, [0u8; 100]);
    }

    #[test]
    fn truncate_frees_extents() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "shrink");
        let block = incompressible_block();
        for iblock in 0..12 {
            fs.write_file_block(ino, iblock, &block).unwrap();
        }
        let free_before = fs.alloc.free_blocks_count();
        let total_before: u32 = extents_of(&fs, ino).iter().map(|e| e.len).sum();
        // Keep two blocks: only the first extent survives
        fs.truncate(ino, 2 * BLOCK_SIZE as u32).unwrap();
        let exts = extents_of(&fs, ino);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].len, 2);
        assert_eq!(
            fs.alloc.free_blocks_count(),
            free_before + total_before - 2
        );
        assert_eq!(fs.read_inode(ino).unwrap().i_blocks, 3);
        // Truncating to zero releases everything
        fs.truncate(ino, 0).unwrap();
        assert!(extents_of(&fs, ino).is_empty());
        assert_eq!(fs.read_inode(ino).unwrap().i_blocks, 1);
    }

    #[test]
    fn rollback_frees_new_extents() {
        let tmp = default_image(512);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "rollback");
        let block = incompressible_block();
        fs.write_file_block(ino, 0, &block).unwrap();
        let baseline = fs.extent_count(ino).unwrap();
        let free_baseline = fs.alloc.free_blocks_count();
        for iblock in 2..6 {
            fs.write_file_block(ino, iblock, &block).unwrap();
        }
        assert!(fs.extent_count(ino).unwrap() > baseline);
        fs.rollback_extents(ino, baseline).unwrap();
        assert_eq!(fs.extent_count(ino).unwrap(), baseline);
        assert_eq!(fs.alloc.free_blocks_count(), free_baseline);
    }

    #[test]
    fn write_past_free_space_fails_cleanly() {
        let tmp = default_image(128);
        let fs = mount(&tmp);
        let ino = new_file(&fs, "huge");
        let free = fs.alloc.free_blocks_count() as usize;
        let data = vec![0xAAu8; (free + 2) * BLOCK_SIZE];
        assert!(matches!(
            fs.write_file(ino, 0, &data),
            Err(FsError::NoSpace)
        ));
        assert_eq!(fs.extent_count(ino).unwrap(), 0);
        assert_eq!(fs.read_inode(ino).unwrap().i_size, 0);
    }

    #[test]
    fn aead_round_trip_with_meta_block() {
        let builder = FsBuilder {
            encryption: Some(EncParams {
                algo: layout::ENC_CHACHA20_POLY,
                kdf: layout::KDF_PBKDF2,
                iterations: 100,
                password: "tag".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let tmp = format_image(512, &builder);
        let fs = mount(&tmp);
        fs.unlock(b"tag").unwrap();
        let ino = new_file(&fs, "sealed");
        let block = incompressible_block();
        fs.write_file_block(ino, 0, &block).unwrap();
        let exts = extents_of(&fs, ino);
        assert_ne!(exts[0].flags & EXT_ENCRYPTED, 0);
        assert_ne!(exts[0].flags & EXT_HAS_META, 0);
        assert_ne!(exts[0].meta, 0);
        // AEAD extents are capped so every tag fits the metadata block
        assert!(exts[0].len <= AEAD_MAX_EXTENT_BLOCKS);
        let mut out = [0u8; BLOCK_SIZE];
        fs.read_file_block(ino, 0, &mut out).unwrap();
        assert_eq!(out, block);
        // Corrupting the stored tag must break authentication
        let meta_buf = fs.dev.read_block(exts[0].meta).unwrap();
        meta_buf.data_mut().0[0] ^= 0xFF;
        meta_buf.mark_dirty();
        fs.dev.sync_buffer(&meta_buf).unwrap();
        assert!(matches!(
            fs.read_file_block(ino, 0, &mut out),
            Err(FsError::CryptoFailure)
        ));
    }

    #[test]
    fn xts_on_disk_is_ciphertext() {
        let builder = FsBuilder {
            encryption: Some(EncParams {
                kdf: layout::KDF_PBKDF2,
                iterations: 100,
                password: "xts".into(),
                ..Default::default()
            }),
            comp_enabled: false,
            ..Default::default()
        };
        let tmp = format_image(512, &builder);
        let fs = mount(&tmp);
        fs.unlock(b"xts").unwrap();
        let ino = new_file(&fs, "cipher");
        let block = [0x5Au8; BLOCK_SIZE];
        fs.write_file_block(ino, 0, &block).unwrap();
        let exts = extents_of(&fs, ino);
        let raw = fs.dev.read_block(exts[0].start).unwrap();
        assert_ne!(raw.data().0.as_slice(), block.as_slice());
        let mut out = [0u8; BLOCK_SIZE];
        fs.read_file_block(ino, 0, &mut out).unwrap();
        assert_eq!(out, block);
    }
}
