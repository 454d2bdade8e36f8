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

//! Filesystem consistency checker.
//!
//! Verifies the superblock, the free-count agreement between the superblock
//! and both bitmaps, the root inode, and the extent structures of every
//! allocated inode. Read-only; reporting is line-oriented like the other
//! tools.

use crate::device::BlockData;
use crate::elf;
use crate::error::{FsError, FsResult};
use crate::extent;
use crate::inode::{S_IFDIR, S_IFMT};
use crate::layout::{
    self, BLOCK_SIZE, COMP_NONE, COMP_ZSTD, ENC_CHACHA20_POLY, ENC_NONE, EXT_COMPRESSED,
    EXT_ENCRYPTED, ExtentIndexBlock, INODES_PER_BLOCK, Inode, KDF_ARGON2ID, KDF_NONE, KDF_PBKDF2,
    MAGIC, MAX_SUBFILES, Superblock, VERSION,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Result of a consistency check.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsckReport {
    pub errors: u32,
    pub warnings: u32,
}

impl FsckReport {
    /// Tells whether the image came out without errors or warnings.
    pub fn clean(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

struct Checker {
    file: File,
    base: u64,
    sb: Superblock,
    verbose: bool,
    errors: u32,
    warnings: u32,
}

impl Checker {
    fn error(&mut self, msg: std::fmt::Arguments<'_>) {
        eprintln!("ERROR: {msg}");
        self.errors += 1;
    }

    fn warn(&mut self, msg: std::fmt::Arguments<'_>) {
        eprintln!("WARNING: {msg}");
        self.warnings += 1;
    }

    fn info(&self, msg: std::fmt::Arguments<'_>) {
        if self.verbose {
            println!("INFO: {msg}");
        }
    }

    fn read_block(&mut self, block: u32) -> FsResult<Box<BlockData>> {
        let mut data = Box::new(BlockData([0; BLOCK_SIZE]));
        self.file
            .seek(SeekFrom::Start(self.base + block as u64 * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut data.0)?;
        Ok(data)
    }

    fn metadata_end(&self) -> u32 {
        1 + self.sb.nr_istore_blocks + self.sb.nr_ifree_blocks + self.sb.nr_bfree_blocks
    }

    /// Superblock validity. A failure here aborts the remaining checks.
    fn check_superblock(&mut self) -> FsResult<()> {
        println!("Checking superblock...");
        let sb = self.sb;
        if sb.magic != MAGIC {
            self.error(format_args!(
                "invalid magic number: {:#010x} (expected {MAGIC:#010x})",
                sb.magic
            ));
            return Err(FsError::Corrupted("bad magic"));
        }
        self.info(format_args!("magic number OK"));
        if sb.nr_blocks < 100 {
            self.error(format_args!(
                "invalid block count: {} (minimum 100)",
                sb.nr_blocks
            ));
            return Err(FsError::Corrupted("bad block count"));
        }
        self.info(format_args!("block count: {}", sb.nr_blocks));
        if sb.nr_inodes == 0 {
            self.error(format_args!("invalid inode count: 0"));
            return Err(FsError::Corrupted("bad inode count"));
        }
        if sb.nr_inodes % INODES_PER_BLOCK as u32 != 0 {
            self.warn(format_args!(
                "inode count {} not aligned to a block boundary",
                sb.nr_inodes
            ));
        }
        if sb.version != VERSION {
            self.error(format_args!(
                "unsupported filesystem version: {} (expected {VERSION})",
                sb.version
            ));
            return Err(FsError::Corrupted("bad version"));
        }
        if sb.comp_default_algo > COMP_ZSTD as u32 {
            self.error(format_args!(
                "invalid compression algorithm: {}",
                sb.comp_default_algo
            ));
            return Err(FsError::Corrupted("bad compression algorithm"));
        }
        if sb.max_extent_blocks != layout::MAX_BLOCKS_PER_EXTENT {
            self.warn(format_args!(
                "unexpected max_extent_blocks: {} (expected {})",
                sb.max_extent_blocks,
                layout::MAX_BLOCKS_PER_EXTENT
            ));
        }
        self.info(format_args!(
            "compression: {} (algorithm: {})",
            if sb.comp_enabled != 0 { "enabled" } else { "disabled" },
            sb.comp_default_algo
        ));

        if sb.enc_default_algo > ENC_CHACHA20_POLY as u32 {
            self.error(format_args!(
                "invalid encryption algorithm: {}",
                sb.enc_default_algo
            ));
            return Err(FsError::Corrupted("bad encryption algorithm"));
        }
        if sb.enc_kdf_algo > KDF_PBKDF2 {
            self.error(format_args!("invalid KDF algorithm: {}", sb.enc_kdf_algo));
            return Err(FsError::Corrupted("bad KDF algorithm"));
        }
        if sb.enc_kdf_algo != KDF_NONE {
            if sb.enc_kdf_iterations == 0 {
                self.warn(format_args!("KDF iterations is 0 (insecure)"));
            }
            if sb.enc_kdf_iterations > 1_000_000 {
                self.warn(format_args!(
                    "KDF iterations {} seems excessive",
                    sb.enc_kdf_iterations
                ));
            }
            if sb.enc_kdf_algo == KDF_ARGON2ID {
                if sb.enc_kdf_memory < 1024 {
                    self.warn(format_args!(
                        "Argon2id memory {} KB is very low (insecure)",
                        sb.enc_kdf_memory
                    ));
                }
                if sb.enc_kdf_parallelism == 0 || sb.enc_kdf_parallelism > 256 {
                    self.warn(format_args!(
                        "Argon2id parallelism {} is out of reasonable range",
                        sb.enc_kdf_parallelism
                    ));
                }
            }
        }
        self.info(format_args!(
            "encryption: {} (algorithm: {}, KDF: {})",
            if sb.enc_enabled != 0 { "enabled" } else { "disabled" },
            sb.enc_default_algo,
            sb.enc_kdf_algo
        ));

        // Layout arithmetic
        let expected_istore = sb.nr_inodes / INODES_PER_BLOCK as u32;
        if sb.nr_istore_blocks != expected_istore {
            self.error(format_args!(
                "inode store blocks mismatch: {} (expected {expected_istore})",
                sb.nr_istore_blocks
            ));
        }
        if sb.nr_free_inodes > sb.nr_inodes {
            self.error(format_args!(
                "free inodes ({}) exceed total inodes ({})",
                sb.nr_free_inodes, sb.nr_inodes
            ));
        }
        if sb.nr_free_blocks > sb.nr_blocks {
            self.error(format_args!(
                "free blocks ({}) exceed total blocks ({})",
                sb.nr_free_blocks, sb.nr_blocks
            ));
        }
        let metadata = self.metadata_end();
        let used_blocks = sb.nr_blocks - sb.nr_free_blocks;
        if used_blocks < metadata {
            self.error(format_args!(
                "used blocks ({used_blocks}) less than metadata blocks ({metadata})"
            ));
        }
        self.info(format_args!(
            "layout: superblock(1) + istore({}) + ifree({}) + bfree({}) = {metadata} metadata blocks",
            sb.nr_istore_blocks, sb.nr_ifree_blocks, sb.nr_bfree_blocks
        ));
        println!("  Superblock OK");
        Ok(())
    }

    fn read_inode(&mut self, ino: u32) -> FsResult<Inode> {
        let block = self.read_block(ino / INODES_PER_BLOCK as u32 + 1)?;
        let offset = ino as usize % INODES_PER_BLOCK * std::mem::size_of::<Inode>();
        Ok(*layout::reinterpret::<Inode>(&block.0[offset..]))
    }

    fn check_root_inode(&mut self) -> FsResult<()> {
        println!("Checking root inode...");
        let root = self.read_inode(0)?;
        if root.i_mode & S_IFMT != S_IFDIR {
            self.error(format_args!(
                "root inode is not a directory (mode={:o})",
                root.i_mode
            ));
            return Ok(());
        }
        self.info(format_args!("root is a directory"));
        if root.i_nlink < 2 {
            self.error(format_args!(
                "root inode link count too low: {} (expected >= 2)",
                root.i_nlink
            ));
        }
        if root.i_size != BLOCK_SIZE as u32 {
            self.warn(format_args!(
                "root directory size unexpected: {} (expected {BLOCK_SIZE})",
                root.i_size
            ));
        }
        if root.i_blocks == 0 {
            self.error(format_args!("root inode has 0 blocks"));
        }
        let metadata_end = self.metadata_end();
        if root.ei_block < metadata_end || root.ei_block >= self.sb.nr_blocks {
            let nr_blocks = self.sb.nr_blocks;
            self.error(format_args!(
                "root ei_block {} outside data area [{metadata_end}, {})",
                root.ei_block, nr_blocks
            ));
            return Ok(());
        }
        self.info(format_args!("root extent block: {}", root.ei_block));
        if root.xattr_block != 0
            && (root.xattr_block < metadata_end || root.xattr_block >= self.sb.nr_blocks)
        {
            self.error(format_args!(
                "root xattr_block {} outside data area",
                root.xattr_block
            ));
        }
        println!("  Root inode OK");
        Ok(())
    }

    /// Validates one inode's extent index against invariants 4-6.
    fn check_extent_index(&mut self, ino: u32, ei_block: u32, is_dir: bool) -> FsResult<()> {
        let block = self.read_block(ei_block)?;
        let index = layout::reinterpret::<ExtentIndexBlock>(&block.0);
        if is_dir && index.nr_files > MAX_SUBFILES {
            self.error(format_args!(
                "inode {ino}: file count {} exceeds maximum {MAX_SUBFILES}",
                index.nr_files
            ));
        }
        if let Err(msg) = extent::validate(index) {
            self.error(format_args!("inode {ino}: {msg}"));
        }
        let metadata_end = self.metadata_end();
        for (i, ext) in index.extents[..extent::count(index)].iter().enumerate() {
            self.info(format_args!(
                "inode {ino} extent {i}: start={}, len={}, logical={}, comp={}, enc={}, flags={:#06x}",
                ext.start, ext.len, ext.logical, ext.comp_algo, ext.enc_algo, ext.flags
            ));
            if ext.start < metadata_end || ext.start as u64 + ext.len as u64 > self.sb.nr_blocks as u64 {
                self.error(format_args!(
                    "inode {ino} extent {i}: [{}, {}) outside the data area",
                    ext.start,
                    ext.start as u64 + ext.len as u64
                ));
            }
            if ext.comp_algo > COMP_ZSTD {
                self.error(format_args!(
                    "inode {ino} extent {i}: invalid compression algorithm {}",
                    ext.comp_algo
                ));
            }
            if ext.enc_algo > ENC_CHACHA20_POLY {
                self.error(format_args!(
                    "inode {ino} extent {i}: invalid encryption algorithm {}",
                    ext.enc_algo
                ));
            }
            if ext.flags & EXT_COMPRESSED != 0 && ext.comp_algo == COMP_NONE {
                self.error(format_args!(
                    "inode {ino} extent {i}: COMPRESSED flag with no compression algorithm"
                ));
            }
            if ext.flags & EXT_ENCRYPTED != 0 && ext.enc_algo == ENC_NONE {
                self.error(format_args!(
                    "inode {ino} extent {i}: ENCRYPTED flag with no encryption algorithm"
                ));
            }
        }
        Ok(())
    }

    /// Counts the free bits of an on-disk bitmap.
    fn count_free_bits(&mut self, start: u32, nr_blocks: u32, nbits: u32) -> FsResult<u32> {
        let mut free = 0;
        for b in 0..nr_blocks {
            let block = self.read_block(start + b)?;
            for (i, byte) in block.0.iter().enumerate() {
                for bit in 0..8 {
                    let n = b * BLOCK_SIZE as u32 * 8 + i as u32 * 8 + bit;
                    if n >= nbits {
                        return Ok(free);
                    }
                    if byte & (1 << bit) != 0 {
                        free += 1;
                    }
                }
            }
        }
        Ok(free)
    }

    fn check_inode_bitmap(&mut self) -> FsResult<()> {
        println!("Checking inode bitmap...");
        let start = 1 + self.sb.nr_istore_blocks;
        let free = self.count_free_bits(start, self.sb.nr_ifree_blocks, self.sb.nr_inodes)?;
        if free != self.sb.nr_free_inodes {
            let nr_free_inodes = self.sb.nr_free_inodes;
            self.error(format_args!(
                "inode bitmap free count mismatch: counted {free}, superblock says {}",
                nr_free_inodes
            ));
        } else {
            self.info(format_args!("inode bitmap: {free} free inodes verified"));
        }
        let first = self.read_block(start)?;
        if first.0[0] & 0x01 != 0 {
            self.error(format_args!("root inode (inode 0) marked as free in bitmap"));
        }
        println!("  Inode bitmap OK");
        Ok(())
    }

    fn check_block_bitmap(&mut self) -> FsResult<()> {
        println!("Checking block bitmap...");
        let start = 1 + self.sb.nr_istore_blocks + self.sb.nr_ifree_blocks;
        let free = self.count_free_bits(start, self.sb.nr_bfree_blocks, self.sb.nr_blocks)?;
        if free != self.sb.nr_free_blocks {
            let nr_free_blocks = self.sb.nr_free_blocks;
            self.error(format_args!(
                "block bitmap free count mismatch: counted {free}, superblock says {}",
                nr_free_blocks
            ));
        } else {
            self.info(format_args!("block bitmap: {free} free blocks verified"));
        }
        let first = self.read_block(start)?;
        if first.0[0] & 0x01 != 0 {
            self.error(format_args!("superblock (block 0) marked as free in bitmap"));
        }
        println!("  Block bitmap OK");
        Ok(())
    }

    /// Walks every allocated inode and validates its extent structures.
    fn check_inodes(&mut self) -> FsResult<()> {
        println!("Checking allocated inodes...");
        let ifree_start = 1 + self.sb.nr_istore_blocks;
        let metadata_end = self.metadata_end();
        for ino in 0..self.sb.nr_inodes {
            let bitmap_block = self.read_block(ifree_start + ino / (BLOCK_SIZE as u32 * 8))?;
            let bit = ino % (BLOCK_SIZE as u32 * 8);
            let is_free = bitmap_block.0[bit as usize / 8] & (1 << (bit % 8)) != 0;
            if is_free {
                continue;
            }
            let inode = self.read_inode(ino)?;
            if inode.i_mode == 0 {
                if ino != 0 {
                    self.warn(format_args!("inode {ino} allocated but has no mode"));
                }
                continue;
            }
            if inode.i_mode & S_IFMT == S_IFDIR || inode.i_mode & S_IFMT == crate::inode::S_IFREG {
                if inode.ei_block < metadata_end || inode.ei_block >= self.sb.nr_blocks {
                    self.error(format_args!(
                        "inode {ino}: ei_block {} outside data area",
                        inode.ei_block
                    ));
                    continue;
                }
                let is_dir = inode.i_mode & S_IFMT == S_IFDIR;
                self.check_extent_index(ino, inode.ei_block, is_dir)?;
            }
        }
        println!("  Allocated inodes OK");
        Ok(())
    }
}

/// Checks the image at `path` and returns the error/warning counts.
pub fn check<P: AsRef<Path>>(path: P, verbose: bool) -> FsResult<FsckReport> {
    let mut file = File::open(path)?;
    let base = elf::find_section(&mut file);
    let mut checker = Checker {
        file,
        base,
        sb: Superblock::default(),
        verbose,
        errors: 0,
        warnings: 0,
    };
    let sb_block = checker.read_block(0)?;
    checker.sb = *layout::reinterpret::<Superblock>(&sb_block.0);

    if checker.check_superblock().is_ok() {
        checker.check_root_inode()?;
        checker.check_inode_bitmap()?;
        checker.check_block_bitmap()?;
        checker.check_inodes()?;
    }
    Ok(FsckReport {
        errors: checker.errors,
        warnings: checker.warnings,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::ROOT_INO;
    use crate::inode::S_IFREG;
    use crate::testutil::{default_image, mount};
    use std::io::Write;

    #[test]
    fn fresh_image_is_clean() {
        let tmp = default_image(1024);
        let report = check(tmp.path(), true).unwrap();
        assert_eq!(report.errors, 0);
        assert_eq!(report.warnings, 0);
    }

    #[test]
    fn workload_then_remount_stays_clean() {
        let tmp = default_image(1024);
        {
            let fs = mount(&tmp);
            let ino = fs.create(ROOT_INO, "data", S_IFREG | 0o644, 0, 0).unwrap();
            fs.write_file(ino, 0, &vec![0xCD; 5 * BLOCK_SIZE]).unwrap();
            fs.set_xattr(ino, layout::XATTR_INDEX_USER, "k", b"v", 0)
                .unwrap();
            fs.create(ROOT_INO, "dir", S_IFDIR | 0o755, 0, 0).unwrap();
            fs.unmount().unwrap();
        }
        let report = check(tmp.path(), false).unwrap();
        assert_eq!(report.errors, 0);
        // A second mount/unmount cycle must not change the verdict
        mount(&tmp).unmount().unwrap();
        let report = check(tmp.path(), false).unwrap();
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn tampered_free_count_detected() {
        let tmp = default_image(512);
        // Bump nr_free_blocks (offset 28 in the superblock) by one
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        let mut sb = [0u8; 32];
        file.read_exact(&mut sb).unwrap();
        let free = u32::from_le_bytes(sb[28..32].try_into().unwrap());
        file.seek(SeekFrom::Start(28)).unwrap();
        file.write_all(&(free + 1).to_le_bytes()).unwrap();
        let report = check(tmp.path(), false).unwrap();
        assert!(report.errors > 0);
    }

    #[test]
    fn bad_magic_detected() {
        let tmp = default_image(512);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(tmp.path())
            .unwrap();
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        let report = check(tmp.path(), false).unwrap();
        assert!(report.errors > 0);
    }
}
