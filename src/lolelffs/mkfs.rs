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

//! Filesystem creation.
//!
//! Writes the superblock, the zeroed inode store with the root inode, both
//! free bitmaps and the empty root directory extent index. When the backing
//! file is an ELF binary with a `.lolfs.super` section, the image is laid
//! out inside that section.

use crate::crypt;
use crate::elf;
use crate::error::{FsError, FsResult};
use crate::inode::S_IFDIR;
use crate::layout::{
    self, BLOCK_SIZE, COMP_LZ4, ENC_AES256_XTS, INODES_PER_BLOCK, Inode, KDF_ARGON2ID, MAGIC,
    MAX_BLOCKS_PER_EXTENT, Superblock, VERSION,
};
use rand_core::{OsRng, RngCore};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

/// Minimum image size, in blocks.
pub const MIN_BLOCKS: u32 = 100;

/// Encryption setup for a new image.
pub struct EncParams {
    /// Default encryption algorithm for data blocks.
    pub algo: u8,
    /// Key derivation function.
    pub kdf: u32,
    /// KDF iterations (time cost for Argon2id).
    pub iterations: u32,
    /// KDF memory cost, in KiB.
    pub memory_kb: u32,
    /// KDF parallelism.
    pub parallelism: u32,
    /// The volume password.
    pub password: String,
    /// Fixed salt, for reproducible images. Random when `None`.
    pub salt: Option<[u8; 32]>,
    /// Fixed master key, for reproducible images. Random when `None`.
    pub master_key: Option<[u8; 32]>,
}

impl Default for EncParams {
    fn default() -> Self {
        Self {
            algo: ENC_AES256_XTS,
            kdf: KDF_ARGON2ID,
            iterations: 3,
            memory_kb: 65536,
            parallelism: 4,
            password: String::new(),
            salt: None,
            master_key: None,
        }
    }
}

/// A factory to create a `lolelffs` image on a device.
pub struct FsBuilder {
    /// The length of the backing file in bytes, if not taken from its
    /// metadata.
    pub len: Option<u64>,
    /// Default compression algorithm.
    pub comp_algo: u32,
    /// Whether compression is enabled.
    pub comp_enabled: bool,
    /// Blocks smaller than this are not compressed.
    pub comp_min_block_size: u32,
    /// Encryption setup; `None` leaves the image unencrypted.
    pub encryption: Option<EncParams>,
}

impl Default for FsBuilder {
    fn default() -> Self {
        Self {
            len: None,
            comp_algo: COMP_LZ4 as u32,
            comp_enabled: true,
            comp_min_block_size: 128,
            encryption: None,
        }
    }
}

/// Layout summary of a freshly created image.
pub struct MkfsSummary {
    pub fs_offset: u32,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
    pub comp_enabled: bool,
    pub comp_algo: u32,
    pub max_extent_blocks: u32,
    pub enc_enabled: bool,
    pub enc_algo: u8,
}

impl FsBuilder {
    /// Tells whether a `lolelffs` filesystem is already present on `dev`.
    pub fn is_present(&self, dev: &mut File) -> FsResult<bool> {
        let base = elf::find_section(dev);
        let mut magic = [0u8; 4];
        dev.seek(SeekFrom::Start(base))?;
        use std::io::Read;
        if dev.read_exact(&mut magic).is_err() {
            return Ok(false);
        }
        Ok(u32::from_le_bytes(magic) == MAGIC)
    }

    /// Creates the filesystem on `dev` and returns the layout summary.
    pub fn create(&self, dev: &mut File) -> FsResult<MkfsSummary> {
        let base = elf::find_section(dev);
        let len = match self.len {
            Some(len) => len,
            None => dev.metadata()?.len(),
        };
        if len < base {
            return Err(FsError::InvalidArgument);
        }
        let nr_blocks = ((len - base) / BLOCK_SIZE as u64) as u32;
        if nr_blocks < MIN_BLOCKS {
            log::error!("image is not large enough ({nr_blocks} blocks, minimum {MIN_BLOCKS})");
            return Err(FsError::InvalidArgument);
        }

        let mut nr_inodes = nr_blocks;
        let rem = nr_inodes % INODES_PER_BLOCK as u32;
        if rem != 0 {
            nr_inodes += INODES_PER_BLOCK as u32 - rem;
        }
        let nr_istore_blocks = nr_inodes.div_ceil(INODES_PER_BLOCK as u32);
        let nr_ifree_blocks = nr_inodes.div_ceil(BLOCK_SIZE as u32 * 8);
        let nr_bfree_blocks = nr_blocks.div_ceil(BLOCK_SIZE as u32 * 8);
        let nr_data_blocks = nr_blocks - 1 - nr_istore_blocks - nr_ifree_blocks - nr_bfree_blocks;

        let mut sb = Superblock {
            magic: MAGIC,
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_free_inodes: nr_inodes - 1,
            // The root directory's extent index takes the first data block
            nr_free_blocks: nr_data_blocks - 1,
            version: VERSION,
            comp_default_algo: self.comp_algo,
            comp_enabled: self.comp_enabled as u32,
            comp_min_block_size: self.comp_min_block_size,
            comp_features: 0,
            max_extent_blocks: MAX_BLOCKS_PER_EXTENT,
            enc_enabled: 0,
            enc_default_algo: layout::ENC_NONE as u32,
            enc_kdf_algo: KDF_ARGON2ID,
            enc_kdf_iterations: 3,
            enc_kdf_memory: 65536,
            enc_kdf_parallelism: 4,
            enc_salt: [0; 32],
            enc_master_key: [0; 32],
            enc_key_digest: [0; 32],
            enc_features: 0,
            reserved: [0; 3],
        };
        if let Some(enc) = &self.encryption {
            if !crypt::supported(enc.algo) || enc.algo == layout::ENC_NONE {
                return Err(FsError::InvalidArgument);
            }
            let salt = enc.salt.unwrap_or_else(|| {
                let mut salt = [0u8; 32];
                OsRng.fill_bytes(&mut salt);
                salt
            });
            let mut master_key = enc.master_key.unwrap_or_else(|| {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                key
            });
            let mut user_key = crypt::derive_key(
                enc.kdf,
                enc.password.as_bytes(),
                &salt,
                enc.iterations,
                enc.memory_kb,
                enc.parallelism,
            )?;
            sb.enc_enabled = 1;
            sb.enc_default_algo = enc.algo as u32;
            sb.enc_kdf_algo = enc.kdf;
            sb.enc_kdf_iterations = enc.iterations;
            sb.enc_kdf_memory = enc.memory_kb;
            sb.enc_kdf_parallelism = enc.parallelism;
            sb.enc_salt = salt;
            sb.enc_master_key = crypt::wrap_master_key(&master_key, &user_key);
            sb.enc_key_digest = crypt::key_digest(&master_key);
            crypt::wipe(&mut master_key);
            crypt::wipe(&mut user_key);
        }

        dev.seek(SeekFrom::Start(base))?;
        self.write_superblock(dev, &sb)?;
        self.write_inode_store(dev, &sb)?;
        self.write_ifree_blocks(dev, &sb)?;
        self.write_bfree_blocks(dev, &sb)?;
        self.write_root_index(dev)?;
        dev.flush()?;

        log::info!("filesystem created: {nr_blocks} blocks, {nr_inodes} inodes");
        Ok(MkfsSummary {
            fs_offset: (base / BLOCK_SIZE as u64) as u32,
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_free_inodes: sb.nr_free_inodes,
            nr_free_blocks: sb.nr_free_blocks,
            comp_enabled: sb.comp_enabled != 0,
            comp_algo: sb.comp_default_algo,
            max_extent_blocks: sb.max_extent_blocks,
            enc_enabled: sb.enc_enabled != 0,
            enc_algo: sb.enc_default_algo as u8,
        })
    }

    fn write_superblock(&self, dev: &mut File, sb: &Superblock) -> FsResult<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..std::mem::size_of::<Superblock>()].copy_from_slice(layout::as_bytes(sb));
        dev.write_all(&block)?;
        Ok(())
    }

    /// Writes the inode store: the root inode in the first record, zeros
    /// everywhere else.
    fn write_inode_store(&self, dev: &mut File, sb: &Superblock) -> FsResult<()> {
        let first_data_block =
            1 + sb.nr_istore_blocks + sb.nr_ifree_blocks + sb.nr_bfree_blocks;
        let root = Inode {
            i_mode: S_IFDIR | 0o755,
            i_size: BLOCK_SIZE as u32,
            i_blocks: 1,
            i_nlink: 2,
            ei_block: first_data_block,
            ..Default::default()
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..std::mem::size_of::<Inode>()].copy_from_slice(layout::as_bytes(&root));
        dev.write_all(&block)?;
        block.fill(0);
        for _ in 1..sb.nr_istore_blocks {
            dev.write_all(&block)?;
        }
        Ok(())
    }

    /// Writes the inode free bitmap: everything free except the root inode.
    fn write_ifree_blocks(&self, dev: &mut File, sb: &Superblock) -> FsResult<()> {
        let mut block = vec![0xffu8; BLOCK_SIZE];
        block[..8].copy_from_slice(&0xffff_ffff_ffff_fffeu64.to_le_bytes());
        dev.write_all(&block)?;
        block[..8].fill(0xff);
        for _ in 1..sb.nr_ifree_blocks {
            dev.write_all(&block)?;
        }
        Ok(())
    }

    /// Writes the block free bitmap: the superblock, the metadata regions
    /// and the root directory's extent index block are in use.
    fn write_bfree_blocks(&self, dev: &mut File, sb: &Superblock) -> FsResult<()> {
        let nr_used = 1 + sb.nr_istore_blocks + sb.nr_ifree_blocks + sb.nr_bfree_blocks + 1;
        for bi in 0..sb.nr_bfree_blocks {
            let mut block = vec![0xffu8; BLOCK_SIZE];
            let first_bit = bi * BLOCK_SIZE as u32 * 8;
            for bit in 0..(BLOCK_SIZE as u32 * 8).min(nr_used.saturating_sub(first_bit)) {
                block[bit as usize / 8] &= !(1 << (bit % 8));
            }
            dev.write_all(&block)?;
        }
        Ok(())
    }

    /// Writes the root directory's empty extent index block.
    fn write_root_index(&self, dev: &mut File) -> FsResult<()> {
        let block = vec![0u8; BLOCK_SIZE];
        dev.write_all(&block)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::format_image;
    use std::fs::OpenOptions;

    #[test]
    fn layout_arithmetic() {
        let tmp = format_image(1024, &FsBuilder::default());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        let builder = FsBuilder::default();
        assert!(builder.is_present(&mut file).unwrap());
        let summary = builder.create(&mut file).unwrap();
        assert_eq!(summary.nr_blocks, 1024);
        // Inode count rounded up to a full store block
        assert_eq!(summary.nr_inodes % INODES_PER_BLOCK as u32, 0);
        assert_eq!(
            summary.nr_istore_blocks,
            summary.nr_inodes / INODES_PER_BLOCK as u32
        );
        assert_eq!(summary.nr_ifree_blocks, 1);
        assert_eq!(summary.nr_bfree_blocks, 1);
        let nr_data = summary.nr_blocks
            - 1
            - summary.nr_istore_blocks
            - summary.nr_ifree_blocks
            - summary.nr_bfree_blocks;
        assert_eq!(summary.nr_free_blocks, nr_data - 1);
        assert_eq!(summary.nr_free_inodes, summary.nr_inodes - 1);
        assert!(summary.comp_enabled);
        assert_eq!(summary.comp_algo, COMP_LZ4 as u32);
        assert!(!summary.enc_enabled);
    }

    #[test]
    fn too_small_image_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(99 * BLOCK_SIZE as u64).unwrap();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        assert!(FsBuilder::default().create(&mut file).is_err());
    }

    #[test]
    fn blank_image_not_present() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(200 * BLOCK_SIZE as u64).unwrap();
        let mut file = OpenOptions::new().read(true).open(tmp.path()).unwrap();
        assert!(!FsBuilder::default().is_present(&mut file).unwrap());
    }

    #[test]
    fn encrypted_image_stores_wrapped_key() {
        let builder = FsBuilder {
            encryption: Some(EncParams {
                kdf: crate::layout::KDF_PBKDF2,
                iterations: 1000,
                password: "test".into(),
                salt: Some([0x01; 32]),
                master_key: Some([0xA5; 32]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let tmp = format_image(256, &builder);
        let fs = crate::testutil::mount(&tmp);
        let sb = fs.superblock();
        assert_eq!(sb.enc_enabled, 1);
        assert_eq!(sb.enc_salt, [0x01; 32]);
        // The wrapped key is not the plaintext key
        assert_ne!(sb.enc_master_key, [0xA5; 32]);
        assert_eq!(sb.enc_key_digest, crypt::key_digest(&[0xA5; 32]));
    }
}
