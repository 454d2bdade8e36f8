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

//! On-disk records and layout constants.
//!
//! All integers on disk are little-endian. Records are declared `#[repr(C)]`
//! with naturally aligned fields, so their in-memory representation matches
//! the on-disk one byte for byte on little-endian hosts, which is the only
//! kind the engine supports.

use std::mem::{align_of, size_of};
use std::slice;

/// The fixed unit of addressable storage, in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// The filesystem's magic number (hexspeak).
pub const MAGIC: u32 = 0x101E1FF5;
/// The superblock's block number.
pub const SB_BLOCK_NR: u32 = 0;
/// Name of the ELF section holding an embedded image.
pub const SB_SECTION: &str = ".lolfs.super";
/// Format version. Always 1: compression support is mandatory.
pub const VERSION: u32 = 1;

/// Maximum length of a filename, not counting the NUL terminator.
pub const FILENAME_LEN: usize = 255;
/// Maximum number of blocks a single extent may cover.
pub const MAX_BLOCKS_PER_EXTENT: u32 = 65536;

/// Compression: no compression.
pub const COMP_NONE: u16 = 0;
/// Compression: LZ4 (fast, good ratio).
pub const COMP_LZ4: u16 = 1;
/// Compression: zlib/deflate (moderate speed, better ratio).
pub const COMP_ZLIB: u16 = 2;
/// Compression: zstd (configurable, best ratio). May be unavailable at
/// runtime.
pub const COMP_ZSTD: u16 = 3;

/// Encryption: no encryption.
pub const ENC_NONE: u8 = 0;
/// Encryption: AES-256-XTS (block device encryption).
pub const ENC_AES256_XTS: u8 = 1;
/// Encryption: ChaCha20-Poly1305 (authenticated encryption).
pub const ENC_CHACHA20_POLY: u8 = 2;

/// Key derivation: none.
pub const KDF_NONE: u32 = 0;
/// Key derivation: Argon2id.
pub const KDF_ARGON2ID: u32 = 1;
/// Key derivation: PBKDF2-HMAC-SHA256.
pub const KDF_PBKDF2: u32 = 2;

/// Extent flag: the extent contains compressed blocks.
pub const EXT_COMPRESSED: u16 = 0x0001;
/// Extent flag: the extent contains encrypted blocks.
pub const EXT_ENCRYPTED: u16 = 0x0002;
/// Extent flag: the extent has a per-block metadata block.
pub const EXT_HAS_META: u16 = 0x0004;
/// Extent flag: mixed compressed/uncompressed/encrypted blocks. Reserved.
pub const EXT_MIXED: u16 = 0x0008;

/// Size of an AEAD authentication tag, in bytes.
pub const AEAD_TAG_SIZE: usize = 16;
/// A metadata block holds one tag per covered block, which caps extents
/// written under an AEAD algorithm.
pub const AEAD_MAX_EXTENT_BLOCKS: u32 = (BLOCK_SIZE / AEAD_TAG_SIZE) as u32;

/// An extent: a contiguous run of physical blocks covering a contiguous
/// logical range within a file, with the transform metadata of its blocks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    /// First logical block the extent covers.
    pub logical: u32,
    /// Number of blocks covered.
    pub len: u32,
    /// First physical block. `0` terminates the extent list.
    pub start: u32,
    /// Compression algorithm of the extent's blocks.
    pub comp_algo: u16,
    /// Encryption algorithm of the extent's blocks.
    pub enc_algo: u8,
    pub reserved: u8,
    /// Flags (`EXT_*`).
    pub flags: u16,
    pub reserved2: u16,
    /// Block number of the per-block metadata block, `0` if absent.
    pub meta: u32,
}

/// Number of extent descriptors fitting in an index block after its leading
/// 32-bit word.
pub const MAX_EXTENTS: usize = (BLOCK_SIZE - size_of::<u32>()) / size_of::<Extent>();

/// The maximum number of logical blocks a file can address.
pub const MAX_FILE_BLOCKS: u32 = MAX_EXTENTS as u32 * MAX_BLOCKS_PER_EXTENT;
/// The maximum size of a file, in bytes.
pub const MAX_FILESIZE: u64 = MAX_FILE_BLOCKS as u64 * BLOCK_SIZE as u64;

/// A file's extent index block. For directories, `nr_files` holds the number
/// of entries; for regular files it stays 0.
#[repr(C)]
pub struct ExtentIndexBlock {
    /// Number of files in the directory.
    pub nr_files: u32,
    /// Ordered extent array. A descriptor with `start == 0` terminates it.
    pub extents: [Extent; MAX_EXTENTS],
}

/// A directory entry. `inode == 0` marks the end of the entries in a block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileEntry {
    /// The entry's inode number.
    pub inode: u32,
    /// NUL-padded filename.
    pub filename: [u8; FILENAME_LEN + 1],
}

/// Number of directory entries per block.
pub const FILES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<FileEntry>();
/// Number of directory entries per maximum-size extent.
pub const FILES_PER_EXT: u32 = FILES_PER_BLOCK as u32 * MAX_BLOCKS_PER_EXTENT;
/// Maximum number of entries in one directory.
pub const MAX_SUBFILES: u32 = FILES_PER_BLOCK as u32 * MAX_FILE_BLOCKS;

/// A directory data block: a dense array of entries.
#[repr(C)]
pub struct DirBlock {
    pub files: [FileEntry; FILES_PER_BLOCK],
}

/// An inode record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Inode {
    /// File mode (type and permissions).
    pub i_mode: u32,
    /// Owner id.
    pub i_uid: u32,
    /// Group id.
    pub i_gid: u32,
    /// Size in bytes.
    pub i_size: u32,
    /// Inode change time, in seconds since the Epoch.
    pub i_ctime: u32,
    /// Access time.
    pub i_atime: u32,
    /// Modification time.
    pub i_mtime: u32,
    /// Block count: allocated data blocks plus the extent index block.
    pub i_blocks: u32,
    /// Hard link count.
    pub i_nlink: u32,
    /// Block holding this file's extent index.
    pub ei_block: u32,
    /// Block holding the xattr extent index, `0` if the inode has no xattrs.
    pub xattr_block: u32,
    /// Inline data area, storing short symlink targets (27 chars + NUL).
    pub i_data: [u8; 28],
}

/// Number of inode records per inode-store block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<Inode>();

/// Maximum length of an inline symlink target, not counting the NUL.
pub const SYMLINK_LEN: usize = 27;

/// The superblock, stored in block 0. The record is padded with zeros up to
/// one full block on disk.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Superblock {
    /// Magic number.
    pub magic: u32,
    /// Total number of blocks, including the superblock and metadata.
    pub nr_blocks: u32,
    /// Total number of inodes, a multiple of `INODES_PER_BLOCK`.
    pub nr_inodes: u32,
    /// Number of inode store blocks.
    pub nr_istore_blocks: u32,
    /// Number of inode free bitmap blocks.
    pub nr_ifree_blocks: u32,
    /// Number of block free bitmap blocks.
    pub nr_bfree_blocks: u32,
    /// Number of free inodes.
    pub nr_free_inodes: u32,
    /// Number of free blocks.
    pub nr_free_blocks: u32,

    /// Filesystem version. Always 1.
    pub version: u32,
    /// Default compression algorithm.
    pub comp_default_algo: u32,
    /// Compression enabled flag.
    pub comp_enabled: u32,
    /// Blocks smaller than this are not compressed.
    pub comp_min_block_size: u32,
    /// Compression feature flags, reserved.
    pub comp_features: u32,
    /// Maximum number of blocks per extent.
    pub max_extent_blocks: u32,

    /// Encryption enabled flag.
    pub enc_enabled: u32,
    /// Default encryption algorithm.
    pub enc_default_algo: u32,
    /// Key derivation function.
    pub enc_kdf_algo: u32,
    /// KDF iterations (time cost for Argon2id).
    pub enc_kdf_iterations: u32,
    /// KDF memory cost, in KiB.
    pub enc_kdf_memory: u32,
    /// KDF parallelism.
    pub enc_kdf_parallelism: u32,
    /// Salt for key derivation.
    pub enc_salt: [u8; 32],
    /// Master key, wrapped with AES-256-ECB under the user key.
    pub enc_master_key: [u8; 32],
    /// SHA-256 digest of the plaintext master key, checked on unlock.
    pub enc_key_digest: [u8; 32],
    /// Encryption feature flags, reserved.
    pub enc_features: u32,
    /// Reserved for future use.
    pub reserved: [u32; 3],
}

/// Namespace index of the `user.` xattr prefix.
pub const XATTR_INDEX_USER: u8 = 0;
/// Namespace index of the `trusted.` xattr prefix.
pub const XATTR_INDEX_TRUSTED: u8 = 1;
/// Namespace index of the `system.` xattr prefix.
pub const XATTR_INDEX_SYSTEM: u8 = 2;
/// Namespace index of the `security.` xattr prefix.
pub const XATTR_INDEX_SECURITY: u8 = 3;

/// Xattr namespace prefixes, indexed by `XATTR_INDEX_*`.
pub const XATTR_PREFIXES: [&str; 4] = ["user.", "trusted.", "system.", "security."];

/// Maximum length of an xattr value.
pub const XATTR_VALUE_MAX: usize = 65535;
/// Maximum size of an inode's packed xattr stream.
pub const XATTR_TOTAL_MAX: usize = 32 * 1024;

/// Header of one packed xattr entry. The NUL-terminated name and the value
/// follow; entries are aligned to 4 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XattrEntry {
    /// Length of the name, not including the NUL.
    pub name_len: u8,
    /// Namespace index.
    pub name_index: u8,
    /// Length of the value.
    pub value_len: u16,
    /// Offset from this header to the value.
    pub value_offset: u32,
    pub reserved: u32,
}

/// An inode's xattr extent index block.
#[repr(C)]
pub struct XattrIndexBlock {
    /// Total size of the packed entry stream, in bytes.
    pub total_size: u32,
    /// Number of entries.
    pub count: u32,
    /// Extents addressing the data blocks holding the stream.
    pub extents: [Extent; MAX_EXTENTS],
}

/// Reinterprets the head of `slice` as a reference to `T`.
///
/// `T` must be a plain-data record without padding, valid for any bit
/// pattern, and `slice` must be large enough and properly aligned. Every
/// record in this module qualifies; block buffers are 8-byte aligned.
pub fn reinterpret<T>(slice: &[u8]) -> &T {
    assert!(slice.len() >= size_of::<T>());
    assert_eq!(slice.as_ptr() as usize % align_of::<T>(), 0);
    unsafe { &*(slice.as_ptr() as *const T) }
}

/// Mutable counterpart of [`reinterpret`].
pub fn reinterpret_mut<T>(slice: &mut [u8]) -> &mut T {
    assert!(slice.len() >= size_of::<T>());
    assert_eq!(slice.as_ptr() as usize % align_of::<T>(), 0);
    unsafe { &mut *(slice.as_mut_ptr() as *mut T) }
}

/// Returns the raw bytes of the given record.
pub fn as_bytes<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) }
}

/// Returns ceil(a / b).
pub fn div_ceil(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<Extent>(), 24);
        assert_eq!(size_of::<Inode>(), 72);
        assert_eq!(size_of::<FileEntry>(), 260);
        assert_eq!(size_of::<XattrEntry>(), 12);
        assert_eq!(MAX_EXTENTS, 170);
        assert_eq!(INODES_PER_BLOCK, 56);
        assert_eq!(FILES_PER_BLOCK, 15);
        assert!(size_of::<Superblock>() <= BLOCK_SIZE);
        assert!(size_of::<ExtentIndexBlock>() <= BLOCK_SIZE);
        assert!(size_of::<XattrIndexBlock>() <= BLOCK_SIZE);
        assert!(size_of::<DirBlock>() <= BLOCK_SIZE);
    }

    #[test]
    fn extent_terminator() {
        let e = Extent::default();
        assert_eq!(e.start, 0);
    }
}
