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

//! Image lifecycle: mount, superblock validation, sync, unmount, and the
//! unlock control channel.

use crate::alloc::{Bitmap, SpaceAlloc};
use crate::device::BlockDevice;
use crate::elf;
use crate::error::{FsError, FsResult};
use crate::layout::{
    self, BLOCK_SIZE, COMP_ZSTD, ENC_CHACHA20_POLY, INODES_PER_BLOCK, KDF_PBKDF2, MAGIC,
    MAX_BLOCKS_PER_EXTENT, Superblock, VERSION,
};
use crate::crypt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

/// The root directory's inode number.
pub const ROOT_INO: u32 = 0;

/// Magic of the control channel requests.
pub const IOC_MAGIC: u8 = b'L';
/// Control code: unlock the volume with a password.
pub const IOC_UNLOCK: u32 = 1;
/// Control code: read back the encryption status.
pub const IOC_ENC_STATUS: u32 = 2;

/// Maximum password length accepted by the unlock request.
pub const PASSWORD_MAX: usize = 255;

/// An unlock request, as carried over the control channel.
pub struct UnlockRequest {
    /// NUL-terminated password buffer.
    pub password: [u8; PASSWORD_MAX + 1],
    pub password_len: u32,
}

impl UnlockRequest {
    /// Builds a request from a clear password.
    pub fn new(password: &[u8]) -> FsResult<Self> {
        if password.len() > PASSWORD_MAX {
            return Err(FsError::InvalidArgument);
        }
        let mut req = Self {
            password: [0; PASSWORD_MAX + 1],
            password_len: password.len() as u32,
        };
        req.password[..password.len()].copy_from_slice(password);
        Ok(req)
    }
}

impl Drop for UnlockRequest {
    fn drop(&mut self) {
        crypt::wipe(&mut self.password);
    }
}

/// A request on the control channel.
pub enum ControlRequest<'r> {
    /// `IOC_UNLOCK`
    Unlock(&'r UnlockRequest),
    /// `IOC_ENC_STATUS`
    EncStatus,
}

/// The response to a control request.
pub enum ControlResponse {
    Unlocked,
    Status(EncStatus),
}

/// Encryption status readback.
#[derive(Clone, Copy, Debug)]
pub struct EncStatus {
    pub enc_enabled: u32,
    pub enc_unlocked: u32,
    pub enc_algorithm: u32,
}

/// Runtime encryption state, held behind the encryption mutex.
pub(crate) struct EncState {
    /// Decrypted master key. In memory only, wiped on unmount.
    pub master_key: [u8; 32],
    pub unlocked: bool,
}

impl Drop for EncState {
    fn drop(&mut self) {
        crypt::wipe(&mut self.master_key);
    }
}

/// A mounted filesystem.
pub struct LolElfFs {
    pub(crate) dev: BlockDevice,
    pub(crate) sb: Superblock,
    pub(crate) alloc: SpaceAlloc,
    pub(crate) enc: Mutex<EncState>,
}

/// Validates the superblock against the layout invariants.
pub(crate) fn validate_superblock(sb: &Superblock) -> FsResult<()> {
    if sb.magic != MAGIC {
        return Err(FsError::Corrupted("bad magic number"));
    }
    if sb.version != VERSION {
        return Err(FsError::Corrupted("unsupported version"));
    }
    if sb.nr_blocks < 100 {
        return Err(FsError::Corrupted("block count below minimum"));
    }
    if sb.nr_inodes == 0 || sb.nr_istore_blocks != sb.nr_inodes.div_ceil(INODES_PER_BLOCK as u32) {
        return Err(FsError::Corrupted("inode store arithmetic mismatch"));
    }
    if sb.nr_ifree_blocks != sb.nr_inodes.div_ceil(BLOCK_SIZE as u32 * 8)
        || sb.nr_bfree_blocks != sb.nr_blocks.div_ceil(BLOCK_SIZE as u32 * 8)
    {
        return Err(FsError::Corrupted("bitmap arithmetic mismatch"));
    }
    if sb.nr_free_inodes > sb.nr_inodes || sb.nr_free_blocks > sb.nr_blocks {
        return Err(FsError::Corrupted("free counters exceed totals"));
    }
    if sb.comp_default_algo > COMP_ZSTD as u32 {
        return Err(FsError::Corrupted("invalid compression algorithm"));
    }
    if sb.enc_default_algo > ENC_CHACHA20_POLY as u32 {
        return Err(FsError::Corrupted("invalid encryption algorithm"));
    }
    if sb.enc_kdf_algo > KDF_PBKDF2 {
        return Err(FsError::Corrupted("invalid KDF algorithm"));
    }
    if sb.max_extent_blocks == 0 || sb.max_extent_blocks > MAX_BLOCKS_PER_EXTENT {
        return Err(FsError::Corrupted("invalid extent size cap"));
    }
    Ok(())
}

impl LolElfFs {
    /// Mounts the image at `path`.
    ///
    /// If the backing file is an ELF64 binary with a `.lolfs.super` section,
    /// the filesystem region starts at that section's offset; otherwise the
    /// file is a raw image.
    pub fn mount<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let byte_offset = elf::find_section(&mut file);
        let fs_offset = (byte_offset / BLOCK_SIZE as u64) as u32;
        let dev = BlockDevice::new(file, fs_offset);

        let sb = {
            let buf = dev.read_block(layout::SB_BLOCK_NR)?;
            let data = buf.data();
            *layout::reinterpret::<Superblock>(&data.0)
        };
        validate_superblock(&sb)?;

        // Materialise the free bitmaps
        let ifree_start = 1 + sb.nr_istore_blocks;
        let bfree_start = ifree_start + sb.nr_ifree_blocks;
        let ifree = Self::load_bitmap(&dev, ifree_start, sb.nr_ifree_blocks, sb.nr_inodes)?;
        let bfree = Self::load_bitmap(&dev, bfree_start, sb.nr_bfree_blocks, sb.nr_blocks)?;
        if ifree.count_ones() != sb.nr_free_inodes {
            log::warn!(
                "inode bitmap disagrees with superblock ({} vs {})",
                ifree.count_ones(),
                sb.nr_free_inodes
            );
        }
        if bfree.count_ones() != sb.nr_free_blocks {
            log::warn!(
                "block bitmap disagrees with superblock ({} vs {})",
                bfree.count_ones(),
                sb.nr_free_blocks
            );
        }
        let alloc = SpaceAlloc::new(ifree, bfree, sb.nr_free_inodes, sb.nr_free_blocks);

        log::info!(
            "'{}' mount success (fs_offset={fs_offset} blocks)",
            path.display()
        );
        Ok(Self {
            dev,
            sb,
            alloc,
            enc: Mutex::new(EncState {
                master_key: [0; 32],
                unlocked: false,
            }),
        })
    }

    fn load_bitmap(dev: &BlockDevice, start: u32, nr_blocks: u32, nbits: u32) -> FsResult<Bitmap> {
        let mut bytes = Vec::with_capacity(nr_blocks as usize * BLOCK_SIZE);
        for i in 0..nr_blocks {
            let buf = dev.read_block(start + i)?;
            bytes.extend_from_slice(&buf.data().0);
        }
        Ok(Bitmap::from_bytes(&bytes, nbits))
    }

    /// First block of the data area.
    pub fn data_area_start(&self) -> u32 {
        1 + self.sb.nr_istore_blocks + self.sb.nr_ifree_blocks + self.sb.nr_bfree_blocks
    }

    /// The mounted superblock.
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Reference to the space allocator.
    pub fn allocator(&self) -> &SpaceAlloc {
        &self.alloc
    }

    /// Writes the bitmaps and the superblock free counters back to disk and
    /// drains every dirty buffer.
    pub fn sync(&self) -> FsResult<()> {
        let ifree_start = 1 + self.sb.nr_istore_blocks;
        let bfree_start = ifree_start + self.sb.nr_ifree_blocks;
        let (ifree_bytes, bfree_bytes) = self.alloc.with_bitmaps(|ifree, bfree| {
            let mut ib = vec![0u8; self.sb.nr_ifree_blocks as usize * BLOCK_SIZE];
            ifree.write_bytes(&mut ib);
            let mut bb = vec![0u8; self.sb.nr_bfree_blocks as usize * BLOCK_SIZE];
            bfree.write_bytes(&mut bb);
            (ib, bb)
        });
        self.write_region(ifree_start, &ifree_bytes)?;
        self.write_region(bfree_start, &bfree_bytes)?;

        let mut sb = self.sb;
        sb.nr_free_inodes = self.alloc.free_inodes();
        sb.nr_free_blocks = self.alloc.free_blocks_count();
        let buf = self.dev.read_block(layout::SB_BLOCK_NR)?;
        {
            let mut data = buf.data_mut();
            *layout::reinterpret_mut::<Superblock>(&mut data.0) = sb;
        }
        buf.mark_dirty();
        self.dev.sync_buffer(&buf)?;
        self.dev.sync_all()
    }

    fn write_region(&self, start: u32, bytes: &[u8]) -> FsResult<()> {
        for (i, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            let buf = self.dev.read_block(start + i as u32)?;
            {
                let mut data = buf.data_mut();
                data.0[..chunk.len()].copy_from_slice(chunk);
            }
            buf.mark_dirty();
            self.dev.sync_buffer(&buf)?;
        }
        Ok(())
    }

    /// Syncs all state and tears the mount down, wiping the master key.
    pub fn unmount(self) -> FsResult<()> {
        self.sync()?;
        log::info!("unmounted disk");
        Ok(())
    }

    /// Unlocks the volume with the given password.
    ///
    /// Derives the user key with the superblock's KDF, unwraps the master
    /// key and verifies it against the stored digest; a mismatch fails with
    /// [`FsError::CryptoFailure`] and leaves the volume locked. Unlocking an
    /// already unlocked volume is a no-op success.
    pub fn unlock(&self, password: &[u8]) -> FsResult<()> {
        if self.sb.enc_enabled == 0 {
            log::info!("filesystem is not encrypted");
            return Err(FsError::InvalidArgument);
        }
        if self.enc.lock().unwrap().unlocked {
            log::info!("filesystem is already unlocked");
            return Ok(());
        }
        if password.len() > PASSWORD_MAX {
            return Err(FsError::InvalidArgument);
        }
        // Bounded, NUL-terminated copy, wiped on every exit path
        let mut pw = [0u8; PASSWORD_MAX + 1];
        pw[..password.len()].copy_from_slice(password);

        let result = (|| {
            let mut user_key = crypt::derive_key(
                self.sb.enc_kdf_algo,
                &pw[..password.len()],
                &self.sb.enc_salt,
                self.sb.enc_kdf_iterations,
                self.sb.enc_kdf_memory,
                self.sb.enc_kdf_parallelism,
            )?;
            let mut master_key = crypt::unwrap_master_key(&self.sb.enc_master_key, &user_key);
            crypt::wipe(&mut user_key);
            if crypt::key_digest(&master_key) != self.sb.enc_key_digest {
                crypt::wipe(&mut master_key);
                log::error!("failed to decrypt master key");
                return Err(FsError::CryptoFailure);
            }
            let mut enc = self.enc.lock().unwrap();
            enc.master_key = master_key;
            enc.unlocked = true;
            crypt::wipe(&mut master_key);
            Ok(())
        })();
        crypt::wipe(&mut pw);
        if result.is_ok() {
            log::info!("filesystem unlocked successfully");
        }
        result
    }

    /// Returns the encryption status of the volume.
    pub fn enc_status(&self) -> EncStatus {
        EncStatus {
            enc_enabled: self.sb.enc_enabled,
            enc_unlocked: self.enc.lock().unwrap().unlocked as u32,
            enc_algorithm: self.sb.enc_default_algo,
        }
    }

    /// Dispatches a control channel request.
    pub fn control(&self, request: ControlRequest<'_>) -> FsResult<ControlResponse> {
        match request {
            ControlRequest::Unlock(req) => {
                let len = (req.password_len as usize).min(PASSWORD_MAX);
                // Honor the NUL terminator of the fixed buffer
                let len = req.password[..len]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(len);
                self.unlock(&req.password[..len])?;
                Ok(ControlResponse::Unlocked)
            }
            ControlRequest::EncStatus => Ok(ControlResponse::Status(self.enc_status())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::BLOCK_SIZE;
    use crate::mkfs::{EncParams, FsBuilder};
    use crate::testutil::{default_image, format_image, mount};
    use std::io::{Seek, SeekFrom, Write};

    fn encrypted_builder(algo: u8) -> FsBuilder {
        FsBuilder {
            encryption: Some(EncParams {
                algo,
                kdf: layout::KDF_PBKDF2,
                iterations: 1000,
                password: "test".into(),
                salt: Some([0x01; 32]),
                master_key: None,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn mount_and_stat_root() {
        let tmp = default_image(1024);
        let fs = mount(&tmp);
        let stat = fs.stat(ROOT_INO).unwrap();
        assert!(stat.is_dir());
        assert_eq!(stat.nlink, 2);
        assert_eq!(stat.blocks, 1);
        assert_eq!(stat.size, BLOCK_SIZE as u32);
        let root = fs.read_inode(ROOT_INO).unwrap();
        assert_eq!(root.ei_block, fs.data_area_start());
    }

    #[test]
    fn mount_rejects_garbage() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(256 * BLOCK_SIZE as u64).unwrap();
        assert!(matches!(
            LolElfFs::mount(tmp.path()),
            Err(FsError::Corrupted(_))
        ));
    }

    #[test]
    fn elf_embedded_mount() {
        // An ELF header in front, the image region starting at 128 KiB
        let section_offset = 131072u64;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file()
            .set_len(section_offset + 600 * BLOCK_SIZE as u64)
            .unwrap();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&crate::elf::synthetic_elf(section_offset))
            .unwrap();
        let summary = FsBuilder::default().create(&mut file).unwrap();
        assert_eq!(summary.fs_offset, 32);
        assert_eq!(summary.nr_blocks, 600);

        let fs = mount(&tmp);
        assert_eq!(fs.dev.fs_offset(), 32);
        assert!(fs.stat(ROOT_INO).unwrap().is_dir());
        // Data round trip through the embedded region
        let ino = fs
            .create(ROOT_INO, "hello", crate::inode::S_IFREG | 0o644, 0, 0)
            .unwrap();
        fs.write_file(ino, 0, b"embedded payload").unwrap();
        let mut out = [0u8; 16];
        fs.read_file(ino, 0, &mut out).unwrap();
        assert_eq!(&out, b"embedded payload");
    }

    #[test]
    fn unlock_flow() {
        let tmp = format_image(512, &encrypted_builder(layout::ENC_AES256_XTS));
        let ino;
        {
            let fs = mount(&tmp);
            let status = fs.enc_status();
            assert_eq!(status.enc_enabled, 1);
            assert_eq!(status.enc_unlocked, 0);
            // Writing while locked must be denied, leaving no allocation
            ino = fs
                .create(ROOT_INO, "secret", crate::inode::S_IFREG | 0o600, 0, 0)
                .unwrap();
            let free_before = fs.alloc.free_blocks_count();
            assert!(matches!(
                fs.write_file(ino, 0, &[7u8; BLOCK_SIZE]),
                Err(FsError::PermissionDenied)
            ));
            assert_eq!(fs.alloc.free_blocks_count(), free_before);
            // Wrong password leaves the volume locked
            assert!(matches!(fs.unlock(b"wrong"), Err(FsError::CryptoFailure)));
            assert_eq!(fs.enc_status().enc_unlocked, 0);
            // Right password unlocks; a second unlock is a no-op
            fs.unlock(b"test").unwrap();
            fs.unlock(b"test").unwrap();
            assert_eq!(fs.enc_status().enc_unlocked, 1);
            fs.write_file(ino, 0, &[7u8; BLOCK_SIZE]).unwrap();
            fs.unmount().unwrap();
        }
        // A fresh mount starts locked again
        let fs = mount(&tmp);
        let mut out = [0u8; BLOCK_SIZE];
        assert!(matches!(
            fs.read_file_block(ino, 0, &mut out),
            Err(FsError::PermissionDenied)
        ));
        fs.unlock(b"test").unwrap();
        fs.read_file_block(ino, 0, &mut out).unwrap();
        assert_eq!(out, [7u8; BLOCK_SIZE]);
    }

    #[test]
    fn unlock_on_plain_volume_fails() {
        let tmp = default_image(256);
        let fs = mount(&tmp);
        assert!(matches!(fs.unlock(b"test"), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn overlong_password_rejected() {
        let tmp = format_image(512, &encrypted_builder(layout::ENC_AES256_XTS));
        let fs = mount(&tmp);
        assert!(matches!(
            fs.unlock(&[b'a'; PASSWORD_MAX + 1]),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn control_channel() {
        let tmp = format_image(512, &encrypted_builder(layout::ENC_AES256_XTS));
        let fs = mount(&tmp);
        let req = UnlockRequest::new(b"test").unwrap();
        assert!(matches!(
            fs.control(ControlRequest::Unlock(&req)),
            Ok(ControlResponse::Unlocked)
        ));
        match fs.control(ControlRequest::EncStatus) {
            Ok(ControlResponse::Status(status)) => {
                assert_eq!(status.enc_unlocked, 1);
                assert_eq!(status.enc_algorithm, layout::ENC_AES256_XTS as u32);
            }
            _ => panic!("expected a status response"),
        }
    }

    #[test]
    fn remount_preserves_state() {
        let tmp = default_image(1024);
        let free_blocks;
        let free_inodes;
        {
            let fs = mount(&tmp);
            let ino = fs
                .create(ROOT_INO, "file", crate::inode::S_IFREG | 0o644, 0, 0)
                .unwrap();
            fs.write_file(ino, 0, &[0xAB; 3 * BLOCK_SIZE]).unwrap();
            free_blocks = fs.alloc.free_blocks_count();
            free_inodes = fs.alloc.free_inodes();
            fs.unmount().unwrap();
        }
        let fs = mount(&tmp);
        assert_eq!(fs.alloc.free_blocks_count(), free_blocks);
        assert_eq!(fs.alloc.free_inodes(), free_inodes);
        // The superblock counters agree with the bitmap population counts
        fs.alloc.with_bitmaps(|ifree, bfree| {
            assert_eq!(ifree.count_ones(), free_inodes);
            assert_eq!(bfree.count_ones(), free_blocks);
        });
        let ino = fs.lookup(ROOT_INO, "file").unwrap();
        let mut out = vec![0u8; 3 * BLOCK_SIZE];
        assert_eq!(fs.read_file(ino, 0, &mut out).unwrap(), 3 * BLOCK_SIZE);
        assert!(out.iter().all(|&b| b == 0xAB));
    }
}
