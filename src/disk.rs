//! Backing-store size lookup for `mkfs`.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;

/// `BLKGETSIZE64`, i.e. `_IOR(0x12, 114, u64)`: reads the size of a block
/// device in bytes.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

/// Returns the size in bytes of the device or image behind `dev`.
///
/// Regular files (and anything else that is not a device) report their
/// metadata length; block and character devices are asked directly.
pub fn get_size(dev: &File) -> io::Result<u64> {
    let metadata = dev.metadata()?;
    let file_type = metadata.file_type();
    if !file_type.is_block_device() && !file_type.is_char_device() {
        return Ok(metadata.len());
    }
    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}
