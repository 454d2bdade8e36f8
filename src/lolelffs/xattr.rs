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

//! Extended attributes.
//!
//! An inode's xattrs live in a packed entry stream addressed by a dedicated
//! extent index block. Each entry is a 12-byte header followed by the
//! NUL-terminated name and the value, padded to 4-byte alignment. The data
//! run is reallocated whenever the stream outgrows it; the index block
//! itself is only freed with the inode.

use crate::error::{FsError, FsResult};
use crate::fs::LolElfFs;
use crate::layout::{
    self, BLOCK_SIZE, Extent, FILENAME_LEN, XATTR_PREFIXES, XATTR_TOTAL_MAX, XATTR_VALUE_MAX,
    XattrIndexBlock,
};

/// Fail if the attribute already exists.
pub const XATTR_CREATE: u32 = 0x1;
/// Fail if the attribute does not exist.
pub const XATTR_REPLACE: u32 = 0x2;

/// Size of the packed entry header.
const ENTRY_HEADER: usize = 12;

/// One parsed entry of the packed stream.
struct StreamEntry {
    offset: usize,
    size: usize,
    name_index: u8,
    name_start: usize,
    name_len: usize,
    value_start: usize,
    value_len: usize,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Walks the packed entry stream.
fn entries(data: &[u8]) -> impl Iterator<Item = StreamEntry> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset + ENTRY_HEADER > data.len() {
            return None;
        }
        let name_len = data[offset] as usize;
        if name_len == 0 {
            return None;
        }
        let name_index = data[offset + 1];
        let value_len = u16::from_le_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_offset =
            u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let size = align4(ENTRY_HEADER + name_len + 1 + value_len);
        if offset + size > data.len() {
            return None;
        }
        let entry = StreamEntry {
            offset,
            size,
            name_index,
            name_start: offset + ENTRY_HEADER,
            name_len,
            value_start: offset + value_offset,
            value_len,
        };
        offset += size;
        Some(entry)
    })
}

fn find_entry(data: &[u8], name_index: u8, name: &str) -> Option<StreamEntry> {
    entries(data).find(|e| {
        e.name_index == name_index && &data[e.name_start..e.name_start + e.name_len] == name.as_bytes()
    })
}

fn check_xattr_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > FILENAME_LEN {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

impl LolElfFs {
    /// Reads the whole packed stream of the given xattr index block.
    fn read_xattr_stream(&self, xattr_block: u32) -> FsResult<Vec<u8>> {
        let index_buf = self.dev.read_block(xattr_block)?;
        let data = index_buf.data();
        let index = layout::reinterpret::<XattrIndexBlock>(&data.0);
        let total = index.total_size as usize;
        let mut stream = Vec::with_capacity(total);
        'outer: for ext in &index.extents {
            if ext.start == 0 {
                break;
            }
            for bi in 0..ext.len {
                if stream.len() >= total {
                    break 'outer;
                }
                let buf = self.dev.read_block(ext.start + bi)?;
                let chunk = BLOCK_SIZE.min(total - stream.len());
                stream.extend_from_slice(&buf.data().0[..chunk]);
            }
        }
        Ok(stream)
    }

    /// Writes the packed stream back into the index's data run, growing the
    /// run if needed, and updates `total_size` and `count`.
    fn write_xattr_stream(&self, xattr_block: u32, stream: &[u8], count: u32) -> FsResult<()> {
        let index_buf = self.dev.read_block(xattr_block)?;
        let blocks_needed = layout::div_ceil(stream.len().max(1) as u32, BLOCK_SIZE as u32);
        let run = {
            let data = index_buf.data();
            let index = layout::reinterpret::<XattrIndexBlock>(&data.0);
            let ext = index.extents[0];
            if ext.start == 0 || ext.len < blocks_needed {
                // The stream no longer fits: get a fresh run first
                let start = self.alloc.alloc_blocks(blocks_needed);
                if start == 0 {
                    return Err(FsError::NoSpace);
                }
                if ext.start != 0 {
                    self.alloc.free_blocks(ext.start, ext.len);
                }
                Extent {
                    logical: 0,
                    len: blocks_needed,
                    start,
                    ..Default::default()
                }
            } else {
                ext
            }
        };
        let mut written = 0;
        for bi in 0..run.len {
            if written >= stream.len() {
                break;
            }
            let chunk = BLOCK_SIZE.min(stream.len() - written);
            let buf = self.dev.read_block(run.start + bi)?;
            {
                let mut data = buf.data_mut();
                data.0[..chunk].copy_from_slice(&stream[written..written + chunk]);
                data.0[chunk..].fill(0);
            }
            buf.mark_dirty();
            self.dev.sync_buffer(&buf)?;
            written += chunk;
        }
        {
            let mut data = index_buf.data_mut();
            let index = layout::reinterpret_mut::<XattrIndexBlock>(&mut data.0);
            index.extents[0] = run;
            index.total_size = stream.len() as u32;
            index.count = count;
        }
        index_buf.mark_dirty();
        self.dev.sync_buffer(&index_buf)
    }

    fn xattr_count(&self, xattr_block: u32) -> FsResult<u32> {
        let buf = self.dev.read_block(xattr_block)?;
        let data = buf.data();
        Ok(layout::reinterpret::<XattrIndexBlock>(&data.0).count)
    }

    /// Returns the value of the extended attribute `name` in the given
    /// namespace.
    pub fn get_xattr(&self, ino: u32, name_index: u8, name: &str) -> FsResult<Vec<u8>> {
        check_xattr_name(name)?;
        let inode = self.read_inode(ino)?;
        if inode.xattr_block == 0 {
            return Err(FsError::NoData);
        }
        let stream = self.read_xattr_stream(inode.xattr_block)?;
        let Some(entry) = find_entry(&stream, name_index, name) else {
            return Err(FsError::NoData);
        };
        Ok(stream[entry.value_start..entry.value_start + entry.value_len].to_vec())
    }

    /// Sets the extended attribute `name` to `value`.
    ///
    /// `XATTR_CREATE` fails if the name already exists, `XATTR_REPLACE`
    /// fails if it does not; otherwise any existing entry is replaced.
    pub fn set_xattr(
        &self,
        ino: u32,
        name_index: u8,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> FsResult<()> {
        check_xattr_name(name)?;
        if name_index as usize >= XATTR_PREFIXES.len() || value.len() > XATTR_VALUE_MAX {
            return Err(FsError::InvalidArgument);
        }
        let mut inode = self.read_inode(ino)?;
        // Allocate and zero the index block on first use
        if inode.xattr_block == 0 {
            let block = self.alloc.alloc_blocks(1);
            if block == 0 {
                return Err(FsError::NoSpace);
            }
            let buf = self.dev.read_block(block)?;
            buf.data_mut().0.fill(0);
            buf.mark_dirty();
            self.dev.sync_buffer(&buf)?;
            inode.xattr_block = block;
            self.write_inode(ino, &inode)?;
        }
        let mut stream = self.read_xattr_stream(inode.xattr_block)?;
        let mut count = self.xattr_count(inode.xattr_block)?;
        match find_entry(&stream, name_index, name) {
            Some(entry) => {
                if flags & XATTR_CREATE != 0 {
                    return Err(FsError::AlreadyExists);
                }
                stream.drain(entry.offset..entry.offset + entry.size);
                count -= 1;
            }
            None => {
                if flags & XATTR_REPLACE != 0 {
                    return Err(FsError::NoData);
                }
            }
        }
        // Append the new entry: header, name, NUL, value, alignment padding
        let entry_size = align4(ENTRY_HEADER + name.len() + 1 + value.len());
        if stream.len() + entry_size > XATTR_TOTAL_MAX {
            return Err(FsError::NoSpace);
        }
        let value_offset = (ENTRY_HEADER + name.len() + 1) as u32;
        stream.push(name.len() as u8);
        stream.push(name_index);
        stream.extend_from_slice(&(value.len() as u16).to_le_bytes());
        stream.extend_from_slice(&value_offset.to_le_bytes());
        stream.extend_from_slice(&0u32.to_le_bytes());
        stream.extend_from_slice(name.as_bytes());
        stream.push(0);
        stream.extend_from_slice(value);
        while stream.len() % 4 != 0 {
            stream.push(0);
        }
        self.write_xattr_stream(inode.xattr_block, &stream, count + 1)
    }

    /// Removes the extended attribute `name`.
    pub fn remove_xattr(&self, ino: u32, name_index: u8, name: &str) -> FsResult<()> {
        check_xattr_name(name)?;
        let inode = self.read_inode(ino)?;
        if inode.xattr_block == 0 {
            return Err(FsError::NoData);
        }
        let mut stream = self.read_xattr_stream(inode.xattr_block)?;
        let count = self.xattr_count(inode.xattr_block)?;
        let Some(entry) = find_entry(&stream, name_index, name) else {
            return Err(FsError::NoData);
        };
        stream.drain(entry.offset..entry.offset + entry.size);
        self.write_xattr_stream(inode.xattr_block, &stream, count - 1)
    }

    /// Lists the attributes of the inode as `prefix.name` strings.
    pub fn list_xattrs(&self, ino: u32) -> FsResult<Vec<String>> {
        let inode = self.read_inode(ino)?;
        if inode.xattr_block == 0 {
            return Ok(Vec::new());
        }
        let stream = self.read_xattr_stream(inode.xattr_block)?;
        Ok(entries(&stream)
            .map(|e| {
                let prefix = XATTR_PREFIXES
                    .get(e.name_index as usize)
                    .copied()
                    .unwrap_or("");
                let name = String::from_utf8_lossy(&stream[e.name_start..e.name_start + e.name_len]);
                format!("{prefix}{name}")
            })
            .collect())
    }

    /// Releases the inode's xattr data blocks and index block. Called when
    /// the inode itself is freed.
    pub(crate) fn free_xattr_blocks(&self, ino: u32) -> FsResult<()> {
        let mut inode = self.read_inode(ino)?;
        if inode.xattr_block == 0 {
            return Ok(());
        }
        {
            let buf = self.dev.read_block(inode.xattr_block)?;
            let data = buf.data();
            let index = layout::reinterpret::<XattrIndexBlock>(&data.0);
            for ext in &index.extents {
                if ext.start == 0 {
                    break;
                }
                self.alloc.free_blocks(ext.start, ext.len);
            }
        }
        self.alloc.free_blocks(inode.xattr_block, 1);
        inode.xattr_block = 0;
        self.write_inode(ino, &inode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::ROOT_INO;
    use crate::inode::S_IFREG;
    use crate::layout::{XATTR_INDEX_SECURITY, XATTR_INDEX_USER};
    use crate::testutil::{default_image, mount};

    fn file_with_fs() -> (tempfile::NamedTempFile, u32) {
        let tmp = default_image(512);
        let ino = {
            let fs = mount(&tmp);
            let ino = fs.create(ROOT_INO, "attrs", S_IFREG | 0o644, 0, 0).unwrap();
            fs.unmount().unwrap();
            ino
        };
        (tmp, ino)
    }

    #[test]
    fn set_get_remove_round_trip() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        fs.set_xattr(ino, XATTR_INDEX_USER, "comment", b"hello", 0)
            .unwrap();
        assert_eq!(
            fs.get_xattr(ino, XATTR_INDEX_USER, "comment").unwrap(),
            b"hello"
        );
        fs.remove_xattr(ino, XATTR_INDEX_USER, "comment").unwrap();
        assert!(matches!(
            fs.get_xattr(ino, XATTR_INDEX_USER, "comment"),
            Err(FsError::NoData)
        ));
    }

    #[test]
    fn missing_attribute_is_nodata() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        assert!(matches!(
            fs.get_xattr(ino, XATTR_INDEX_USER, "nope"),
            Err(FsError::NoData)
        ));
        assert!(matches!(
            fs.remove_xattr(ino, XATTR_INDEX_USER, "nope"),
            Err(FsError::NoData)
        ));
    }

    #[test]
    fn create_and_replace_flags() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        assert!(matches!(
            fs.set_xattr(ino, XATTR_INDEX_USER, "a", b"v", XATTR_REPLACE),
            Err(FsError::NoData)
        ));
        fs.set_xattr(ino, XATTR_INDEX_USER, "a", b"v1", XATTR_CREATE)
            .unwrap();
        assert!(matches!(
            fs.set_xattr(ino, XATTR_INDEX_USER, "a", b"v2", XATTR_CREATE),
            Err(FsError::AlreadyExists)
        ));
        fs.set_xattr(ino, XATTR_INDEX_USER, "a", b"v2", XATTR_REPLACE)
            .unwrap();
        assert_eq!(fs.get_xattr(ino, XATTR_INDEX_USER, "a").unwrap(), b"v2");
    }

    #[test]
    fn namespaces_are_distinct() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        fs.set_xattr(ino, XATTR_INDEX_USER, "tag", b"user", 0).unwrap();
        fs.set_xattr(ino, XATTR_INDEX_SECURITY, "tag", b"sec", 0)
            .unwrap();
        assert_eq!(fs.get_xattr(ino, XATTR_INDEX_USER, "tag").unwrap(), b"user");
        assert_eq!(
            fs.get_xattr(ino, XATTR_INDEX_SECURITY, "tag").unwrap(),
            b"sec"
        );
        let mut names = fs.list_xattrs(ino).unwrap();
        names.sort();
        assert_eq!(names, ["security.tag", "user.tag"]);
    }

    #[test]
    fn large_value_spans_blocks() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        let value: Vec<u8> = (0..9000u32).map(|i| (i % 256) as u8).collect();
        fs.set_xattr(ino, XATTR_INDEX_USER, "blob", &value, 0).unwrap();
        assert_eq!(fs.get_xattr(ino, XATTR_INDEX_USER, "blob").unwrap(), value);
        // Growing the stream reallocates the data run
        let bigger: Vec<u8> = vec![0x42; 20000];
        fs.set_xattr(ino, XATTR_INDEX_USER, "blob2", &bigger, 0).unwrap();
        assert_eq!(fs.get_xattr(ino, XATTR_INDEX_USER, "blob").unwrap(), value);
        assert_eq!(
            fs.get_xattr(ino, XATTR_INDEX_USER, "blob2").unwrap(),
            bigger
        );
    }

    #[test]
    fn limits_enforced() {
        let (tmp, ino) = file_with_fs();
        let fs = mount(&tmp);
        // Value too long
        assert!(matches!(
            fs.set_xattr(ino, XATTR_INDEX_USER, "big", &vec![0; XATTR_VALUE_MAX + 1], 0),
            Err(FsError::InvalidArgument)
        ));
        // Stream capped at 32 KiB
        fs.set_xattr(ino, XATTR_INDEX_USER, "a", &vec![1; 16000], 0)
            .unwrap();
        fs.set_xattr(ino, XATTR_INDEX_USER, "b", &vec![2; 16000], 0)
            .unwrap();
        assert!(matches!(
            fs.set_xattr(ino, XATTR_INDEX_USER, "c", &vec![3; 1000], 0),
            Err(FsError::NoSpace)
        ));
        // Bad names
        assert!(fs.set_xattr(ino, XATTR_INDEX_USER, "", b"v", 0).is_err());
        assert!(
            fs.set_xattr(ino, XATTR_INDEX_USER, &"n".repeat(256), b"v", 0)
                .is_err()
        );
    }

    #[test]
    fn xattrs_survive_remount() {
        let (tmp, ino) = file_with_fs();
        {
            let fs = mount(&tmp);
            fs.set_xattr(ino, XATTR_INDEX_USER, "persist", b"yes", 0)
                .unwrap();
            fs.unmount().unwrap();
        }
        let fs = mount(&tmp);
        assert_eq!(
            fs.get_xattr(ino, XATTR_INDEX_USER, "persist").unwrap(),
            b"yes"
        );
    }
}
