//! Shared helpers for the test modules.

use crate::fs::LolElfFs;
use crate::layout::BLOCK_SIZE;
use crate::mkfs::FsBuilder;
use std::fs::OpenOptions;
use tempfile::NamedTempFile;

/// Creates a formatted scratch image of `blocks` blocks.
pub fn format_image(blocks: u32, builder: &FsBuilder) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file()
        .set_len(blocks as u64 * BLOCK_SIZE as u64)
        .unwrap();
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    builder.create(&mut file).unwrap();
    tmp
}

/// Creates a formatted scratch image with the default settings.
pub fn default_image(blocks: u32) -> NamedTempFile {
    format_image(blocks, &FsBuilder::default())
}

/// Mounts a scratch image.
pub fn mount(tmp: &NamedTempFile) -> LolElfFs {
    LolElfFs::mount(tmp.path()).unwrap()
}
