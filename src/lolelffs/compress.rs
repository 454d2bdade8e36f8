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

//! Per-block compression.
//!
//! Compressed payloads are zero-padded to the block size on disk, so the
//! decompressor must find the end of the stream by itself: zlib and zstd
//! streams are self-terminating, LZ4 payloads carry a 4-byte little-endian
//! length prefix (`lz4_flex`'s size-prepended block format).

use crate::error::{FsError, FsResult};
use crate::layout::{COMP_LZ4, COMP_NONE, COMP_ZLIB, COMP_ZSTD};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io;
use std::io::{Read, Write};

/// zstd compression level, matching the original's default.
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

/// Tells whether the given compression algorithm is usable at runtime.
pub fn supported(algo: u16) -> bool {
    match algo {
        COMP_NONE | COMP_LZ4 | COMP_ZLIB => true,
        COMP_ZSTD => cfg!(feature = "zstd"),
        _ => false,
    }
}

/// Returns the algorithm's display name.
pub fn algo_name(algo: u16) -> &'static str {
    match algo {
        COMP_NONE => "none",
        COMP_LZ4 => "lz4",
        COMP_ZLIB => "zlib",
        COMP_ZSTD => "zstd",
        _ => "unknown",
    }
}

/// Logs the available compression algorithms.
pub fn init() {
    for algo in [COMP_LZ4, COMP_ZLIB, COMP_ZSTD] {
        if supported(algo) {
            log::info!("{} compression initialized", algo_name(algo));
        } else {
            log::info!("{} compression not available", algo_name(algo));
        }
    }
}

fn bad_data(msg: &'static str) -> FsError {
    FsError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Compresses `src` into `dst` and returns the compressed size.
///
/// An error only means the block is stored uncompressed instead; the write
/// path additionally requires the result to actually save space.
pub fn compress_block(algo: u16, src: &[u8], dst: &mut [u8]) -> FsResult<usize> {
    if algo == COMP_NONE {
        return Err(FsError::InvalidArgument);
    }
    if !supported(algo) {
        return Err(FsError::Unsupported);
    }
    match algo {
        COMP_LZ4 => {
            if dst.len() < 4 {
                return Err(bad_data("lz4 output buffer too small"));
            }
            let n = lz4_flex::block::compress_into(src, &mut dst[4..])
                .map_err(|_| bad_data("lz4 output buffer too small"))?;
            dst[..4].copy_from_slice(&(n as u32).to_le_bytes());
            Ok(4 + n)
        }
        COMP_ZLIB => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(src.len()), Compression::default());
            encoder.write_all(src)?;
            let out = encoder.finish()?;
            if out.len() > dst.len() {
                return Err(bad_data("zlib output larger than a block"));
            }
            dst[..out.len()].copy_from_slice(&out);
            Ok(out.len())
        }
        #[cfg(feature = "zstd")]
        COMP_ZSTD => {
            let out = zstd::bulk::compress(src, ZSTD_LEVEL)?;
            if out.len() > dst.len() {
                return Err(bad_data("zstd output larger than a block"));
            }
            dst[..out.len()].copy_from_slice(&out);
            Ok(out.len())
        }
        _ => Err(FsError::InvalidArgument),
    }
}

/// Decompresses the (possibly padded) payload `src` into `dst`, which must
/// be filled exactly. Any mismatch is an I/O error, never papered over.
pub fn decompress_block(algo: u16, src: &[u8], dst: &mut [u8]) -> FsResult<()> {
    if algo == COMP_NONE {
        return Err(FsError::InvalidArgument);
    }
    if !supported(algo) {
        return Err(FsError::Unsupported);
    }
    match algo {
        COMP_LZ4 => {
            let n = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
            if 4 + n > src.len() {
                return Err(bad_data("lz4 length prefix out of bounds"));
            }
            let written = lz4_flex::block::decompress_into(&src[4..4 + n], dst)
                .map_err(|_| bad_data("lz4 decompression failed"))?;
            if written != dst.len() {
                return Err(bad_data("lz4 decompressed size mismatch"));
            }
            Ok(())
        }
        COMP_ZLIB => {
            let mut decoder = ZlibDecoder::new(src);
            decoder.read_exact(dst)?;
            if decoder.read(&mut [0u8])? != 0 {
                return Err(bad_data("zlib decompressed size mismatch"));
            }
            Ok(())
        }
        #[cfg(feature = "zstd")]
        COMP_ZSTD => {
            let mut decoder = zstd::stream::read::Decoder::new(src)?.single_frame();
            decoder.read_exact(dst)?;
            if decoder.read(&mut [0u8])? != 0 {
                return Err(bad_data("zstd decompressed size mismatch"));
            }
            Ok(())
        }
        _ => Err(FsError::InvalidArgument),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::BLOCK_SIZE;

    fn supported_algos() -> Vec<u16> {
        [COMP_LZ4, COMP_ZLIB, COMP_ZSTD]
            .into_iter()
            .filter(|&a| supported(a))
            .collect()
    }

    #[test]
    fn padded_round_trip() {
        // Compressible data, zero-padded to a full block like the write path
        // does it
        let src = [0u8; BLOCK_SIZE];
        for algo in supported_algos() {
            let mut packed = [0u8; BLOCK_SIZE];
            let n = compress_block(algo, &src, &mut packed).unwrap();
            assert!(n < BLOCK_SIZE * 95 / 100, "{} did not compress zeros", algo_name(algo));
            let mut out = [0xFFu8; BLOCK_SIZE];
            decompress_block(algo, &packed, &mut out).unwrap();
            assert_eq!(src, out, "{algo} round trip");
        }
    }

    #[test]
    fn incompressible_input_reported() {
        // A pseudo-random block should not fit the saving threshold
        let mut src = [0u8; BLOCK_SIZE];
        let mut state = 0x12345678u32;
        for b in &mut src {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (state >> 24) as u8;
        }
        for algo in supported_algos() {
            let mut packed = [0u8; BLOCK_SIZE];
            match compress_block(algo, &src, &mut packed) {
                Ok(n) => assert!(n >= BLOCK_SIZE * 95 / 100),
                // Not fitting in the output buffer is the expected other
                // outcome
                Err(_) => {}
            }
        }
    }

    #[test]
    fn garbage_stream_is_an_error() {
        let packed = [0xFFu8; BLOCK_SIZE];
        for algo in supported_algos() {
            let mut out = [0u8; BLOCK_SIZE];
            assert!(decompress_block(algo, &packed, &mut out).is_err(), "{}", algo_name(algo));
        }
    }

    #[test]
    fn unknown_algo_rejected() {
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            compress_block(99, &[0u8; 16], &mut buf),
            Err(FsError::Unsupported)
        ));
        assert!(matches!(
            decompress_block(COMP_NONE, &buf.clone(), &mut buf),
            Err(FsError::InvalidArgument)
        ));
    }
}
