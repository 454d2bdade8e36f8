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

//! The `mkfs` tool creates a `lolelffs` filesystem on a device or image.

use crate::error;
use crate::prompt;
use lolelffs::layout::{COMP_LZ4, COMP_NONE, COMP_ZLIB, COMP_ZSTD, ENC_AES256_XTS, ENC_CHACHA20_POLY};
use lolelffs::mkfs::{EncParams, FsBuilder};
use lolelffs::{compress, crypt};
use std::env::ArgsOs;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// Default compression algorithm name.
    comp: Option<String>,
    /// Encryption algorithm name; enables encryption.
    enc: Option<String>,
    /// If true, prompt for a volume password (implies encryption).
    password: bool,
    /// The path to the device file on which the filesystem will be created.
    device_path: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-c" | "--compression") => {
                res.comp = iter.next().and_then(|s| s.into_string().ok());
            }
            Some("-e" | "--encryption") => {
                res.enc = iter.next().and_then(|s| s.into_string().ok());
                res.password = true;
            }
            Some("-p" | "--password") => res.password = true,
            _ => {
                res.device_path = Some(PathBuf::from(arg));
            }
        }
    }
    res
}

fn usage() {
    println!("usage: mkfs.lolelffs [-c <none|lz4|zlib|zstd>] [-e <xts|chacha>] [-p] <device>");
    println!();
    println!("Creates a lolelffs filesystem. If the device is an ELF binary with a");
    println!(".lolfs.super section, the image is laid out inside that section.");
}

fn comp_algo(name: &str) -> Option<u32> {
    match name {
        "none" => Some(COMP_NONE as u32),
        "lz4" => Some(COMP_LZ4 as u32),
        "zlib" => Some(COMP_ZLIB as u32),
        "zstd" => Some(COMP_ZSTD as u32),
        _ => None,
    }
}

fn enc_algo(name: &str) -> Option<u8> {
    match name {
        "xts" | "aes-256-xts" => Some(ENC_AES256_XTS),
        "chacha" | "chacha20-poly1305" => Some(ENC_CHACHA20_POLY),
        _ => None,
    }
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        usage();
        return;
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        error("mkfs.lolelffs", "specify path to a device");
    });

    let mut builder = FsBuilder::default();
    if let Some(name) = &args.comp {
        let algo = comp_algo(name).unwrap_or_else(|| {
            error("mkfs.lolelffs", format_args!("invalid compression algorithm `{name}`"));
        });
        builder.comp_algo = algo;
        builder.comp_enabled = algo != COMP_NONE as u32;
    }
    if args.password {
        let algo = match &args.enc {
            Some(name) => enc_algo(name).unwrap_or_else(|| {
                error("mkfs.lolelffs", format_args!("invalid encryption algorithm `{name}`"));
            }),
            None => ENC_AES256_XTS,
        };
        let password = prompt::read_password("Volume password: ").unwrap_or_else(|| {
            error("mkfs.lolelffs", "no password given");
        });
        builder.encryption = Some(EncParams {
            algo,
            password,
            ..Default::default()
        });
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .unwrap_or_else(|e| {
            error("mkfs.lolelffs", format_args!("{}: {e}", device_path.display()));
        });
    builder.len = Some(crate::disk::get_size(&file).unwrap_or_else(|e| {
        error("mkfs.lolelffs", format_args!("{}: {e}", device_path.display()));
    }));

    // Refuse to silently clobber an existing filesystem
    let present = builder.is_present(&mut file).unwrap_or_else(|e| {
        error("mkfs.lolelffs", format_args!("{}: {e}", device_path.display()));
    });
    if present {
        println!(
            "{} contains a lolelffs file system",
            device_path.display()
        );
        if !prompt::confirm("Proceed anyway?") {
            eprintln!("Abort.");
            exit(1);
        }
    }

    let summary = builder.create(&mut file).unwrap_or_else(|e| {
        error("mkfs.lolelffs", format_args!("failed to create filesystem: {e}"));
    });
    println!("Superblock:");
    println!("\tmagic={:#x}", lolelffs::layout::MAGIC);
    println!("\tversion={}", lolelffs::layout::VERSION);
    println!("\tnr_blocks={}", summary.nr_blocks);
    println!(
        "\tnr_inodes={} (istore={} blocks)",
        summary.nr_inodes, summary.nr_istore_blocks
    );
    println!("\tnr_ifree_blocks={}", summary.nr_ifree_blocks);
    println!("\tnr_bfree_blocks={}", summary.nr_bfree_blocks);
    println!("\tnr_free_inodes={}", summary.nr_free_inodes);
    println!("\tnr_free_blocks={}", summary.nr_free_blocks);
    println!(
        "\tcompression={} (algo={})",
        if summary.comp_enabled { "yes" } else { "no" },
        compress::algo_name(summary.comp_algo as u16)
    );
    println!(
        "\tencryption={} (algo={})",
        if summary.enc_enabled { "yes" } else { "no" },
        crypt::algo_name(summary.enc_algo)
    );
    println!("\tmax_extent_blocks={}", summary.max_extent_blocks);
    if summary.fs_offset != 0 {
        println!("\tfs_offset={} blocks (embedded in ELF section)", summary.fs_offset);
    }
    println!();
    println!("Filesystem created successfully!");
}
