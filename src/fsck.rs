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

//! The `fsck` tool checks the consistency of a `lolelffs` image.

use crate::error;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// Verbose output.
    verbose: bool,
    /// The path to the image to check.
    image: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-v" | "--verbose") => res.verbose = true,
            _ => {
                res.image = Some(PathBuf::from(arg));
            }
        }
    }
    res
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        println!("usage: fsck.lolelffs [-v] <image>");
        println!();
        println!("Check the consistency of a lolelffs filesystem image.");
        return;
    }
    let image = args.image.unwrap_or_else(|| {
        error("fsck.lolelffs", "specify path to an image");
    });
    println!("Checking lolelffs filesystem: {}\n", image.display());
    let report = lolelffs::fsck::check(&image, args.verbose).unwrap_or_else(|e| {
        error("fsck.lolelffs", format_args!("{}: {e}", image.display()));
    });
    println!("\n========================================");
    if report.clean() {
        println!("Filesystem OK - no errors or warnings");
    } else {
        println!("Errors: {}, Warnings: {}", report.errors, report.warnings);
    }
    println!("========================================");
    if report.errors > 0 {
        exit(1);
    }
}
