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

//! The `unlock` tool forwards a password into an encrypted volume's control
//! channel and reports the resulting encryption status.

use crate::error;
use crate::prompt;
use lolelffs::LolElfFs;
use lolelffs::fs::{ControlRequest, ControlResponse, UnlockRequest};
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The path to the volume.
    image: Option<PathBuf>,
    /// The password. Prompted for when absent.
    password: Option<String>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            _ => {
                if res.image.is_none() {
                    res.image = Some(PathBuf::from(arg));
                } else if res.password.is_none() {
                    res.password = arg.to_str().map(str::to_owned);
                }
            }
        }
    }
    res
}

fn print_status(fs: &LolElfFs) -> u32 {
    let status = fs.enc_status();
    println!("Encryption status:");
    println!(
        "  Enabled: {}",
        if status.enc_enabled != 0 { "yes" } else { "no" }
    );
    println!("  Algorithm: {}", status.enc_algorithm);
    println!(
        "  Unlocked: {}",
        if status.enc_unlocked != 0 { "yes" } else { "no" }
    );
    status.enc_unlocked
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        println!("usage: unlock.lolelffs <image> [password]");
        println!();
        println!("Unlock an encrypted lolelffs filesystem.");
        return;
    }
    let image = args.image.unwrap_or_else(|| {
        error("unlock.lolelffs", "specify path to a volume");
    });
    let fs = LolElfFs::mount(&image).unwrap_or_else(|e| {
        error("unlock.lolelffs", format_args!("{}: {e}", image.display()));
    });

    println!("Checking encryption status...");
    print_status(&fs);

    let password = args
        .password
        .or_else(|| prompt::read_password("Password: "))
        .unwrap_or_else(|| {
            error("unlock.lolelffs", "no password given");
        });
    let request = UnlockRequest::new(password.as_bytes()).unwrap_or_else(|e| {
        error("unlock.lolelffs", e);
    });

    println!("\nUnlocking filesystem...");
    match fs.control(ControlRequest::Unlock(&request)) {
        Ok(ControlResponse::Unlocked) => {
            println!("Filesystem unlocked successfully!");
            println!("\nVerifying unlock status...");
            print_status(&fs);
        }
        Ok(ControlResponse::Status(_)) => unreachable!(),
        Err(e) => {
            eprintln!("Failed to unlock filesystem: {e}");
            eprintln!();
            eprintln!("Possible reasons:");
            eprintln!("  - Incorrect password");
            eprintln!("  - Filesystem is not encrypted");
            exit(1);
        }
    }
}
