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

//! Multi-call binary for the `lolelffs` tools: `mkfs.lolelffs`,
//! `fsck.lolelffs` and `unlock.lolelffs`.

mod disk;
mod fsck;
mod mkfs;
mod prompt;
mod unlock;

use std::env;
use std::env::ArgsOs;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

/// Returns the command's name along with an iterator over the command's
/// arguments.
fn args() -> (String, ArgsOs) {
    let mut args = env::args_os();
    let bin = args
        .next()
        .map(PathBuf::from)
        .and_then(|p| {
            p.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            error("lolfs", "missing binary name");
        });
    (bin, args)
}

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

fn main() {
    env_logger::init();
    lolelffs::init();
    let (bin, mut args) = args();
    // Installed as `mkfs.lolelffs` etc.; the bare binary takes the tool name
    // as its first argument
    let tool = if bin.as_str() == "lolfs" {
        args.next()
            .and_then(|s| s.into_string().ok())
            .unwrap_or_else(|| {
                error("lolfs", "usage: lolfs <mkfs|fsck|unlock> [options] <image>");
            })
    } else {
        bin
    };
    match tool.as_str() {
        "mkfs" | "mkfs.lolelffs" => mkfs::main(args),
        "fsck" | "fsck.lolelffs" => fsck::main(args),
        "unlock" | "unlock.lolelffs" => unlock::main(args),
        _ => error("lolfs", format_args!("invalid binary name `{tool}`")),
    }
}
