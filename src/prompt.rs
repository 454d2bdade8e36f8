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

//! Terminal input for the tools: volume-password entry with echo disabled,
//! and yes/no confirmation before destructive operations.

use libc::{ECHO, ECHOE, ICANON, STDIN_FILENO, TCSANOW, VMIN, tcgetattr, tcsetattr, termios};
use std::io::BufRead;
use std::io::Write;
use std::mem::MaybeUninit;
use std::io;

/// Puts stdin in non-canonical, no-echo mode for the guard's lifetime. The
/// saved terminal settings come back even if the read bails early.
struct HiddenInput {
    saved: termios,
}

impl HiddenInput {
    fn start() -> Self {
        let saved = unsafe {
            let mut t: termios = MaybeUninit::zeroed().assume_init();
            tcgetattr(STDIN_FILENO, &mut t);
            t
        };
        let mut hidden = saved;
        hidden.c_lflag &= !(ICANON | ECHO | ECHOE);
        hidden.c_cc[VMIN] = 1;
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &hidden);
        }
        Self { saved }
    }
}

impl Drop for HiddenInput {
    fn drop(&mut self) {
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &self.saved);
        }
    }
}

fn read_line() -> Option<String> {
    io::stdin().lock().lines().next()?.ok()
}

/// Prompts for a volume password without echoing it. Returns `None` when
/// stdin is closed before a line comes in.
pub fn read_password(prompt: &str) -> Option<String> {
    print!("{prompt}");
    let _ = io::stdout().flush();
    let password = {
        let _hidden = HiddenInput::start();
        read_line()
    };
    // The typed newline was swallowed along with the echo
    println!();
    password
}

/// Asks the given yes/no question. Anything but an explicit `y` answers no.
pub fn confirm(question: &str) -> bool {
    print!("{question} (y/N) ");
    let _ = io::stdout().flush();
    matches!(read_line().as_deref(), Some("y" | "Y"))
}
