//! Core of the `mfs` filesystem server: an ext2 image living inside a
//! fixed-size backing file, exposed through POSIX-shaped file and directory
//! operations and a small command shell.

use std::fmt;
use std::process::exit;

pub mod bitmap;
pub mod cache;
pub mod disk;
pub mod error;
pub mod ext2;
pub mod layout;
pub mod prompt;
pub mod proto;
pub mod shell;
pub mod user;
pub mod util;
pub mod vfs;

/// Writes an error to stderr, then exits.
pub fn fatal<M: fmt::Display>(bin: &str, msg: M) -> ! {
	eprintln!("{bin}: error: {msg}");
	exit(1);
}
