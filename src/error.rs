//! Error kinds surfaced at the filesystem boundary.

use std::fmt;
use std::io;

/// An error returned by a filesystem operation.
#[derive(Debug)]
pub enum Error {
	/// An intermediate or final path component does not exist.
	NotFound,
	/// The target name is already present.
	Exists,
	/// Directory operation on a regular file or vice versa.
	NotDirectory,
	/// Removal of a non-empty directory.
	NotEmpty,
	/// Malformed flags, invalid whence, name too long, or a bad descriptor.
	Invalid,
	/// The allocator is exhausted.
	NoSpace,
	/// An I/O failure at the device layer.
	Io(io::Error),
}

/// A result with a filesystem [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotFound => write!(fmt, "No such file or directory"),
			Self::Exists => write!(fmt, "File exists"),
			Self::NotDirectory => write!(fmt, "Not a directory"),
			Self::NotEmpty => write!(fmt, "Directory not empty"),
			Self::Invalid => write!(fmt, "Invalid argument"),
			Self::NoSpace => write!(fmt, "No space left on device"),
			Self::Io(e) => write!(fmt, "{e}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}
