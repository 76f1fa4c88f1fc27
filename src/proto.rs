//! Fixed-size frames for the line-oriented TCP protocol.
//!
//! A client sends commands as 128-byte zero-padded ASCII frames; the server
//! answers with 4096-byte zero-padded frames. The padding always leaves at
//! least one terminating zero, so a frame's text is everything up to the
//! first zero byte.

use std::io;
use std::io::Read;
use std::io::Write;

/// The size of a command frame in bytes.
pub const COMMAND_LEN: usize = 128;
/// The size of a reply frame in bytes.
pub const MSG_LEN: usize = 4096;

/// Sends `msg` as a zero-padded frame of `len` bytes.
///
/// A message longer than `len - 1` bytes is truncated.
pub fn send_frame<W: Write>(stream: &mut W, msg: &str, len: usize) -> io::Result<()> {
	let mut frame = vec![0u8; len];
	let bytes = msg.as_bytes();
	let n = bytes.len().min(len - 1);
	frame[..n].copy_from_slice(&bytes[..n]);
	stream.write_all(&frame)
}

/// Receives one zero-padded frame of `len` bytes.
///
/// Returns `None` when the peer closed the connection.
pub fn recv_frame<R: Read>(stream: &mut R, len: usize) -> io::Result<Option<String>> {
	let mut frame = vec![0u8; len];
	match stream.read_exact(&mut frame) {
		Ok(()) => {}
		Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e),
	}
	let end = frame.iter().position(|b| *b == 0).unwrap_or(len);
	Ok(Some(String::from_utf8_lossy(&frame[..end]).into_owned()))
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn round_trip() {
		let mut buf = Vec::new();
		send_frame(&mut buf, "ls /home", COMMAND_LEN).unwrap();
		assert_eq!(buf.len(), COMMAND_LEN);

		let mut cursor = Cursor::new(buf);
		let msg = recv_frame(&mut cursor, COMMAND_LEN).unwrap().unwrap();
		assert_eq!(msg, "ls /home");
	}

	#[test]
	fn truncation() {
		let long = "x".repeat(COMMAND_LEN + 50);
		let mut buf = Vec::new();
		send_frame(&mut buf, &long, COMMAND_LEN).unwrap();
		assert_eq!(buf.len(), COMMAND_LEN);
		// the last byte always terminates the text
		assert_eq!(buf[COMMAND_LEN - 1], 0);

		let msg = recv_frame(&mut Cursor::new(buf), COMMAND_LEN).unwrap().unwrap();
		assert_eq!(msg.len(), COMMAND_LEN - 1);
	}

	#[test]
	fn closed_connection() {
		let mut empty = Cursor::new(Vec::new());
		assert!(recv_frame(&mut empty, COMMAND_LEN).unwrap().is_none());

		// a short frame also counts as a closed connection
		let mut short = Cursor::new(vec![1u8; 10]);
		assert!(recv_frame(&mut short, COMMAND_LEN).unwrap().is_none());
	}

	#[test]
	fn back_to_back_frames() {
		let mut buf = Vec::new();
		send_frame(&mut buf, "first", COMMAND_LEN).unwrap();
		send_frame(&mut buf, "second", COMMAND_LEN).unwrap();

		let mut cursor = Cursor::new(buf);
		assert_eq!(recv_frame(&mut cursor, COMMAND_LEN).unwrap().unwrap(), "first");
		assert_eq!(recv_frame(&mut cursor, COMMAND_LEN).unwrap().unwrap(), "second");
		assert!(recv_frame(&mut cursor, COMMAND_LEN).unwrap().is_none());
	}
}
