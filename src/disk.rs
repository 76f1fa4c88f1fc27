//! The block device: a fixed-size backing file accessed in whole blocks.

use crate::layout::BLOCK_SIZE;
use std::fs::OpenOptions;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// A fixed-size random-access store of whole blocks backed by a host file.
pub struct Disk {
	/// The backing file.
	file: File,
	/// The number of blocks on the device.
	blocks_count: u32,
}

impl Disk {
	/// Opens the device backed by the file at `path`.
	///
	/// If the file does not exist or is too short, it is created and
	/// zero-extended to `disk_size` bytes.
	pub fn open(path: &Path, disk_size: u64) -> io::Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		if file.metadata()?.len() < disk_size {
			file.set_len(disk_size)?;
		}

		Ok(Self {
			file,
			blocks_count: (disk_size / BLOCK_SIZE as u64) as u32,
		})
	}

	/// Returns the number of blocks on the device.
	pub fn blocks_count(&self) -> u32 {
		self.blocks_count
	}

	/// Reads the block `blk` into `buf`.
	pub fn read_block(&mut self, blk: u32, buf: &mut [u8]) -> io::Result<()> {
		assert!(blk < self.blocks_count);
		assert_eq!(buf.len(), BLOCK_SIZE as usize);

		self.file.seek(SeekFrom::Start(blk as u64 * BLOCK_SIZE as u64))?;
		self.file.read_exact(buf)
	}

	/// Writes `buf` to the block `blk`.
	pub fn write_block(&mut self, blk: u32, buf: &[u8]) -> io::Result<()> {
		assert!(blk < self.blocks_count);
		assert_eq!(buf.len(), BLOCK_SIZE as usize);

		self.file.seek(SeekFrom::Start(blk as u64 * BLOCK_SIZE as u64))?;
		self.file.write_all(buf)
	}

	/// Flushes written blocks to persistent storage.
	pub fn sync(&mut self) -> io::Result<()> {
		self.file.sync_data()
	}
}
