//! The on-disk inode record and its block addressing scheme.
//!
//! An inode carries 15 block pointers: the first 12 address content blocks
//! directly, the last three go through one, two and three levels of pointer
//! blocks. A zero pointer terminates the chain at its level; the write path
//! keeps files dense, so a zero is always "not allocated yet" rather than a
//! hole.

use super::Ext2;
use super::FileType;
use crate::error::Error;
use crate::error::Result;
use crate::layout::BLOCK_SIZE;

/// The number of direct block pointers in an inode.
pub const DIRECT_BLOCKS: usize = 12;
/// The total number of block pointers in an inode.
pub const BLOCK_PTRS: usize = DIRECT_BLOCKS + 3;
/// The number of 512-byte sectors covered by one block.
pub const SECTORS_PER_BLOCK: u32 = BLOCK_SIZE / 512;

/// The number of block pointers held by one pointer block.
const PTRS_PER_BLOCK: u32 = BLOCK_SIZE / 4;

/// An on-disk inode record.
///
/// The name of the file is not included in the inode but in the directory
/// entry associated with it.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Inode {
	/// Type and permissions.
	pub mode: u16,
	/// User ID.
	pub uid: u16,
	/// Size in bytes.
	pub size: u32,
	/// Timestamp of the last access.
	pub atime: u32,
	/// Timestamp of the last metadata change.
	pub ctime: u32,
	/// Timestamp of the last content change.
	pub mtime: u32,
	/// Timestamp of the deletion.
	pub dtime: u32,
	/// Group ID.
	pub gid: u16,
	/// The number of hard links to this inode.
	pub links_count: u16,
	/// The number of 512-byte sectors used by the content.
	pub used_sectors: u32,
	/// Inode flags.
	pub flags: u32,
	/// OS-specific value.
	pub os_specific_0: u32,
	/// Block pointers: 12 direct, then single-, double- and triple-indirect.
	pub block_ptrs: [u32; BLOCK_PTRS],
	/// Generation number.
	pub generation: u32,
	/// The file's ACL.
	pub extended_attributes_block: u32,
	/// Higher 32 bits of size in bytes.
	pub size_high: u32,
	/// Block address of fragment.
	pub fragment_addr: u32,
	/// OS-specific value.
	pub os_specific_1: [u8; 12],
}

/// Decomposes the file block offset `off` into per-level pointer indexes.
///
/// Returns the indexes and the depth: 1 for a direct block, up to 4 for a
/// triple-indirect one. An offset beyond the triple-indirect range is
/// rejected with [`Error::Invalid`].
fn indirection_offsets(mut off: u32) -> Result<([usize; 4], usize)> {
	let mut offsets = [0usize; 4];
	if off < DIRECT_BLOCKS as u32 {
		offsets[0] = off as usize;
		return Ok((offsets, 1));
	}
	off -= DIRECT_BLOCKS as u32;
	if off < PTRS_PER_BLOCK {
		offsets[0] = DIRECT_BLOCKS;
		offsets[1] = off as usize;
		return Ok((offsets, 2));
	}
	off -= PTRS_PER_BLOCK;
	if off < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
		offsets[0] = DIRECT_BLOCKS + 1;
		offsets[1] = (off / PTRS_PER_BLOCK) as usize;
		offsets[2] = (off % PTRS_PER_BLOCK) as usize;
		return Ok((offsets, 3));
	}
	off -= PTRS_PER_BLOCK * PTRS_PER_BLOCK;
	if off < PTRS_PER_BLOCK * PTRS_PER_BLOCK * PTRS_PER_BLOCK {
		offsets[0] = DIRECT_BLOCKS + 2;
		offsets[1] = (off / (PTRS_PER_BLOCK * PTRS_PER_BLOCK)) as usize;
		offsets[2] = ((off / PTRS_PER_BLOCK) % PTRS_PER_BLOCK) as usize;
		offsets[3] = (off % PTRS_PER_BLOCK) as usize;
		return Ok((offsets, 4));
	}
	Err(Error::Invalid)
}

/// Reads the pointer at index `idx` of a pointer block buffer.
fn read_ptr(buf: &[u8], idx: usize) -> u32 {
	let off = idx * 4;
	u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Writes the pointer at index `idx` of a pointer block buffer.
fn write_ptr(buf: &mut [u8], idx: usize, val: u32) {
	buf[idx * 4..idx * 4 + 4].copy_from_slice(&val.to_le_bytes());
}

impl Inode {
	/// Returns an initialized record for a fresh file.
	///
	/// A regular file starts with one link, a directory with two ('.' and
	/// the entry in its parent).
	pub fn new(file_type: FileType, perms: u16, uid: u16, gid: u16, timestamp: u32) -> Self {
		let mut inode: Self = unsafe { std::mem::zeroed() };
		inode.mode = file_type.mode_bits() | (perms & 0o7777);
		inode.uid = uid;
		inode.gid = gid;
		inode.links_count = match file_type {
			FileType::Directory => 2,
			FileType::Regular => 1,
		};
		inode.atime = timestamp;
		inode.ctime = timestamp;
		inode.mtime = timestamp;
		inode
	}

	/// Returns the type of the file, if supported.
	pub fn file_type(&self) -> Option<FileType> {
		FileType::from_mode(self.mode)
	}

	/// Tells whether the inode is a directory.
	pub fn is_directory(&self) -> bool {
		self.file_type() == Some(FileType::Directory)
	}

	/// Tells whether the inode is a regular file.
	pub fn is_regular(&self) -> bool {
		self.file_type() == Some(FileType::Regular)
	}

	/// Returns the number of content blocks.
	pub fn blocks_count(&self) -> u32 {
		self.used_sectors / SECTORS_PER_BLOCK
	}

	/// Translates the file block offset `off` to a disk block index.
	///
	/// Returns `None` if the block is not allocated.
	pub fn translate_blk(&self, fs: &mut Ext2, off: u32) -> Result<Option<u32>> {
		let (offsets, depth) = indirection_offsets(off)?;
		let ptrs = self.block_ptrs;
		let mut blk = ptrs[offsets[0]];
		for level in 1..depth {
			if blk == 0 {
				return Ok(None);
			}
			let mut buf = [0u8; BLOCK_SIZE as usize];
			fs.read_block(blk, &mut buf)?;
			blk = read_ptr(&buf, offsets[level]);
		}
		if blk == 0 {
			return Ok(None);
		}
		Ok(Some(blk))
	}

	/// Allocates the content block at the file block offset `off`, lazily
	/// allocating the pointer blocks leading to it.
	///
	/// Every allocated block is zero-filled. Allocation prefers the group
	/// `preferred_group`; on exhaustion nothing is linked and
	/// [`Error::NoSpace`] is returned.
	///
	/// If the block already exists, its index is returned unchanged.
	pub fn alloc_blk(&mut self, fs: &mut Ext2, off: u32, preferred_group: u32) -> Result<u32> {
		let (offsets, depth) = indirection_offsets(off)?;

		// walk the part of the chain that already exists
		let mut chain = Vec::with_capacity(depth);
		let ptrs = self.block_ptrs;
		let mut blk = ptrs[offsets[0]];
		while blk != 0 {
			chain.push(blk);
			if chain.len() == depth {
				return Ok(blk);
			}
			let mut buf = [0u8; BLOCK_SIZE as usize];
			fs.read_block(blk, &mut buf)?;
			blk = read_ptr(&buf, offsets[chain.len()]);
		}

		// allocate the missing tail at once so that a failure links nothing
		let missing = depth - chain.len();
		let new = fs.ballocs(preferred_group, missing)?;
		for n in &new {
			fs.zero_block(*n)?;
		}

		// link the tail to the chain
		match chain.last() {
			None => self.block_ptrs[offsets[0]] = new[0],
			Some(&parent) => {
				let mut buf = [0u8; BLOCK_SIZE as usize];
				fs.read_block(parent, &mut buf)?;
				write_ptr(&mut buf, offsets[chain.len()], new[0]);
				fs.write_block(parent, &buf)?;
			}
		}
		for i in 1..new.len() {
			let mut buf = [0u8; BLOCK_SIZE as usize];
			fs.read_block(new[i - 1], &mut buf)?;
			write_ptr(&mut buf, offsets[chain.len() + i], new[i]);
			fs.write_block(new[i - 1], &buf)?;
		}

		self.used_sectors += SECTORS_PER_BLOCK;
		Ok(new[missing - 1])
	}

	/// Collects the data blocks of the inode in file order, walking the
	/// pointer tree until the first zero pointer at each level.
	pub fn collect_blocks(&self, fs: &mut Ext2) -> Result<Vec<u32>> {
		let mut blocks = Vec::new();
		let ptrs = self.block_ptrs;
		for (i, &blk) in ptrs.iter().enumerate() {
			if blk == 0 {
				return Ok(blocks);
			}
			if i < DIRECT_BLOCKS {
				blocks.push(blk);
			} else if !Self::collect_indirect(fs, blk, i - DIRECT_BLOCKS + 1, &mut blocks)? {
				return Ok(blocks);
			}
		}
		Ok(blocks)
	}

	/// Collects the data blocks reachable through the pointer block `blk` at
	/// the indirection level `level`.
	///
	/// Returns `false` when a zero pointer ended the walk.
	fn collect_indirect(
		fs: &mut Ext2,
		blk: u32,
		level: usize,
		blocks: &mut Vec<u32>,
	) -> Result<bool> {
		let mut buf = [0u8; BLOCK_SIZE as usize];
		fs.read_block(blk, &mut buf)?;
		for i in 0..PTRS_PER_BLOCK as usize {
			let child = read_ptr(&buf, i);
			if child == 0 {
				return Ok(false);
			}
			if level == 1 {
				blocks.push(child);
			} else if !Self::collect_indirect(fs, child, level - 1, blocks)? {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Frees every content block of the inode: the data blocks and the
	/// pointer blocks at every level.
	pub fn free_content(&mut self, fs: &mut Ext2) -> Result<()> {
		let ptrs = self.block_ptrs;
		for (i, &blk) in ptrs.iter().enumerate() {
			if blk == 0 {
				continue;
			}
			if i < DIRECT_BLOCKS {
				fs.bfree(blk)?;
			} else {
				Self::free_indirect(fs, blk, i - DIRECT_BLOCKS + 1)?;
			}
		}
		self.block_ptrs = [0; BLOCK_PTRS];
		self.used_sectors = 0;
		self.size = 0;
		Ok(())
	}

	/// Frees the pointer block `blk` at the indirection level `level` along
	/// with everything reachable from it.
	fn free_indirect(fs: &mut Ext2, blk: u32, level: usize) -> Result<()> {
		let mut buf = [0u8; BLOCK_SIZE as usize];
		fs.read_block(blk, &mut buf)?;
		for i in 0..PTRS_PER_BLOCK as usize {
			let child = read_ptr(&buf, i);
			if child == 0 {
				continue;
			}
			if level == 1 {
				fs.bfree(child)?;
			} else {
				Self::free_indirect(fs, child, level - 1)?;
			}
		}
		fs.bfree(blk)
	}
}
